//! HTTP transport for the oxdav protocol core.
//!
//! The core is synchronous and knows nothing about sockets. This crate:
//! 1. Accepts connections with hyper (HTTP/1.1 and HTTP/2)
//! 2. Turns each request into a [`DavRequest`](oxdav_core::DavRequest) whose
//!    body streams from the connection
//! 3. Runs the [`Dispatcher`](oxdav_core::Dispatcher) on tokio's blocking pool
//! 4. Streams the response back, including file content read from the store
//!
//! A background reaper purges expired locks and idle resource guards.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use oxdav_core::{DavConfig, Dispatcher, LocalStore};
//! use oxdav_server::{ServerConfig, WebDavServer};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(LocalStore::open("/srv/dav")?);
//! let dav = Arc::new(Dispatcher::new(store, DavConfig::default())?);
//! let server = WebDavServer::start(dav, ServerConfig::default()).await?;
//! println!("serving on {}", server.url());
//! server.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! By default, the server binds to localhost (127.0.0.1) only. There is no
//! authentication; a fronting proxy may pass a principal in a trusted header
//! (see [`ServerConfig::principal_header`]).

mod body;
mod server;

pub use body::DavBody;
pub use server::{ServerConfig, WebDavServer};
