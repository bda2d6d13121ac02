//! WebDAV protocol core.
//!
//! Synchronous building blocks for a WebDAV (RFC 4918) server: path
//! resolution, a storage abstraction with local-disk and in-memory
//! backends, write locks, live and dead properties, and a dispatcher that
//! turns requests into responses. HTTP transport lives in `oxdav-server`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use oxdav_core::{DavConfig, DavRequest, Dispatcher, LocalStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = LocalStore::open("/srv/dav")?;
//! let dav = Dispatcher::new(Arc::new(store), DavConfig::default())?;
//! let response = dav.handle(DavRequest::new(http::Method::GET, "/readme.txt"));
//! println!("{}", response.status);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod conditions;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod lock;
pub mod multistatus;
pub mod path;
pub mod props;
pub mod store;
pub mod xml;

pub use auth::{Access, AllowAll, Authorizer};
pub use config::DavConfig;
pub use dispatch::{
    CancelFlag, DavMethod, DavRequest, DavResponse, Dispatcher, RequestBody, ResponseBody,
};
pub use error::{ConfigError, DavError, DavResult};
pub use lock::{Clock, LockManager, ManualClock, SystemClock};
pub use path::{CanonicalPath, PathResolver};
pub use props::{PropName, PropValue, PropertyDb, PropertyEngine};
pub use store::{Depth, EntityTag, LocalStore, MemoryStore, ResourceMeta, ResourceStore};
