//! Configuration file handling.
//!
//! The file is TOML:
//!
//! ```toml
//! root = "/srv/dav"
//!
//! [dav]
//! prefix = "/files"
//! read_only = false
//! default_lock_timeout = "10m"
//!
//! [server]
//! port = 8080
//! reaper_interval = "30s"
//! ```
//!
//! Every key is optional. Command-line flags override file values.

use anyhow::{Context, Result};
use clap::Args;
use oxdav_core::DavConfig;
use oxdav_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Everything `oxdav serve` needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Directory to serve.
    pub root: Option<PathBuf>,
    pub dav: DavConfig,
    pub server: ServerConfig,
}

impl FileConfig {
    /// Load a config file; `None` yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

/// Flags shared by `serve` and `config`.
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Directory to serve (omit with --memory)
    #[arg(value_name = "ROOT")]
    pub root: Option<PathBuf>,

    /// Serve an empty in-memory tree instead of a directory
    #[arg(long, conflicts_with = "root")]
    pub memory: bool,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE", env = "OXDAV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, env = "OXDAV_BIND")]
    pub bind: Option<IpAddr>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, env = "OXDAV_PORT")]
    pub port: Option<u16>,

    /// URI prefix to mount the tree under
    #[arg(long)]
    pub prefix: Option<String>,

    /// Refuse all modifications
    #[arg(long)]
    pub read_only: bool,

    /// List dot-files
    #[arg(long)]
    pub show_hidden: bool,

    /// Reject PROPFIND with Depth: infinity
    #[arg(long)]
    pub no_infinite_depth: bool,

    /// JSON file for dead properties
    #[arg(long, value_name = "FILE")]
    pub props: Option<PathBuf>,

    /// Trusted header naming the authenticated user
    #[arg(long, value_name = "HEADER")]
    pub principal_header: Option<String>,
}

impl ServeArgs {
    /// Load the config file (if any) and apply the flags on top.
    pub fn resolve(&self) -> Result<FileConfig> {
        let mut config = FileConfig::load(self.config.as_deref())?;
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut FileConfig) {
        if self.memory {
            config.root = None;
        } else if let Some(root) = &self.root {
            config.root = Some(root.clone());
        }
        if let Some(bind) = self.bind {
            config.server.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(prefix) = &self.prefix {
            config.dav.prefix.clone_from(prefix);
        }
        if self.read_only {
            config.dav.read_only = true;
        }
        if self.show_hidden {
            config.dav.show_hidden = true;
        }
        if self.no_infinite_depth {
            config.dav.allow_infinite_depth = false;
        }
        if let Some(props) = &self.props {
            config.dav.property_db = Some(props.clone());
        }
        if let Some(header) = &self.principal_header {
            config.server.principal_header = Some(header.clone());
        }
    }
}
