//! Core configuration.
//!
//! Loaded by the CLI from the `[dav]` table of its TOML file; every field
//! has a default so an empty table is valid.

use crate::error::ConfigError;
use crate::path::PathResolver;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Lock timeout used when the client does not ask for one (10 minutes).
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

/// Longest lock timeout ever granted (1 hour). `Infinite` is capped here.
pub const MAX_LOCK_TIMEOUT: Duration = Duration::from_secs(3600);

/// Behavior of the protocol core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DavConfig {
    /// URI prefix the tree is mounted under (`/` serves the whole URI space).
    pub prefix: String,

    /// Refuse every mutating method with 405.
    pub read_only: bool,

    /// Include dot-files in listings.
    pub show_hidden: bool,

    /// Honor `Depth: infinity` on PROPFIND. When off such requests get 403.
    pub allow_infinite_depth: bool,

    #[serde(with = "humantime_serde")]
    pub default_lock_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub max_lock_timeout: Duration,

    /// JSON file holding dead properties. In-memory only when unset.
    pub property_db: Option<PathBuf>,
}

impl Default for DavConfig {
    fn default() -> Self {
        Self {
            prefix: "/".to_string(),
            read_only: false,
            show_hidden: false,
            allow_infinite_depth: true,
            default_lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_lock_timeout: MAX_LOCK_TIMEOUT,
            property_db: None,
        }
    }
}

impl DavConfig {
    /// Check the configuration and build the resolver for its prefix.
    pub fn validate(&self) -> Result<PathResolver, ConfigError> {
        if self.default_lock_timeout > self.max_lock_timeout || self.max_lock_timeout.is_zero() {
            return Err(ConfigError::LockTimeouts {
                default: self.default_lock_timeout,
                max: self.max_lock_timeout,
            });
        }
        PathResolver::with_prefix(&self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = DavConfig::default();
        let resolver = config.validate().unwrap();
        assert!(resolver.prefix().is_root());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DavConfig =
            serde_json::from_str(r#"{"prefix": "/dav", "default_lock_timeout": "2m"}"#).unwrap();
        assert_eq!(config.prefix, "/dav");
        assert_eq!(config.default_lock_timeout, Duration::from_secs(120));
        assert_eq!(config.max_lock_timeout, MAX_LOCK_TIMEOUT);
        assert!(config.allow_infinite_depth);
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = DavConfig {
            default_lock_timeout: Duration::from_secs(7200),
            ..DavConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::LockTimeouts { .. })));

        let config = DavConfig {
            prefix: "dav".to_string(),
            ..DavConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPrefix { .. })));
    }
}
