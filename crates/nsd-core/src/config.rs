//! Configuration for the discovery daemon.
//!
//! The config file lives at a platform-appropriate location:
//! - Linux: `~/.config/nsdd/config.toml`
//! - macOS: `~/Library/Application Support/nsdd/config.toml`
//!
//! The daemon reads it with [`DaemonConfig::load_or_init`], which writes a
//! default file on first run so the flag keys are discoverable by
//! operators.
//!
//! # Config File Format (TOML)
//!
//! ```toml
//! cleanup_delay_ms = 10000
//!
//! [flags]
//! mdns_discovery_manager_version = false
//! mdns_advertiser_version = false
//! mdns_type_allowlist_flags = "_foo._tcp:foo,_bar._udp:bar"
//! running_app_active_importance_cutoff = 100
//!
//! [flags.discovery_allowlist]
//! foo = true
//!
//! [flags.advertiser_allowlist]
//! foo = false
//! ```
//!
//! `mdns_type_allowlist_flags` maps service types to tags; a tag's entry in
//! `discovery_allowlist`/`advertiser_allowlist` then switches that type to
//! the modern backend for the corresponding verbs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default delay before stopping the idle helper daemon, in milliseconds.
pub const DEFAULT_CLEANUP_DELAY_MS: u64 = 10_000;

/// Default importance cutoff: processes at or below this importance count
/// as active for multicast-lock purposes (100 = foreground).
pub const DEFAULT_IMPORTANCE_CUTOFF: i32 = 100;

/// Why the daemon could not come up with a usable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not a valid nsdd config: {source}")]
    Invalid {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("default config does not serialize: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("no home directory, cannot locate the config file")]
    NoHome,
}

/// Backend feature flags, mirrored from the platform's device config keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Route discovery and resolution to the modern engine for everyone.
    #[serde(default)]
    pub mdns_discovery_manager_version: bool,

    /// Route advertising to the modern engine for everyone.
    #[serde(default)]
    pub mdns_advertiser_version: bool,

    /// Comma-separated `type:tag` pairs, e.g. `_foo._tcp:foo`.
    #[serde(default)]
    pub mdns_type_allowlist_flags: String,

    /// Per-tag switch for discovery/resolution on the modern engine.
    #[serde(default)]
    pub discovery_allowlist: BTreeMap<String, bool>,

    /// Per-tag switch for advertising on the modern engine.
    #[serde(default)]
    pub advertiser_allowlist: BTreeMap<String, bool>,

    /// Processes at or below this importance count as active uids.
    #[serde(default = "default_importance_cutoff")]
    pub running_app_active_importance_cutoff: i32,
}

fn default_importance_cutoff() -> i32 {
    DEFAULT_IMPORTANCE_CUTOFF
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            mdns_discovery_manager_version: false,
            mdns_advertiser_version: false,
            mdns_type_allowlist_flags: String::new(),
            discovery_allowlist: BTreeMap::new(),
            advertiser_allowlist: BTreeMap::new(),
            running_app_active_importance_cutoff: DEFAULT_IMPORTANCE_CUTOFF,
        }
    }
}

/// The persisted configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Delay before stopping the idle helper daemon.
    #[serde(default = "default_cleanup_delay")]
    pub cleanup_delay_ms: u64,

    /// Optional: path of the helper daemon's control socket. Defaults to
    /// `mdnsd.sock` next to our own socket.
    #[serde(default)]
    pub mdnsd_socket: Option<PathBuf>,

    /// Optional: restrict the modern engine to this network interface
    /// (e.g. "enp5s0"). If not set, the default-route interface is
    /// auto-detected.
    #[serde(default)]
    pub network_interface: Option<String>,

    /// Backend routing flags.
    #[serde(default)]
    pub flags: FeatureFlags,
}

fn default_cleanup_delay() -> u64 {
    DEFAULT_CLEANUP_DELAY_MS
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cleanup_delay_ms: DEFAULT_CLEANUP_DELAY_MS,
            mdnsd_socket: None,
            network_interface: None,
            flags: FeatureFlags::default(),
        }
    }
}

impl DaemonConfig {
    /// Where the config file lives unless overridden on the command line.
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        let base = dirs::config_dir().ok_or(ConfigError::NoHome)?;
        Ok(base.join("nsdd").join("config.toml"))
    }

    /// Directory for the daemon's log file, if the platform has one.
    pub fn log_dir() -> Option<PathBuf> {
        Some(dirs::data_dir()?.join("nsdd"))
    }

    /// Where clients look for the daemon's socket.
    ///
    /// Sockets belong in the per-user runtime directory; when the platform
    /// has none (headless service accounts, containers), fall back to a
    /// per-user name under the system temp directory.
    pub fn default_socket_path() -> PathBuf {
        match dirs::runtime_dir() {
            Some(dir) => dir.join("nsdd.sock"),
            None => {
                let user = std::env::var("USER").unwrap_or_else(|_| "shared".to_string());
                std::env::temp_dir().join(format!("nsdd-{user}.sock"))
            }
        }
    }

    /// The helper daemon's control socket: configured explicitly, or
    /// `mdnsd.sock` sitting next to our own socket.
    pub fn mdnsd_socket_path(&self) -> PathBuf {
        self.mdnsd_socket.clone().unwrap_or_else(|| {
            let mut path = Self::default_socket_path();
            path.set_file_name("mdnsd.sock");
            path
        })
    }

    /// Reads the config at `path`, writing a default file on first run.
    ///
    /// The boolean is true when the file was just created. A file that
    /// exists but does not parse is an error, not a silent fallback: a
    /// typo in a flag key must not quietly flip backends.
    pub fn load_or_init(path: &Path) -> Result<(Self, bool), ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let config = toml::from_str(&text).map_err(|e| ConfigError::Invalid {
                    path: path.to_owned(),
                    source: e,
                })?;
                Ok((config, false))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.write_to(path)?;
                Ok((config, true))
            }
            Err(e) => Err(ConfigError::Io {
                path: path.to_owned(),
                source: e,
            }),
        }
    }

    /// Serializes this config to `path`, creating missing parent
    /// directories along the way.
    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_owned(),
                source: e,
            })?;
        }
        std::fs::write(path, text).map_err(|e| ConfigError::Io {
            path: path.to_owned(),
            source: e,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn written_config_reads_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let mut config = DaemonConfig {
            cleanup_delay_ms: 2_000,
            ..Default::default()
        };
        config.flags.mdns_discovery_manager_version = true;
        config.flags.mdns_type_allowlist_flags = "_foo._tcp:foo".to_string();
        config.flags.discovery_allowlist.insert("foo".to_string(), true);
        config.write_to(&path).unwrap();

        let (loaded, created) = DaemonConfig::load_or_init(&path).unwrap();
        assert!(!created);
        assert_eq!(loaded.cleanup_delay_ms, 2_000);
        assert!(loaded.flags.mdns_discovery_manager_version);
        assert_eq!(loaded.flags.mdns_type_allowlist_flags, "_foo._tcp:foo");
        assert_eq!(loaded.flags.discovery_allowlist.get("foo"), Some(&true));
    }

    #[test]
    fn first_run_writes_the_default_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deep").join("nested").join("config.toml");

        let (config, created) = DaemonConfig::load_or_init(&path).unwrap();
        assert!(created);
        assert!(path.exists(), "default file must be persisted");
        assert_eq!(config.cleanup_delay_ms, DEFAULT_CLEANUP_DELAY_MS);

        // The second run picks the file up instead of recreating it.
        let (_, created) = DaemonConfig::load_or_init(&path).unwrap();
        assert!(!created);
    }

    #[test]
    fn malformed_config_is_an_error_not_a_fallback() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "cleanup_delay_ms = \"soon\"").unwrap();
        match DaemonConfig::load_or_init(&path) {
            Err(ConfigError::Invalid { .. }) => {}
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn empty_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "").unwrap();
        let (loaded, created) = DaemonConfig::load_or_init(&path).unwrap();
        assert!(!created);
        assert_eq!(loaded.cleanup_delay_ms, DEFAULT_CLEANUP_DELAY_MS);
        assert_eq!(
            loaded.flags.running_app_active_importance_cutoff,
            DEFAULT_IMPORTANCE_CUTOFF
        );
        assert!(!loaded.flags.mdns_advertiser_version);
    }

    #[test]
    fn mdnsd_socket_path_defaults_next_to_socket() {
        let config = DaemonConfig::default();
        let path = config.mdnsd_socket_path();
        assert_eq!(path.file_name().unwrap(), "mdnsd.sock");

        let explicit = DaemonConfig {
            mdnsd_socket: Some(PathBuf::from("/run/mdnsd.ctl")),
            ..Default::default()
        };
        assert_eq!(explicit.mdnsd_socket_path(), PathBuf::from("/run/mdnsd.ctl"));
    }
}
