//! Driver configuration.
//!
//! Settings live in `config.toml` under the platform config directory:
//!
//! ```toml
//! rmapi = "/usr/local/bin/rmapi"
//! export_path = "calibre_export"
//! timeout_secs = 1000
//! capacity_command = "ssh reMarkable df .local/share/remarkable/xochitl/"
//! ```
//!
//! Layers, lowest first: built-in defaults, the file, then `RMDEV_*`
//! environment variables (a `.env` file is honoured). The device never reads
//! this module's state implicitly; it receives a [`DeviceConfig`] and gets a
//! new one through `save_settings`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_RMAPI: &str = "RMDEV_RMAPI";
pub const ENV_EXPORT_PATH: &str = "RMDEV_EXPORT_PATH";
pub const ENV_TIMEOUT_SECS: &str = "RMDEV_TIMEOUT_SECS";
pub const ENV_CAPACITY_COMMAND: &str = "RMDEV_CAPACITY_COMMAND";

const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors loading, validating or saving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything the driver needs to reach the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Path or name of the `rmapi` binary.
    pub rmapi: PathBuf,
    /// Remote folder books are uploaded into.
    pub export_path: String,
    /// Upper bound on any single external command.
    pub timeout_secs: u64,
    /// Shell-style command printing a `df` report for the tablet's storage.
    pub capacity_command: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            rmapi: PathBuf::from("rmapi"),
            export_path: "calibre_export".to_string(),
            timeout_secs: 1000,
            capacity_command: "ssh reMarkable df .local/share/remarkable/xochitl/".to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Export path without trailing slashes.
    pub fn export_dir(&self) -> &str {
        self.export_path.trim_end_matches('/')
    }

    /// Apply `RMDEV_*` overrides.
    pub fn apply_env(&mut self) {
        if let Ok(val) = dotenvy::var(ENV_RMAPI)
            && !val.trim().is_empty()
        {
            self.rmapi = PathBuf::from(val);
        }

        if let Ok(val) = dotenvy::var(ENV_EXPORT_PATH)
            && !val.trim().is_empty()
        {
            self.export_path = val;
        }

        if let Ok(val) = dotenvy::var(ENV_TIMEOUT_SECS) {
            match val.parse::<u64>() {
                Ok(secs) => self.timeout_secs = secs,
                Err(_) => tracing::warn!(value = %val, "ignoring unparseable {ENV_TIMEOUT_SECS}"),
            }
        }

        if let Ok(val) = dotenvy::var(ENV_CAPACITY_COMMAND)
            && !val.trim().is_empty()
        {
            self.capacity_command = val;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rmapi.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("rmapi path is empty".into()));
        }
        let export = self.export_dir();
        if export.is_empty() {
            return Err(ConfigError::Invalid("export_path is empty".into()));
        }
        if export.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "export_path must be relative to the document root: {export}"
            )));
        }
        if export.split('/').any(str::is_empty) {
            return Err(ConfigError::Invalid(format!(
                "export_path has an empty segment: {export}"
            )));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout_secs must be positive".into()));
        }
        match shell_words::split(&self.capacity_command) {
            Ok(words) if !words.is_empty() => Ok(()),
            Ok(_) => Err(ConfigError::Invalid("capacity_command is empty".into())),
            Err(e) => Err(ConfigError::Invalid(format!(
                "capacity_command is not valid shell syntax: {e}"
            ))),
        }
    }
}

/// Reads and writes `config.toml`.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the platform config location.
    pub fn at_default_location() -> Self {
        Self::new(default_config_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file layer only; a missing file yields defaults.
    pub fn load_file(&self) -> Result<DeviceConfig, ConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeviceConfig::default()),
            Err(source) => Err(ConfigError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Load file then environment layers and validate the result.
    pub fn load(&self) -> Result<DeviceConfig, ConfigError> {
        let mut config = self.load_file()?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Validate and persist.
    pub fn save(&self, config: &DeviceConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(config)?;
        std::fs::write(&self.path, content).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("org", "rmdev", "rmdev")
}

pub fn default_config_path() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from(CONFIG_FILE_NAME),
        |dirs| dirs.config_dir().join(CONFIG_FILE_NAME),
    )
}

pub fn default_data_dir() -> PathBuf {
    project_dirs().map_or_else(|| PathBuf::from("."), |dirs| dirs.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, val: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe { std::env::set_var(key, val) };
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(v) => unsafe { std::env::set_var(self.key, v) },
                None => unsafe { std::env::remove_var(self.key) },
            }
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.rmapi, PathBuf::from("rmapi"));
        assert_eq!(cfg.export_path, "calibre_export");
        assert_eq!(cfg.timeout(), Duration::from_secs(1000));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ConfigStore::new(tmp.path().join("nope").join("config.toml"));
        assert_eq!(store.load_file().unwrap(), DeviceConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "export_path = \"books/incoming\"\n").unwrap();
        let cfg = ConfigStore::new(&path).load_file().unwrap();
        assert_eq!(cfg.export_path, "books/incoming");
        assert_eq!(cfg.rmapi, PathBuf::from("rmapi"));
    }

    #[test]
    fn test_save_then_load_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ConfigStore::new(tmp.path().join("sub").join("config.toml"));
        let cfg = DeviceConfig {
            rmapi: PathBuf::from("/opt/rmapi"),
            export_path: "shelf".into(),
            timeout_secs: 30,
            capacity_command: "ssh tablet df /home".into(),
        };
        store.save(&cfg).unwrap();
        assert_eq!(store.load_file().unwrap(), cfg);
    }

    #[test]
    fn test_parse_error_names_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "timeout_secs = \"soon\"").unwrap();
        let err = ConfigStore::new(&path).load_file().unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = DeviceConfig {
            export_path: "/abs".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        cfg.export_path = "a//b".into();
        assert!(cfg.validate().is_err());
        cfg.export_path = "a/b/".into();
        assert!(cfg.validate().is_ok());
        cfg.timeout_secs = 0;
        assert!(cfg.validate().is_err());
        cfg.timeout_secs = 1;
        cfg.capacity_command = "ssh 'unterminated".into();
        assert!(cfg.validate().is_err());
        cfg.capacity_command = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_save_rejects_invalid() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ConfigStore::new(tmp.path().join("config.toml"));
        let cfg = DeviceConfig {
            export_path: String::new(),
            ..Default::default()
        };
        assert!(store.save(&cfg).is_err());
        assert!(!store.path().exists());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "rmapi = \"/from/file\"\ntimeout_secs = 5\n").unwrap();

        let _rmapi = EnvGuard::set(ENV_RMAPI, "/from/env");
        let _timeout = EnvGuard::set(ENV_TIMEOUT_SECS, "not-a-number");
        let _export = EnvGuard::set(ENV_EXPORT_PATH, "env_shelf");

        let cfg = ConfigStore::new(&path).load().unwrap();
        assert_eq!(cfg.rmapi, PathBuf::from("/from/env"));
        assert_eq!(cfg.timeout_secs, 5);
        assert_eq!(cfg.export_path, "env_shelf");
    }
}
