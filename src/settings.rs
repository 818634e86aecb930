//! Host-level settings loading and defaults.
//!
//! These settings only locate files and tune logging — the tunnel
//! declarations themselves live in the encrypted store
//! (see [`crate::store`]). Resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `MIGNON_CONFIG_PATH`, `MIGNON_LOG_DIR`
//! 2. **Settings file** — path via `--config <path>`, or `mignon.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [storage]
//! config_path = "./resources/config/mignon_ssh_config.rex"
//!
//! [logging]
//! level = "info"
//! dir = "./resources/log"
//! file = "app.log"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level host settings, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Location of the encrypted tunnel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Path of the hex-encoded encrypted config blob
    /// (default `./resources/config/mignon_ssh_config.rex`).
    #[serde(default = "default_config_path")]
    pub config_path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for rolling log files (default `./resources/log`).
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Log file name prefix (default `app.log`).
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_config_path() -> String {
    "./resources/config/mignon_ssh_config.rex".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    "./resources/log".to_string()
}
fn default_log_file() -> String {
    "app.log".to_string()
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
            file: default_log_file(),
        }
    }
}

impl Settings {
    /// Load settings with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file and fails loudly on a parse
    /// error. Otherwise looks for `mignon.toml` in the current directory,
    /// falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, SettingsError> {
        let mut settings = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .map_err(|e| SettingsError::Read(p.to_string(), e))?;
            toml::from_str(&content).map_err(|e| SettingsError::Parse(p.to_string(), e))?
        } else if Path::new("mignon.toml").exists() {
            let content = std::fs::read_to_string("mignon.toml")
                .map_err(|e| SettingsError::Read("mignon.toml".to_string(), e))?;
            toml::from_str(&content)
                .map_err(|e| SettingsError::Parse("mignon.toml".to_string(), e))?
        } else {
            Settings::default()
        };

        // Env var overrides
        if let Ok(p) = std::env::var("MIGNON_CONFIG_PATH") {
            settings.storage.config_path = p;
        }
        if let Ok(d) = std::env::var("MIGNON_LOG_DIR") {
            settings.logging.dir = d;
        }

        Ok(settings)
    }
}

/// Failure to read or parse the settings file.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {0}: {1}")]
    Read(String, #[source] std::io::Error),
    #[error("failed to parse settings file {0}: {1}")]
    Parse(String, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(
            s.storage.config_path,
            "./resources/config/mignon_ssh_config.rex"
        );
        assert_eq!(s.logging.level, "info");
        assert_eq!(s.logging.dir, "./resources/log");
        assert_eq!(s.logging.file, "app.log");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let s: Settings = toml::from_str("[logging]\nlevel = \"debug\"\n").unwrap();
        assert_eq!(s.logging.level, "debug");
        assert_eq!(s.logging.file, "app.log");
        assert_eq!(
            s.storage.config_path,
            "./resources/config/mignon_ssh_config.rex"
        );
    }

    #[test]
    fn test_parse_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mignon.toml");
        std::fs::write(&path, "not valid toml [").unwrap();
        let err = Settings::load(Some(path.to_str().unwrap())).unwrap_err();
        assert!(matches!(err, SettingsError::Parse(_, _)));
    }
}
