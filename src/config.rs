//! Server Configuration
//!
//! Settings come from an INI file. Only the `[Settings]` section (and any
//! keys placed before the first section header) is read, into a flat
//! string map, which is then turned into a typed [`ServerConfig`].
//!
//! ```ini
//! [Settings]
//! filename = bloom.bin
//! capacity = 100000
//! error_rate = 0.05
//! service_port = :1234
//! idle_timeout = 120
//! ```

use crate::DEFAULT_LISTEN_ADDR;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Config file read when none is given on the command line
pub const DEFAULT_CONFIG_FILE: &str = "./bloom_config.ini";

/// The section holding the server settings
pub const SETTINGS_SECTION: &str = "Settings";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("invalid value for '{key}': {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Parses INI text, keeping the keys of the settings section.
///
/// Accepts `key = value` and `key: value`; lines starting with `;` or `#`
/// are comments. Later keys override earlier ones.
pub fn parse_settings(text: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut settings = HashMap::new();
    let mut in_settings = true;

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let name = header.strip_suffix(']').ok_or_else(|| ConfigError::Syntax {
                line: index + 1,
                message: format!("unterminated section header {:?}", line),
            })?;
            in_settings = name.trim() == SETTINGS_SECTION;
            continue;
        }

        let split = line.find(['=', ':']).ok_or_else(|| ConfigError::Syntax {
            line: index + 1,
            message: format!("expected 'key = value', got {:?}", line),
        })?;
        let (key, value) = (line[..split].trim(), line[split + 1..].trim());
        if key.is_empty() {
            return Err(ConfigError::Syntax {
                line: index + 1,
                message: "empty key".to_string(),
            });
        }

        if in_settings {
            settings.insert(key.to_string(), value.to_string());
        }
    }

    Ok(settings)
}

/// Typed server settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Store file, loaded at startup if present and written by SAVE
    pub filename: PathBuf,
    /// Items per store stage
    pub capacity: u64,
    /// Target false-positive rate
    pub error_rate: f64,
    /// Listen address; `:port` means every IPv4 interface
    pub service_port: String,
    /// How long a connection may sit between requests
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            filename: PathBuf::from("bloom.bin"),
            capacity: 100_000,
            error_rate: 0.05,
            service_port: DEFAULT_LISTEN_ADDR.to_string(),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

impl ServerConfig {
    /// Builds a config from a flat settings map, falling back to defaults
    /// for missing keys.
    pub fn from_settings(settings: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = settings.get("filename") {
            if value.is_empty() {
                return Err(invalid("filename", value, "must not be empty"));
            }
            config.filename = PathBuf::from(value);
        }

        if let Some(value) = settings.get("capacity") {
            config.capacity = match value.parse::<u64>() {
                Ok(n) if n > 0 => n,
                Ok(_) => return Err(invalid("capacity", value, "must be greater than zero")),
                Err(e) => return Err(invalid("capacity", value, e)),
            };
        }

        if let Some(value) = settings.get("error_rate") {
            config.error_rate = match value.parse::<f64>() {
                Ok(rate) if rate > 0.0 && rate < 1.0 => rate,
                Ok(_) => return Err(invalid("error_rate", value, "must be between 0 and 1")),
                Err(e) => return Err(invalid("error_rate", value, e)),
            };
        }

        if let Some(value) = settings.get("service_port") {
            if value.is_empty() {
                return Err(invalid("service_port", value, "must not be empty"));
            }
            config.service_port = value.clone();
        }

        if let Some(value) = settings.get("idle_timeout") {
            config.idle_timeout = match value.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                Ok(_) => return Err(invalid("idle_timeout", value, "must be greater than zero")),
                Err(e) => return Err(invalid("idle_timeout", value, e)),
            };
        }

        Ok(config)
    }

    /// Loads the config file at `path`.
    ///
    /// A missing file is not an error: defaults are used and a warning is
    /// logged.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => Self::from_settings(&parse_settings(&text)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// The address to bind, with a bare `:port` expanded to `0.0.0.0:port`.
    pub fn listen_addr(&self) -> String {
        if self.service_port.starts_with(':') {
            format!("0.0.0.0{}", self.service_port)
        } else {
            self.service_port.clone()
        }
    }
}

fn invalid(key: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
