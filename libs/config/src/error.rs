//! Error types for configuration loading.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read the config file.
    #[error("error reading config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Content is not valid JSON for the expected shape.
    #[error("error loading config: {0}")]
    Parse(#[from] serde_json::Error),

    /// An app has an empty name.
    #[error("invalid configuration - app at index {index} has an empty name")]
    EmptyName { index: usize },

    /// Two apps share a name.
    #[error("invalid configuration - duplicate app name {0:?}")]
    DuplicateApp(String),

    /// An app has no frontend ports.
    #[error("invalid configuration - app {0:?} has no ports")]
    NoPorts(String),

    /// A port is outside the valid TCP range.
    #[error("invalid configuration - app {app:?} has out of range port {port}")]
    InvalidPort { app: String, port: i64 },

    /// A port is claimed by more than one app.
    #[error("invalid configuration - duplicate port {port} (apps {first:?} and {second:?})")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    /// File watcher failure.
    #[error("error watching config file: {0}")]
    Watch(#[from] notify::Error),
}

impl ConfigError {
    /// Returns true if the error comes from the content of the file rather
    /// than from reading or watching it.
    pub fn is_invalid_content(&self) -> bool {
        !matches!(self, ConfigError::Read { .. } | ConfigError::Watch(_))
    }
}
