//! Config file reading and change notification.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::types::Config;

/// Default routing file location.
pub const DEFAULT_CONFIG_PATH: &str = "./config.json";

/// Buffered snapshots between the watcher thread and the consumer.
const UPDATE_CHANNEL_CAPACITY: usize = 16;

/// Stream of validated snapshots produced on file writes.
pub type ConfigWatch = mpsc::Receiver<Config>;

/// Manages reading and watching a routing file.
pub struct ConfigStore {
    path: PathBuf,
    watcher: Option<RecommendedWatcher>,
}

impl ConfigStore {
    /// Create a store for the given file. Nothing is read until [`read`](Self::read).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            watcher: None,
        }
    }

    /// Path of the routing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate the routing file.
    pub fn read(&self) -> Result<Config, ConfigError> {
        Config::from_file(&self.path)
    }

    /// Begin monitoring the routing file for writes.
    ///
    /// The parent directory is watched rather than the file itself so that
    /// editors which replace the file by rename are still observed. Every
    /// write that yields a valid snapshot different from the previously
    /// emitted one is sent on the returned channel. Invalid content is logged
    /// and dropped. The channel closes when [`close`](Self::close) is called
    /// or the store is dropped.
    pub fn start_watcher(&mut self) -> Result<ConfigWatch, ConfigError> {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);

        let path = self.path.clone();
        let file_name: Option<OsString> = path.file_name().map(|n| n.to_os_string());
        let watch_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut last_sent: Option<Config> = None;
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %ConfigError::Watch(e), "Config watch error");
                    return;
                }
            };

            if !(event.kind.is_modify() || event.kind.is_create()) {
                return;
            }
            let touches_config = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if !touches_config {
                return;
            }

            debug!(path = %path.display(), kind = ?event.kind, "Config file modified");

            match Config::from_file(&path) {
                Ok(cfg) => {
                    if last_sent.as_ref() == Some(&cfg) {
                        return;
                    }
                    last_sent = Some(cfg.clone());
                    if tx.blocking_send(cfg).is_err() {
                        debug!("Config update receiver dropped");
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring invalid config update");
                }
            }
        })?;

        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        self.watcher = Some(watcher);

        info!(path = %self.path.display(), "Watching config file");
        Ok(rx)
    }

    /// Stop monitoring for changes.
    pub fn close(&mut self) {
        if self.watcher.take().is_some() {
            info!(path = %self.path.display(), "Stopped watching config file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    const WEB: &str = r#"{"Apps": [{"Name": "web", "Ports": [8080], "Targets": ["127.0.0.1:80"]}]}"#;
    const WEB_AND_DB: &str = r#"{"Apps": [
        {"Name": "web", "Ports": [8080], "Targets": ["127.0.0.1:80"]},
        {"Name": "db", "Ports": [5432], "Targets": ["127.0.0.1:5432"]}
    ]}"#;

    #[test]
    fn test_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, WEB).unwrap();

        let store = ConfigStore::new(&path);
        let cfg = store.read().unwrap();
        assert_eq!(cfg.apps.len(), 1);
        assert_eq!(cfg.apps[0].name, "web");
    }

    #[tokio::test]
    async fn test_watcher_emits_valid_updates_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, WEB).unwrap();

        let mut store = ConfigStore::new(&path);
        let mut updates = store.start_watcher().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::write(&path, r#"{"Apps": [{"Name": "x", "Ports": []}]}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::write(&path, WEB_AND_DB).unwrap();

        let cfg = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("timed out waiting for config update")
            .expect("watch channel closed");
        assert_eq!(cfg.apps.len(), 2);
        assert!(cfg.app("db").is_some());

        store.close();
    }

    #[tokio::test]
    async fn test_unrelated_file_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, WEB).unwrap();

        let mut store = ConfigStore::new(&path);
        let mut updates = store.start_watcher().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::write(dir.path().join("other.json"), WEB_AND_DB).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(300), updates.recv()).await;
        assert!(result.is_err(), "unexpected update for unrelated file");
    }
}
