//! Process configuration (env-driven).
//!
//! Routing itself lives in the JSON config file; these settings control how
//! the process runs it.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use skp_config::DEFAULT_CONFIG_PATH;
use skp_dispatch::{DispatchConfig, DEFAULT_NETNS_PATH, DEFAULT_PIN_ROOT};
use skp_proxy::{ListenerConfig, OrchestratorConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_PROBE_TIMEOUT};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Proxy process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Routing file path.
    pub config_path: PathBuf,

    /// IP the app listeners bind on.
    pub bind_ip: IpAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Attach kernel dispatch for each app.
    pub dispatch_enabled: bool,

    /// bpffs pin root.
    pub pin_root: PathBuf,

    /// Dispatch image override.
    pub dispatch_image: Option<PathBuf>,

    /// Max concurrent connections per listener.
    pub max_connections: usize,

    /// Connection idle timeout. `None` disables it.
    pub idle_timeout: Option<Duration>,

    /// Time apps get to stop before they are aborted.
    pub shutdown_grace: Duration,

    /// Watch the routing file for changes.
    pub watch: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config_path = lookup("SKPROXY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let bind_ip: IpAddr = parse(&lookup, "SKPROXY_BIND_IP", "an IP address")?
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));

        let log_level = lookup("SKPROXY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let log_format = match lookup("SKPROXY_LOG_FORMAT").as_deref() {
            None | Some("json") => LogFormat::Json,
            Some("pretty") => LogFormat::Pretty,
            Some(other) => anyhow::bail!("SKPROXY_LOG_FORMAT must be json or pretty, got {other:?}."),
        };

        let dispatch_enabled = flag(&lookup, "SKPROXY_DISPATCH_ENABLED", true);

        let pin_root = lookup("SKPROXY_PIN_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PIN_ROOT));

        let dispatch_image = lookup("SKPROXY_DISPATCH_IMAGE").map(PathBuf::from);

        let max_connections: usize = parse(&lookup, "SKPROXY_MAX_CONNECTIONS", "an integer")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let idle_timeout_secs: u64 =
            parse(&lookup, "SKPROXY_IDLE_TIMEOUT_SECS", "an integer (seconds)")?.unwrap_or(300);
        let idle_timeout = (idle_timeout_secs > 0).then(|| Duration::from_secs(idle_timeout_secs));

        let shutdown_grace_ms: u64 = parse(
            &lookup,
            "SKPROXY_SHUTDOWN_GRACE_MS",
            "an integer (milliseconds)",
        )?
        .unwrap_or(5000);

        let watch = flag(&lookup, "SKPROXY_WATCH", true);

        Ok(Self {
            config_path,
            bind_ip,
            log_level,
            log_format,
            dispatch_enabled,
            pin_root,
            dispatch_image,
            max_connections,
            idle_timeout,
            shutdown_grace: Duration::from_millis(shutdown_grace_ms),
            watch,
        })
    }

    /// Settings for the orchestrator.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            listener: ListenerConfig {
                bind_ip: self.bind_ip,
                max_connections: self.max_connections,
                idle_timeout: self.idle_timeout,
                connect_timeout: DEFAULT_PROBE_TIMEOUT,
            },
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            shutdown_grace: self.shutdown_grace,
        }
    }

    /// Settings for the dispatch manager, if dispatch is enabled.
    pub fn dispatch(&self) -> Option<DispatchConfig> {
        self.dispatch_enabled.then(|| DispatchConfig {
            pin_root: self.pin_root.clone(),
            image_path: self.dispatch_image.clone(),
            netns_path: PathBuf::from(DEFAULT_NETNS_PATH),
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    expected: &str,
) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|v| v.parse::<T>())
        .transpose()
        .with_context(|| format!("{key} must be {expected}."))
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.config_path, PathBuf::from("./config.json"));
        assert_eq!(config.bind_ip.to_string(), "0.0.0.0");
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.dispatch_enabled);
        assert_eq!(config.pin_root, PathBuf::from("/sys/fs/bpf"));
        assert_eq!(config.max_connections, 10000);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert!(config.watch);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("SKPROXY_BIND_IP", "127.0.0.1"),
            ("SKPROXY_LOG_FORMAT", "pretty"),
            ("SKPROXY_DISPATCH_ENABLED", "false"),
            ("SKPROXY_IDLE_TIMEOUT_SECS", "0"),
            ("SKPROXY_DISPATCH_IMAGE", "/opt/skproxy/echo_dispatch.bpf.o"),
        ])
        .unwrap();
        assert_eq!(config.bind_ip.to_string(), "127.0.0.1");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.dispatch().is_none());
        assert_eq!(config.idle_timeout, None);
        assert_eq!(
            config.dispatch_image,
            Some(PathBuf::from("/opt/skproxy/echo_dispatch.bpf.o"))
        );
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("SKPROXY_BIND_IP", "localhost")]).is_err());
        assert!(load(&[("SKPROXY_MAX_CONNECTIONS", "many")]).is_err());
        assert!(load(&[("SKPROXY_LOG_FORMAT", "xml")]).is_err());
    }
}
