//! Routing configuration types.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File format as written by operators, before validation. Keys are
/// accepted capitalised or lowercase.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "Apps", alias = "apps")]
    apps: Vec<RawApp>,
}

#[derive(Debug, Deserialize)]
struct RawApp {
    #[serde(rename = "Name", alias = "name", default)]
    name: String,
    #[serde(rename = "Ports", alias = "ports", default)]
    ports: Vec<i64>,
    #[serde(rename = "Targets", alias = "targets", default)]
    targets: Vec<String>,
}

/// A validated routing snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Config {
    /// Configured apps, in file order.
    #[serde(rename = "Apps")]
    pub apps: Vec<App>,
}

/// Configuration for a single app.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct App {
    /// Friendly name, also used to scope kernel object pin paths.
    #[serde(rename = "Name")]
    pub name: String,
    /// Frontend ports. The first is bound; the rest are declared to the
    /// kernel dispatcher only.
    #[serde(rename = "Ports")]
    pub ports: Vec<u16>,
    /// Backend targets as `host:port`.
    #[serde(rename = "Targets")]
    pub targets: Vec<String>,
}

impl App {
    /// Create a new app.
    pub fn new(name: impl Into<String>, ports: Vec<u16>, targets: Vec<String>) -> Self {
        Self {
            name: name.into(),
            ports,
            targets,
        }
    }

    /// The port the listener binds to.
    pub fn primary_port(&self) -> Option<u16> {
        self.ports.first().copied()
    }

    /// Ports declared to the kernel dispatcher but not listened on.
    pub fn extra_ports(&self) -> &[u16] {
        self.ports.get(1..).unwrap_or(&[])
    }
}

impl Config {
    /// Parse and validate a JSON routing document.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(content)?;
        Self::validate(raw)
    }

    /// Read, parse and validate a routing file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Look up an app by name.
    pub fn app(&self, name: &str) -> Option<&App> {
        self.apps.iter().find(|a| a.name == name)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut names: HashSet<String> = HashSet::new();
        let mut port_owners: HashMap<u16, String> = HashMap::new();
        let mut apps = Vec::with_capacity(raw.apps.len());

        for (index, raw_app) in raw.apps.into_iter().enumerate() {
            if raw_app.name.is_empty() {
                return Err(ConfigError::EmptyName { index });
            }
            if !names.insert(raw_app.name.clone()) {
                return Err(ConfigError::DuplicateApp(raw_app.name));
            }
            if raw_app.ports.is_empty() {
                return Err(ConfigError::NoPorts(raw_app.name));
            }

            let mut ports = Vec::with_capacity(raw_app.ports.len());
            for raw_port in raw_app.ports {
                let port = match u16::try_from(raw_port) {
                    Ok(p) if p != 0 => p,
                    _ => {
                        return Err(ConfigError::InvalidPort {
                            app: raw_app.name,
                            port: raw_port,
                        })
                    }
                };

                if let Some(first) = port_owners.get(&port) {
                    return Err(ConfigError::DuplicatePort {
                        port,
                        first: first.clone(),
                        second: raw_app.name,
                    });
                }
                port_owners.insert(port, raw_app.name.clone());
                ports.push(port);
            }

            apps.push(App {
                name: raw_app.name,
                ports,
                targets: raw_app.targets,
            });
        }

        Ok(Self { apps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_valid_config() {
        let cfg = Config::parse(
            r#"{"Apps": [
                {"Name": "web", "Ports": [8080, 9090], "Targets": ["10.0.0.1:80", "10.0.0.2:80"]},
                {"Name": "db", "Ports": [5432], "Targets": ["db.internal:5432"]}
            ]}"#,
        )
        .unwrap();

        assert_eq!(cfg.apps.len(), 2);
        let web = cfg.app("web").unwrap();
        assert_eq!(web.primary_port(), Some(8080));
        assert_eq!(web.extra_ports(), &[9090]);
        assert_eq!(web.targets, vec!["10.0.0.1:80", "10.0.0.2:80"]);

        let db = cfg.app("db").unwrap();
        assert!(db.extra_ports().is_empty());
    }

    #[test]
    fn test_empty_apps_is_valid() {
        assert_eq!(Config::parse(r#"{"Apps": []}"#).unwrap(), Config::default());
    }

    #[test]
    fn test_lowercase_keys_accepted() {
        let cfg = Config::parse(
            r#"{"apps": [{"name": "web", "ports": [8080], "targets": ["10.0.0.1:80"]}]}"#,
        )
        .unwrap();

        assert_eq!(
            cfg.apps,
            vec![App::new("web", vec![8080], vec!["10.0.0.1:80".to_string()])]
        );
    }

    #[rstest]
    #[case("{}")]
    #[case(r#"{"Applications": [{"Name": "web", "Ports": [8080]}]}"#)]
    fn test_missing_apps_key_rejected(#[case] content: &str) {
        let err = Config::parse(content).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "unexpected error: {err}");
        assert!(err.is_invalid_content());
    }

    #[test]
    fn test_duplicate_port_across_apps() {
        let err = Config::parse(
            r#"{"Apps": [
                {"Name": "a", "Ports": [80], "Targets": []},
                {"Name": "b", "Ports": [81, 80], "Targets": []}
            ]}"#,
        )
        .unwrap_err();

        match err {
            ConfigError::DuplicatePort {
                port,
                first,
                second,
            } => {
                assert_eq!(port, 80);
                assert_eq!(first, "a");
                assert_eq!(second, "b");
            }
            other => panic!("Expected DuplicatePort, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_port_within_app() {
        let err = Config::parse(r#"{"Apps": [{"Name": "a", "Ports": [80, 80]}]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePort { port: 80, .. }));
    }

    #[rstest]
    #[case(r#"{"Apps": [{"Name": "", "Ports": [80]}]}"#)]
    #[case(r#"{"Apps": [{"Name": "a", "Ports": []}]}"#)]
    #[case(r#"{"Apps": [{"Name": "a", "Ports": [0]}]}"#)]
    #[case(r#"{"Apps": [{"Name": "a", "Ports": [65536]}]}"#)]
    #[case(r#"{"Apps": [{"Name": "a", "Ports": [-1]}]}"#)]
    #[case(r#"{"Apps": [{"Name": "a", "Ports": [1]}, {"Name": "a", "Ports": [2]}]}"#)]
    #[case(r#"{"Apps": "#)]
    fn test_invalid_content_rejected(#[case] content: &str) {
        let err = Config::parse(content).unwrap_err();
        assert!(err.is_invalid_content(), "unexpected error kind: {err}");
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/skproxy/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(!err.is_invalid_content());
    }
}
