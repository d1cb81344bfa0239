//! Routing table and snapshot diffing.

use std::collections::BTreeMap;

use skp_config::{App, Config};

/// Apps keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    apps: BTreeMap<String, App>,
}

/// Difference between two routing tables.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RoutingDiff {
    /// Apps only in the new table.
    pub added: Vec<App>,
    /// Apps only in the old table.
    pub removed: Vec<String>,
    /// Apps in both tables whose ports or targets differ (new definition).
    pub changed: Vec<App>,
    /// Apps identical in both tables.
    pub unchanged: Vec<String>,
}

impl RoutingDiff {
    /// True when applying the diff would change nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_apps(apps: impl IntoIterator<Item = App>) -> Self {
        Self {
            apps: apps.into_iter().map(|a| (a.name.clone(), a)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&App> {
        self.apps.get(name)
    }

    pub fn apps(&self) -> impl Iterator<Item = &App> {
        self.apps.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.apps.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Compute what changes turn `self` into `next`. File order is ignored.
    pub fn diff(&self, next: &RoutingTable) -> RoutingDiff {
        let mut diff = RoutingDiff::default();

        for (name, app) in &next.apps {
            match self.apps.get(name) {
                None => diff.added.push(app.clone()),
                Some(current) if current != app => diff.changed.push(app.clone()),
                Some(_) => diff.unchanged.push(name.clone()),
            }
        }
        diff.removed = self
            .apps
            .keys()
            .filter(|name| !next.apps.contains_key(*name))
            .cloned()
            .collect();

        diff
    }
}

impl From<&Config> for RoutingTable {
    fn from(config: &Config) -> Self {
        Self::from_apps(config.apps.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str, ports: Vec<u16>, targets: &[&str]) -> App {
        App::new(name, ports, targets.iter().map(|t| t.to_string()).collect())
    }

    #[test]
    fn test_reorder_is_noop() {
        let a = app("web", vec![8080, 9090], &["10.0.0.1:80"]);
        let b = app("api", vec![7070], &["10.0.0.2:80"]);

        let before = RoutingTable::from_apps([a.clone(), b.clone()]);
        let after = RoutingTable::from_apps([b, a]);

        let diff = before.diff(&after);
        assert!(diff.is_empty());
        assert_eq!(diff.unchanged, vec!["api", "web"]);
    }

    #[test]
    fn test_diff_classifies_apps() {
        let before = RoutingTable::from_apps([
            app("web", vec![8080], &["10.0.0.1:80"]),
            app("api", vec![7070], &["10.0.0.2:80"]),
            app("old", vec![6060], &["10.0.0.3:80"]),
        ]);
        let after = RoutingTable::from_apps([
            app("web", vec![8080], &["10.0.0.1:80"]),
            app("api", vec![7070], &["10.0.0.2:80", "10.0.0.4:80"]),
            app("new", vec![5050], &["10.0.0.5:80"]),
        ]);

        let diff = before.diff(&after);
        assert_eq!(diff.added.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(), vec!["new"]);
        assert_eq!(diff.removed, vec!["old"]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].targets.len(), 2);
        assert_eq!(diff.unchanged, vec!["web"]);
    }

    #[test]
    fn test_port_change_is_change() {
        let before = RoutingTable::from_apps([app("web", vec![8080, 9090], &[])]);
        let after = RoutingTable::from_apps([app("web", vec![8080, 9091], &[])]);
        assert_eq!(before.diff(&after).changed.len(), 1);
    }

    #[test]
    fn test_from_config() {
        let config = Config::parse(
            r#"{"Apps": [{"Name": "web", "Ports": [8080], "Targets": ["a:1"]}]}"#,
        )
        .unwrap();
        let table = RoutingTable::from(&config);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("web").unwrap().ports, vec![8080]);
    }
}
