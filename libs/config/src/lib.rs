//! # skp-config
//!
//! Routing configuration for skproxy.
//!
//! The routing file is a JSON document listing apps, each with the frontend
//! ports it answers on and the backend targets it proxies to:
//!
//! ```json
//! {
//!   "Apps": [
//!     { "Name": "web", "Ports": [8080, 9090], "Targets": ["10.0.0.1:80", "10.0.0.2:80"] }
//!   ]
//! }
//! ```
//!
//! ## Validation
//!
//! - App names are non-empty and unique
//! - Every app declares at least one port
//! - Ports are in `1..=65535`
//! - No port appears in more than one app
//!
//! [`ConfigStore`] reads the file once at startup and can watch it for
//! writes, emitting each newly validated snapshot on a channel. Snapshots
//! that fail validation are logged and dropped.

mod error;
mod store;
mod types;

pub use error::ConfigError;
pub use store::{ConfigStore, ConfigWatch, DEFAULT_CONFIG_PATH};
pub use types::{App, Config};
