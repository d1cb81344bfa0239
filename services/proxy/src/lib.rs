//! # skp-proxy
//!
//! Multi-app transparent TCP reverse proxy.
//!
//! Each app binds a listener on its first port, balances connections
//! round-robin across the backends that passed a startup probe, and hands
//! its listener socket to the kernel dispatcher so the app's other ports are
//! steered to the same socket.

mod error;
mod orchestrator;
pub mod proxy;

pub use error::{BalancerError, ForwardError, ProbeError, ProxyError};
pub use orchestrator::{BoundApp, Orchestrator, OrchestratorConfig, DEFAULT_SHUTDOWN_GRACE};
pub use proxy::{
    Forwarder, ListenerConfig, ListenerStats, LoadBalancer, RoutingDiff, RoutingTable,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CONNECTIONS, DEFAULT_PROBE_TIMEOUT,
};
pub use skp_dispatch::shutdown_requested;
