//! L4 TCP proxy implementation.
//!
//! This module provides:
//! - Backend probing and round-robin selection
//! - Per-app frontend listeners
//! - Connection proxying
//! - Routing table diffing for live reconfiguration
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener (port[0]) -> LoadBalancer -> Backend
//!              ^
//!   port[1..] -+- kernel sk_lookup dispatch
//! ```

mod balancer;
mod listener;
mod routing;

pub use balancer::{probe, split_host_port, LoadBalancer, DEFAULT_PROBE_TIMEOUT};
pub use listener::{
    proxy_bidirectional, Forwarder, ListenerConfig, ListenerStats, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS,
};
pub use routing::{RoutingDiff, RoutingTable};
