//! Error types for the proxy service.

use std::io;
use std::net::SocketAddr;

use skp_dispatch::DispatchError;
use thiserror::Error;

/// Backend selection errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BalancerError {
    /// No backend passed its health probe.
    #[error("no healthy backends for app {app:?}")]
    NoHealthyBackends { app: String },
}

/// Reasons a backend probe failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Target is not `host:port`.
    #[error("invalid target {0:?}: expected host:port")]
    InvalidTarget(String),

    /// Host name did not resolve.
    #[error("cannot resolve {target}: {source}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Host name resolved to no addresses.
    #[error("{0} resolved to no addresses")]
    NoAddresses(String),

    /// TCP connect was refused or failed.
    #[error("cannot connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Name resolution did not finish in time.
    #[error("resolving {0} timed out")]
    ResolveTimeout(String),

    /// TCP connect did not finish in time.
    #[error("connecting to {0} timed out")]
    Timeout(String),
}

/// Per-listener and per-connection forwarding errors.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Listener could not be bound. Terminal for the app.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// App has no port to bind.
    #[error("app {0:?} has no frontend port")]
    NoPort(String),

    /// Backend dial failed. Only the affected client is closed.
    #[error("failed to dial backend {backend}: {source}")]
    Dial {
        backend: String,
        #[source]
        source: io::Error,
    },

    /// No backend could be selected.
    #[error(transparent)]
    NoBackend(#[from] BalancerError),

    /// Copy between client and backend failed.
    #[error("forwarding failed: {0}")]
    Io(#[from] io::Error),
}

/// App-level errors reported by the orchestrator.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Kernel dispatch setup failed; partial pins were rolled back.
    #[error("dispatch setup failed for app {app:?}: {source}")]
    DispatchSetup {
        app: String,
        #[source]
        source: DispatchError,
    },

    /// Kernel dispatch teardown did not release cleanly.
    #[error("dispatch teardown failed for app {app:?}: {source}")]
    DispatchTeardown {
        app: String,
        #[source]
        source: DispatchError,
    },

    /// Forwarder failed for the app.
    #[error("forwarder failed for app {app:?}: {source}")]
    Forward {
        app: String,
        #[source]
        source: ForwardError,
    },
}

impl ProxyError {
    /// Wrap a dispatch error, classifying setup and teardown.
    pub fn dispatch(app: &str, source: DispatchError) -> Self {
        let app = app.to_string();
        if source.is_teardown() {
            ProxyError::DispatchTeardown { app, source }
        } else {
            ProxyError::DispatchSetup { app, source }
        }
    }
}
