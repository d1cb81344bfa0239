//! Backend pool construction and round-robin selection.
//!
//! - Each candidate target is probed once at construction: name resolution,
//!   then a TCP connect that must complete within 2s
//! - Targets that pass are kept in input order
//! - Selection cycles through the kept pool; health is not re-evaluated

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{BalancerError, ProbeError};

/// Timeout for a backend probe and for backend dials.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Round-robin load balancer over the backends that were healthy at
/// construction.
#[derive(Debug)]
pub struct LoadBalancer {
    /// App name, for logs and errors.
    app: String,
    /// Healthy targets, in input order.
    pool: Vec<String>,
    /// Index of the next backend to hand out.
    cursor: AtomicUsize,
}

impl LoadBalancer {
    /// Probe `targets` and build a balancer from the ones that respond.
    pub async fn new(app: impl Into<String>, targets: &[String]) -> Self {
        Self::with_timeout(app, targets, DEFAULT_PROBE_TIMEOUT).await
    }

    /// Probe `targets` with a custom timeout.
    pub async fn with_timeout(
        app: impl Into<String>,
        targets: &[String],
        probe_timeout: Duration,
    ) -> Self {
        let app = app.into();
        let results = join_all(targets.iter().map(|t| probe(t, probe_timeout))).await;

        let mut pool = Vec::with_capacity(targets.len());
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(addr) => {
                    debug!(app = %app, backend = %target, resolved = %addr, "Backend healthy");
                    pool.push(target.clone());
                }
                Err(e) => {
                    warn!(app = %app, backend = %target, error = %e, "Backend excluded from pool");
                }
            }
        }

        if pool.is_empty() {
            warn!(app = %app, candidates = targets.len(), "No healthy backends");
        } else {
            info!(
                app = %app,
                healthy = pool.len(),
                candidates = targets.len(),
                "Backend pool ready"
            );
        }

        Self::from_backends(app, pool)
    }

    /// Build a balancer over an already-vetted pool without probing.
    pub fn from_backends(app: impl Into<String>, pool: Vec<String>) -> Self {
        Self {
            app: app.into(),
            pool,
            cursor: AtomicUsize::new(0),
        }
    }

    /// App this balancer serves.
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Healthy backends, in selection order.
    pub fn backends(&self) -> &[String] {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Return the backend under the cursor and advance it.
    ///
    /// Concurrent callers each get a distinct index in strict order.
    pub fn select_backend(&self) -> Result<&str, BalancerError> {
        let len = self.pool.len();
        if len == 0 {
            return Err(BalancerError::NoHealthyBackends {
                app: self.app.clone(),
            });
        }

        let index = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
            .unwrap_or_else(|c| c);
        Ok(&self.pool[index % len])
    }
}

/// Check that `target` resolves and accepts a TCP connection within
/// `probe_timeout`. Returns the address that answered.
///
/// Resolution and connection each get their own `probe_timeout`.
pub async fn probe(target: &str, probe_timeout: Duration) -> Result<SocketAddr, ProbeError> {
    let (host, port) = split_host_port(target)?;

    let addrs: Vec<SocketAddr> = timeout(probe_timeout, lookup_host((host, port)))
        .await
        .map_err(|_| ProbeError::ResolveTimeout(target.to_string()))?
        .map_err(|source| ProbeError::Resolve {
            target: target.to_string(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(ProbeError::NoAddresses(target.to_string()));
    }

    let connect = async {
        let mut last_err = None;
        for addr in &addrs {
            match TcpStream::connect(addr).await {
                Ok(_) => return Ok(*addr),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err)
    };

    match timeout(probe_timeout, connect).await {
        Ok(Ok(addr)) => Ok(addr),
        Ok(Err(Some(source))) => Err(ProbeError::Connect {
            target: target.to_string(),
            source,
        }),
        Ok(Err(None)) => Err(ProbeError::NoAddresses(target.to_string())),
        Err(_) => Err(ProbeError::Timeout(target.to_string())),
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals.
pub fn split_host_port(target: &str) -> Result<(&str, u16), ProbeError> {
    let invalid = || ProbeError::InvalidTarget(target.to_string());

    let (host, port) = target.rsplit_once(':').ok_or_else(invalid)?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']').ok_or_else(invalid)?,
        None if host.contains(':') => return Err(invalid()),
        None => host,
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}
