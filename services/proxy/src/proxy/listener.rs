//! Frontend listener and connection forwarding.
//!
//! One listener per app, bound on the app's first port only. Remaining ports
//! are handed to the kernel dispatcher, which steers them to this socket.
//!
//! Each accepted connection runs in its own task:
//! - Select a backend (round-robin)
//! - Dial it with a connect timeout
//! - Copy bytes both ways until both sides close, an error, the idle
//!   timeout or app shutdown
//!
//! A failed selection or dial affects only the connection being handled.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use skp_config::App;
use skp_dispatch::shutdown_requested;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::balancer::{LoadBalancer, DEFAULT_PROBE_TIMEOUT};
use crate::error::ForwardError;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default idle timeout for proxied connections.
pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = Some(Duration::from_secs(300));

/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const COPY_BUFFER_SIZE: usize = 8192;

/// Configuration shared by every app listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// IP to bind listeners on.
    pub bind_ip: IpAddr,
    /// Maximum concurrent connections per listener.
    pub max_connections: usize,
    /// Idle timeout for connections. `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// Backend dial timeout.
    pub connect_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Backend dials that succeeded.
    pub backend_connected: AtomicU64,
    /// Backend dials that failed.
    pub backend_failed: AtomicU64,
    /// Connections dropped because the pool was empty.
    pub no_backend: AtomicU64,
    /// Bytes proxied to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

/// A bound frontend listener for one app.
pub struct Forwarder {
    app: String,
    listener: TcpListener,
    extra_ports: Vec<u16>,
    balancer: Arc<LoadBalancer>,
    config: ListenerConfig,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Forwarder {
    /// Bind the app's first port.
    pub async fn bind(
        app: &App,
        balancer: Arc<LoadBalancer>,
        config: ListenerConfig,
    ) -> Result<Self, ForwardError> {
        let port = app
            .primary_port()
            .ok_or_else(|| ForwardError::NoPort(app.name.clone()))?;
        let addr = SocketAddr::new(config.bind_ip, port);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ForwardError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ForwardError::Bind { addr, source })?;

        info!(
            app = %app.name,
            bind_addr = %local_addr,
            extra_ports = ?app.extra_ports(),
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            app: app.name.clone(),
            listener,
            extra_ports: app.extra_ports().to_vec(),
            balancer,
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Ports declared to the kernel dispatcher.
    pub fn extra_ports(&self) -> &[u16] {
        &self.extra_ports
    }

    /// Duplicate the listening socket's descriptor.
    pub fn socket_handle(&self) -> io::Result<OwnedFd> {
        self.listener.as_fd().try_clone_to_owned()
    }

    /// Hand the socket to `on_bound`, then accept until `shutdown` fires.
    ///
    /// On return the listener is closed and every connection task has ended.
    pub async fn serve<F>(self, on_bound: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnOnce(OwnedFd, Vec<u16>),
    {
        match self.socket_handle() {
            Ok(fd) => on_bound(fd, self.extra_ports.clone()),
            Err(e) => {
                error!(app = %self.app, error = %e, "Cannot duplicate listener socket, dispatch skipped")
            }
        }

        let Forwarder {
            app,
            listener,
            balancer,
            config,
            conn_semaphore,
            stats,
            ..
        } = self;
        let config = Arc::new(config);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,

                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let permit = match Arc::clone(&conn_semaphore).try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                warn!(app = %app, peer_addr = %peer_addr, "Connection rejected: max connections reached");
                                continue;
                            }
                        };

                        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        stats.connections_active.fetch_add(1, Ordering::Relaxed);

                        let balancer = Arc::clone(&balancer);
                        let stats = Arc::clone(&stats);
                        let config = Arc::clone(&config);
                        let mut conn_shutdown = shutdown.clone();

                        connections.spawn(
                            async move {
                                tokio::select! {
                                    result = handle_connection(stream, &balancer, &stats, &config) => {
                                        match result {
                                            Ok(()) => {}
                                            Err(ForwardError::NoBackend(e)) => warn!(error = %e, "Connection dropped"),
                                            Err(e @ ForwardError::Dial { .. }) => warn!(error = %e, "Connection dropped"),
                                            Err(e) => debug!(error = %e, "Connection error"),
                                        }
                                    }
                                    _ = shutdown_requested(&mut conn_shutdown) => {
                                        debug!("Connection cancelled by shutdown");
                                    }
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                                drop(permit);
                            }
                            .instrument(tracing::info_span!("connection", app = %app, peer = %peer_addr)),
                        );
                    }
                    Err(e) => {
                        error!(app = %app, error = %e, "Accept error");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        let in_flight = connections.len();
        connections.shutdown().await;
        info!(app = %app, in_flight, "Listener stopped");
    }
}

/// Forward one client connection to the next backend.
async fn handle_connection(
    mut client: TcpStream,
    balancer: &LoadBalancer,
    stats: &ListenerStats,
    config: &ListenerConfig,
) -> Result<(), ForwardError> {
    let backend = match balancer.select_backend() {
        Ok(backend) => backend,
        Err(e) => {
            stats.no_backend.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
    };

    let mut upstream = match dial(backend, config.connect_timeout).await {
        Ok(stream) => {
            stats.backend_connected.fetch_add(1, Ordering::Relaxed);
            stream
        }
        Err(e) => {
            stats.backend_failed.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
    };
    debug!(backend = %backend, "Connected to backend");

    let (to_backend, from_backend) = proxy_bidirectional(
        &mut client,
        &mut upstream,
        config.idle_timeout,
        &stats.bytes_to_backend,
        &stats.bytes_from_backend,
    )
    .await?;

    debug!(
        backend = %backend,
        bytes_to_backend = to_backend,
        bytes_from_backend = from_backend,
        "Connection closed"
    );
    Ok(())
}

/// Connect to a backend within `connect_timeout`.
async fn dial(backend: &str, connect_timeout: Duration) -> Result<TcpStream, ForwardError> {
    let dial_err = |source| ForwardError::Dial {
        backend: backend.to_string(),
        source,
    };

    match timeout(connect_timeout, TcpStream::connect(backend)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(dial_err(e)),
        Err(_) => Err(dial_err(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect timeout",
        ))),
    }
}

/// Last time either direction of a connection moved data.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Copy one direction until EOF, then shut down the writer.
async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
    activity: &Activity,
    counter: &AtomicU64,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = match idle_timeout {
            Some(idle) => match timeout(idle, reader.read(&mut buf)).await {
                Ok(result) => result?,
                // The other direction may still be busy.
                Err(_) if activity.idle_for() < idle => continue,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => reader.read(&mut buf).await?,
        };

        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        activity.touch();
        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    writer.shutdown().await?;
    Ok(total)
}

/// Proxy data bidirectionally between client and backend.
///
/// EOF in one direction half-closes the other peer's write side; an error in
/// either direction ends both. Returns (bytes_to_backend, bytes_from_backend).
pub async fn proxy_bidirectional(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    idle_timeout: Option<Duration>,
    to_backend: &AtomicU64,
    from_backend: &AtomicU64,
) -> io::Result<(u64, u64)> {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();
    let activity = Activity::new();

    tokio::try_join!(
        copy_half(
            &mut client_read,
            &mut backend_write,
            idle_timeout,
            &activity,
            to_backend
        ),
        copy_half(
            &mut backend_read,
            &mut client_write,
            idle_timeout,
            &activity,
            from_backend
        ),
    )
}
