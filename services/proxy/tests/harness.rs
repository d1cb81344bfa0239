//! Test harness for proxy integration tests.
//!
//! Provides echo and tagging backends, free ports, and an orchestrator wired
//! to the in-memory dispatch loader with a temporary pin directory.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use skp_config::App;
use skp_dispatch::{DispatchConfig, DispatchManager, MockLoader, IMAGE_FILE_NAME};
use skp_proxy::{BoundApp, ListenerConfig, Orchestrator, OrchestratorConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// What a test backend does with each connection.
#[derive(Clone)]
enum Behavior {
    Echo,
    Tag(Vec<u8>),
}

#[allow(dead_code)]
pub struct TcpBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    pub eofs: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpBackend {
    /// Echo every byte back until the peer closes.
    pub async fn echo() -> io::Result<Self> {
        Self::spawn(Behavior::Echo).await
    }

    /// Write `tag` on connect, then close.
    pub async fn tagged(tag: &str) -> io::Result<Self> {
        Self::spawn(Behavior::Tag(tag.as_bytes().to_vec())).await
    }

    async fn spawn(behavior: Behavior) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));
        let eofs = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);
        let eof_clone = Arc::clone(&eofs);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                let eofs = Arc::clone(&eof_clone);
                                let behavior = behavior.clone();
                                tokio::spawn(async move {
                                    if let Behavior::Tag(tag) = &behavior {
                                        let _ = stream.write_all(tag).await;
                                        let _ = stream.shutdown().await;
                                    }
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => {
                                                eofs.fetch_add(1, Ordering::Relaxed);
                                                break;
                                            }
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if matches!(behavior, Behavior::Echo)
                                                    && stream.write_all(&buf[..n]).await.is_err()
                                                {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            eofs,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn target(&self) -> String {
        self.addr.to_string()
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn eof_count(&self) -> u64 {
        self.eofs.load(Ordering::Relaxed)
    }
}

impl Drop for TcpBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A loopback port with nothing listening on it.
#[allow(dead_code)]
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[allow(dead_code)]
pub fn app(name: &str, ports: Vec<u16>, targets: Vec<String>) -> App {
    App::new(name, ports, targets)
}

/// Pin directory, dispatch image and netns stand-ins for the mock loader.
#[allow(dead_code)]
pub struct MockDispatch {
    dir: tempfile::TempDir,
    pub loader: MockLoader,
}

#[allow(dead_code)]
impl MockDispatch {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bpf")).unwrap();
        std::fs::write(dir.path().join(IMAGE_FILE_NAME), b"\x7fELF").unwrap();
        std::fs::write(dir.path().join("netns"), b"").unwrap();
        Self {
            dir,
            loader: MockLoader::new(),
        }
    }

    pub fn pin_root(&self) -> PathBuf {
        self.dir.path().join("bpf")
    }

    pub fn manager(&self) -> DispatchManager<MockLoader> {
        DispatchManager::new(
            self.loader.clone(),
            DispatchConfig {
                pin_root: self.pin_root(),
                image_path: Some(self.dir.path().join(IMAGE_FILE_NAME)),
                netns_path: self.dir.path().join("netns"),
            },
        )
    }

    pub fn pins(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.pin_root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

#[allow(dead_code)]
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        listener: ListenerConfig {
            bind_ip: "127.0.0.1".parse().unwrap(),
            connect_timeout: Duration::from_millis(500),
            ..ListenerConfig::default()
        },
        probe_timeout: Duration::from_millis(500),
        shutdown_grace: Duration::from_secs(2),
    }
}

#[allow(dead_code)]
pub fn orchestrator(dispatch: Option<&MockDispatch>) -> Orchestrator<MockLoader> {
    Orchestrator::new(test_config(), dispatch.map(MockDispatch::manager))
}

/// Wait until an app has bound its listener.
#[allow(dead_code)]
pub async fn wait_bound(orchestrator: &Orchestrator<MockLoader>, app: &str) -> BoundApp {
    for _ in 0..200 {
        if let Some(bound) = orchestrator.bound(app) {
            return bound;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("app {app} never bound");
}

/// Poll `check` until it holds or a second passes.
#[allow(dead_code)]
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Connect, then read everything until the proxy closes.
#[allow(dead_code)]
pub async fn read_reply(addr: SocketAddr) -> io::Result<Vec<u8>> {
    tokio::time::timeout(Duration::from_secs(2), async {
        let mut stream = TcpStream::connect(addr).await?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        Ok(buf)
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply"))?
}
