//! Per-app task supervision.
//!
//! Each app runs in its own task: probe backends, bind the listener, attach
//! kernel dispatch, accept until stopped, then release dispatch. Apps never
//! share failures. Every app has its own stop signal so a reconcile can stop
//! one app without touching the rest.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::future::join_all;
use skp_config::{App, Config};
use skp_dispatch::{shutdown_requested, AyaLoader, DispatchLoader, DispatchManager};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ProxyError;
use crate::proxy::{
    Forwarder, ListenerConfig, ListenerStats, LoadBalancer, RoutingDiff, RoutingTable,
    DEFAULT_PROBE_TIMEOUT,
};

/// Default bound on how long a stopping app may take.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Settings applied to every app.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Listener settings.
    pub listener: ListenerConfig,
    /// Backend probe timeout.
    pub probe_timeout: Duration,
    /// Time a stopping app gets before its task is aborted.
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Listener details published once an app is bound.
#[derive(Debug, Clone)]
pub struct BoundApp {
    pub local_addr: SocketAddr,
    pub stats: Arc<ListenerStats>,
}

struct AppHandle {
    stop_tx: watch::Sender<bool>,
    bound: Arc<OnceLock<BoundApp>>,
    task: JoinHandle<Result<(), ProxyError>>,
}

/// Runs the apps of a routing table and applies table changes.
pub struct Orchestrator<L: DispatchLoader = AyaLoader> {
    config: Arc<OrchestratorConfig>,
    dispatch: Option<Arc<DispatchManager<L>>>,
    table: RoutingTable,
    apps: HashMap<String, AppHandle>,
}

impl<L: DispatchLoader> Orchestrator<L> {
    /// Create an orchestrator. Without a dispatch manager, apps only listen
    /// on their first port.
    pub fn new(config: OrchestratorConfig, dispatch: Option<DispatchManager<L>>) -> Self {
        Self {
            config: Arc::new(config),
            dispatch: dispatch.map(Arc::new),
            table: RoutingTable::new(),
            apps: HashMap::new(),
        }
    }

    /// The table currently applied.
    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Names of apps whose task is still running.
    pub fn running_apps(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .apps
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Listener details for an app, once it has bound.
    pub fn bound(&self, app: &str) -> Option<BoundApp> {
        self.apps.get(app).and_then(|h| h.bound.get().cloned())
    }

    /// Start every app in `table`. Apps already running are left alone.
    pub async fn start(&mut self, table: RoutingTable) {
        self.reconcile(table).await;
    }

    /// Apply a new routing table.
    ///
    /// Removed apps stop; changed apps stop and start again with the new
    /// definition; added apps start; unchanged apps are not touched. An
    /// unchanged app whose task has already exited counts as changed.
    pub async fn reconcile(&mut self, next: RoutingTable) -> RoutingDiff {
        let mut diff = self.table.diff(&next);

        let (exited, unchanged): (Vec<String>, Vec<String>) =
            diff.unchanged.drain(..).partition(|name| {
                self.apps
                    .get(name)
                    .map_or(true, |handle| handle.task.is_finished())
            });
        diff.unchanged = unchanged;
        for name in exited {
            info!(app = %name, "App exited, restarting");
            diff.changed.extend(next.get(&name).cloned());
        }

        if diff.is_empty() {
            debug!(apps = next.len(), "Routing table unchanged");
            self.table = next;
            return diff;
        }

        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            unchanged = diff.unchanged.len(),
            "Reconciling routing table"
        );

        let stopping: Vec<String> = diff
            .removed
            .iter()
            .cloned()
            .chain(diff.changed.iter().map(|a| a.name.clone()))
            .collect();
        self.stop_apps(&stopping).await;

        for app in diff.changed.iter().chain(diff.added.iter()) {
            self.spawn_app(app.clone());
        }

        self.table = next;
        diff
    }

    /// Stop one app and wait for it.
    pub async fn stop_app(&mut self, name: &str) -> Option<Result<(), ProxyError>> {
        let handle = self.apps.remove(name)?;
        Some(stop_handle(name.to_string(), handle, self.config.shutdown_grace).await)
    }

    /// Stop every app concurrently and wait for all of them.
    pub async fn stop_all(&mut self) {
        let names: Vec<String> = self.apps.keys().cloned().collect();
        self.stop_apps(&names).await;
        self.table = RoutingTable::new();
        info!("All apps stopped");
    }

    /// Run `table` until `shutdown` fires, then stop everything.
    pub async fn run(mut self, table: RoutingTable, mut shutdown: watch::Receiver<bool>) {
        self.start(table).await;
        shutdown_requested(&mut shutdown).await;
        info!("Shutdown requested, stopping apps");
        self.stop_all().await;
    }

    /// Run `table`, applying each config snapshot from `updates`, until
    /// `shutdown` fires.
    pub async fn run_with_updates(
        mut self,
        table: RoutingTable,
        mut updates: mpsc::Receiver<Config>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.start(table).await;
        let mut updates_open = true;

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                update = updates.recv(), if updates_open => match update {
                    Some(config) => {
                        info!(apps = config.apps.len(), "Configuration change received");
                        self.reconcile(RoutingTable::from(&config)).await;
                    }
                    None => {
                        warn!("Configuration updates closed, keeping current routing");
                        updates_open = false;
                    }
                },
            }
        }

        info!("Shutdown requested, stopping apps");
        self.stop_all().await;
    }

    async fn stop_apps(&mut self, names: &[String]) {
        let grace = self.config.shutdown_grace;
        let stops = names
            .iter()
            .filter_map(|name| self.apps.remove(name).map(|h| (name.clone(), h)))
            .map(|(name, handle)| stop_handle(name, handle, grace));

        for result in join_all(stops).await {
            if let Err(e) = result {
                warn!(error = %e, "App stopped with error");
            }
        }
    }

    fn spawn_app(&mut self, app: App) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let bound = Arc::new(OnceLock::new());
        let name = app.name.clone();

        let task = tokio::spawn(run_app(
            app,
            Arc::clone(&self.config),
            self.dispatch.clone(),
            stop_rx,
            Arc::clone(&bound),
        ));

        self.apps.insert(
            name,
            AppHandle {
                stop_tx,
                bound,
                task,
            },
        );
    }
}

impl<L: DispatchLoader> Drop for Orchestrator<L> {
    fn drop(&mut self) {
        for handle in self.apps.values() {
            let _ = handle.stop_tx.send(true);
        }
    }
}

async fn stop_handle(
    name: String,
    handle: AppHandle,
    grace: Duration,
) -> Result<(), ProxyError> {
    let _ = handle.stop_tx.send(true);
    let mut task = handle.task;

    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(result)) => {
            debug!(app = %name, "App stopped");
            result
        }
        Ok(Err(e)) => {
            error!(app = %name, error = %e, "App task failed");
            Ok(())
        }
        Err(_) => {
            warn!(app = %name, grace_ms = grace.as_millis() as u64, "App did not stop in time, aborting");
            task.abort();
            let _ = task.await;
            Ok(())
        }
    }
}

/// Serve one app until `stop` fires.
async fn run_app<L: DispatchLoader>(
    app: App,
    config: Arc<OrchestratorConfig>,
    dispatch: Option<Arc<DispatchManager<L>>>,
    mut stop: watch::Receiver<bool>,
    bound: Arc<OnceLock<BoundApp>>,
) -> Result<(), ProxyError> {
    let name = app.name.clone();

    let balancer = tokio::select! {
        lb = LoadBalancer::with_timeout(&name, &app.targets, config.probe_timeout) => Arc::new(lb),
        _ = shutdown_requested(&mut stop) => return Ok(()),
    };

    let forwarder = match Forwarder::bind(&app, balancer, config.listener.clone()).await {
        Ok(f) => f,
        Err(source) => {
            error!(app = %name, error = %source, "App failed to start");
            return Err(ProxyError::Forward { app: name, source });
        }
    };

    if let Ok(local_addr) = forwarder.local_addr() {
        let _ = bound.set(BoundApp {
            local_addr,
            stats: forwarder.stats(),
        });
    }

    // Dispatch is released only after the listener has stopped.
    let (release_tx, release_rx) = watch::channel(false);
    let mut dispatch_task: Option<JoinHandle<Result<(), ProxyError>>> = None;

    let on_bound = |socket: OwnedFd, extra_ports: Vec<u16>| {
        let Some(manager) = dispatch else {
            debug!(app = %name, "Kernel dispatch disabled");
            return;
        };
        let app = name.clone();
        dispatch_task = Some(tokio::spawn(async move {
            manager
                .attach(&app, socket, &extra_ports, release_rx)
                .await
                .map_err(|e| {
                    let e = ProxyError::dispatch(&app, e);
                    error!(app = %app, error = %e, "Kernel dispatch failed");
                    e
                })
        }));
    };

    forwarder.serve(on_bound, stop).await;
    let _ = release_tx.send(true);

    match dispatch_task {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(app = %name, error = %e, "Dispatch task failed");
                Ok(())
            }
        },
        None => Ok(()),
    }
}
