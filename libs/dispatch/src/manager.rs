//! Per-app dispatch binding lifecycle.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::objects::{DispatchLoader, DispatchObjects};
use crate::paths::{KernelObject, PinPaths, DEFAULT_NETNS_PATH, DEFAULT_PIN_ROOT, IMAGE_FILE_NAME};
use crate::shutdown::shutdown_requested;

/// Where the manager finds its inputs and pins its outputs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// bpffs directory that receives the pins.
    pub pin_root: PathBuf,
    /// Explicit image path. When unset the image is looked up next to the
    /// running executable.
    pub image_path: Option<PathBuf>,
    /// Network namespace to attach to.
    pub netns_path: PathBuf,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pin_root: PathBuf::from(DEFAULT_PIN_ROOT),
            image_path: None,
            netns_path: PathBuf::from(DEFAULT_NETNS_PATH),
        }
    }
}

impl DispatchConfig {
    /// Resolve the dispatch image location.
    pub fn resolve_image_path(&self) -> Result<PathBuf, DispatchError> {
        if let Some(path) = &self.image_path {
            return Ok(path.clone());
        }

        let exe = std::env::current_exe().map_err(|e| DispatchError::ImageLocate(e.to_string()))?;
        let dir = exe.parent().ok_or_else(|| {
            DispatchError::ImageLocate(format!("executable {} has no parent", exe.display()))
        })?;
        Ok(dir.join(IMAGE_FILE_NAME))
    }
}

type ActiveApps = Arc<Mutex<HashSet<String>>>;

/// Marks an app as attached for as long as it lives.
struct AppClaim {
    app: String,
    active: ActiveApps,
}

impl AppClaim {
    fn acquire(active: &ActiveApps, app: &str) -> Result<Self, DispatchError> {
        let mut apps = active.lock().unwrap_or_else(|e| e.into_inner());
        if !apps.insert(app.to_string()) {
            return Err(DispatchError::AlreadyAttached(app.to_string()));
        }
        Ok(Self {
            app: app.to_string(),
            active: Arc::clone(active),
        })
    }
}

impl Drop for AppClaim {
    fn drop(&mut self) {
        let mut apps = self.active.lock().unwrap_or_else(|e| e.into_inner());
        apps.remove(&self.app);
    }
}

/// One acquired kernel object and, once pinned, where.
#[derive(Debug)]
struct Acquired {
    object: KernelObject,
    pinned_at: Option<PathBuf>,
}

/// Loads, binds and attaches dispatch programs for apps.
pub struct DispatchManager<L: DispatchLoader> {
    loader: L,
    config: DispatchConfig,
    active: ActiveApps,
}

impl<L: DispatchLoader> DispatchManager<L> {
    /// Create a new manager.
    pub fn new(loader: L, config: DispatchConfig) -> Self {
        Self {
            loader,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Manager configuration.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Names of apps with a live binding.
    pub fn active_apps(&self) -> Vec<String> {
        let apps = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = apps.iter().cloned().collect();
        names.sort();
        names
    }

    /// Bind a listener socket and extra ports for an app, hold the binding
    /// until `shutdown` fires, then release it.
    ///
    /// Setup failures are returned after rolling back whatever had been
    /// acquired. Teardown failures are returned after every object has been
    /// released.
    ///
    /// Setup and teardown run on the blocking pool.
    pub async fn attach(
        self: &Arc<Self>,
        app: &str,
        socket: OwnedFd,
        extra_ports: &[u16],
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), DispatchError> {
        let manager = Arc::clone(self);
        let owned_app = app.to_string();
        let ports = extra_ports.to_vec();
        let binding =
            run_blocking(move || manager.bind(&owned_app, socket.as_fd(), &ports)).await?;

        shutdown_requested(&mut shutdown).await;

        debug!(app = %app, "Shutdown received, releasing dispatch binding");
        run_blocking(move || binding.release()).await
    }

    /// Run setup steps and return the live binding.
    pub fn bind(
        &self,
        app: &str,
        socket: BorrowedFd<'_>,
        extra_ports: &[u16],
    ) -> Result<DispatchBinding<L::Objects>, DispatchError> {
        let paths = PinPaths::new(&self.config.pin_root, app)?;
        let claim = AppClaim::acquire(&self.active, app)?;

        let image = self.config.resolve_image_path()?;
        if !image.is_file() {
            return Err(DispatchError::ImageMissing { path: image });
        }

        let objects = self.loader.load(&image)?;
        debug!(app = %app, image = %image.display(), "Dispatch image loaded");

        let mut binding = DispatchBinding {
            app: app.to_string(),
            paths,
            objects,
            acquired: Vec::with_capacity(KernelObject::ACQUISITION_ORDER.len()),
            claim: Some(claim),
        };

        if let Err(e) = binding.setup(socket, extra_ports, &self.config.netns_path) {
            error!(app = %app, error = %e, "Dispatch setup failed, rolling back");
            if let Err(rollback_err) = binding.release_acquired() {
                warn!(app = %app, error = %rollback_err, "Rollback incomplete");
            }
            return Err(e);
        }

        info!(
            app = %app,
            extra_ports = ?extra_ports,
            pin_root = %self.config.pin_root.display(),
            "Dispatch attached"
        );
        Ok(binding)
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, DispatchError>
where
    F: FnOnce() -> Result<T, DispatchError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DispatchError::Worker(e.to_string()))?
}

/// A live, pinned dispatch binding for one app.
///
/// Release it with [`release`](Self::release). If it is dropped instead,
/// whatever is still held is released on drop.
pub struct DispatchBinding<O: DispatchObjects> {
    app: String,
    paths: PinPaths,
    objects: O,
    acquired: Vec<Acquired>,
    claim: Option<AppClaim>,
}

impl<O: DispatchObjects> DispatchBinding<O> {
    /// App this binding belongs to.
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Pin paths used by this binding.
    pub fn paths(&self) -> &PinPaths {
        &self.paths
    }

    /// Objects currently held, in acquisition order.
    pub fn held(&self) -> Vec<KernelObject> {
        self.acquired.iter().map(|a| a.object).collect()
    }

    /// Unpin and close everything, link first, program last.
    pub fn release(mut self) -> Result<(), DispatchError> {
        let result = self.release_acquired();
        self.claim.take();
        if result.is_ok() {
            info!(app = %self.app, "Dispatch released");
        }
        result
    }

    fn setup(
        &mut self,
        socket: BorrowedFd<'_>,
        extra_ports: &[u16],
        netns_path: &Path,
    ) -> Result<(), DispatchError> {
        for object in [
            KernelObject::Program,
            KernelObject::SocketTable,
            KernelObject::PortsTable,
        ] {
            self.acquired.push(Acquired {
                object,
                pinned_at: None,
            });
            self.pin_top()?;
        }

        self.objects.set_socket(socket)?;
        debug!(app = %self.app, "Listener socket stored in socket table");

        for port in extra_ports {
            self.objects.add_port(*port)?;
            debug!(app = %self.app, port = *port, "Port added to ports table");
        }

        let netns = File::open(netns_path).map_err(|source| DispatchError::Netns {
            path: netns_path.to_path_buf(),
            source,
        })?;
        self.objects.attach(netns.as_fd())?;
        self.acquired.push(Acquired {
            object: KernelObject::Link,
            pinned_at: None,
        });
        self.pin_top()
    }

    /// Pin the most recently acquired object.
    fn pin_top(&mut self) -> Result<(), DispatchError> {
        let Some(top) = self.acquired.last_mut() else {
            return Ok(());
        };
        let path = self.paths.path(top.object);
        remove_stale_pin(&self.app, top.object, &path)?;

        self.objects.pin(top.object, &path)?;
        debug!(app = %self.app, object = %top.object, path = %path.display(), "Pinned");
        top.pinned_at = Some(path);
        Ok(())
    }

    /// Pop and release every held object. Each object is released at most
    /// once; a failure is logged and the walk continues.
    fn release_acquired(&mut self) -> Result<(), DispatchError> {
        let mut first_err = None;

        while let Some(entry) = self.acquired.pop() {
            if let Some(path) = &entry.pinned_at {
                match self.objects.unpin(entry.object, path) {
                    Ok(()) => debug!(app = %self.app, object = %entry.object, "Unpinned"),
                    Err(e) => {
                        warn!(app = %self.app, object = %entry.object, error = %e, "Unpin failed");
                        first_err.get_or_insert(e);
                    }
                }
            }

            match self.objects.close(entry.object) {
                Ok(()) => debug!(app = %self.app, object = %entry.object, "Closed"),
                Err(e) => {
                    warn!(app = %self.app, object = %entry.object, error = %e, "Close failed");
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<O: DispatchObjects> Drop for DispatchBinding<O> {
    fn drop(&mut self) {
        if !self.acquired.is_empty() {
            warn!(app = %self.app, held = ?self.held(), "Dispatch binding dropped while held, releasing");
            let _ = self.release_acquired();
        }
    }
}

/// Remove a pin left behind by an earlier run for the same app.
fn remove_stale_pin(app: &str, object: KernelObject, path: &Path) -> Result<(), DispatchError> {
    match fs::remove_file(path) {
        Ok(()) => {
            warn!(app = %app, object = %object, path = %path.display(), "Replaced stale pin");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DispatchError::Pin {
            object,
            path: path.to_path_buf(),
            reason: format!("stale pin could not be removed: {e}"),
        }),
    }
}
