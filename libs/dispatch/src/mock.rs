//! In-memory dispatch objects for tests and unprivileged runs.
//!
//! Pins are plain files so callers can observe the pin directory.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::DispatchError;
use crate::objects::{DispatchLoader, DispatchObjects};
use crate::paths::KernelObject;

/// A recorded kernel operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Load,
    Pin(KernelObject),
    Unpin(KernelObject),
    Close(KernelObject),
    SetSocket,
    AddPort(u16),
    Attach,
}

#[derive(Debug, Default)]
struct MockState {
    journal: Vec<MockOp>,
    ports: Vec<u16>,
    socket_set: bool,
}

/// Loader that records every operation and can fail on demand.
#[derive(Debug, Clone, Default)]
pub struct MockLoader {
    fail_at: Option<MockOp>,
    load_delay: Option<Duration>,
    state: Arc<Mutex<MockState>>,
}

impl MockLoader {
    /// Create a loader that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a loader that fails the given operation.
    pub fn failing_at(op: MockOp) -> Self {
        Self {
            fail_at: Some(op),
            ..Self::default()
        }
    }

    /// Block the calling thread for `delay` on every load, like a slow
    /// verifier pass.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Every operation attempted so far, across all loads.
    pub fn journal(&self) -> Vec<MockOp> {
        self.lock().journal.clone()
    }

    /// Ports written to the ports table and not yet closed.
    pub fn ports(&self) -> Vec<u16> {
        self.lock().ports.clone()
    }

    /// Whether a socket is stored in the socket table.
    pub fn socket_set(&self) -> bool {
        self.lock().socket_set
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DispatchLoader for MockLoader {
    type Objects = MockObjects;

    fn load(&self, image: &Path) -> Result<MockObjects, DispatchError> {
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        self.lock().journal.push(MockOp::Load);
        if self.fail_at == Some(MockOp::Load) {
            return Err(DispatchError::Load {
                path: image.to_path_buf(),
                reason: "mock failure".to_string(),
            });
        }
        Ok(MockObjects {
            loader: self.clone(),
            closed: Vec::new(),
        })
    }
}

/// Objects produced by [`MockLoader`].
#[derive(Debug)]
pub struct MockObjects {
    loader: MockLoader,
    closed: Vec<KernelObject>,
}

impl MockObjects {
    /// Record `op` and report whether it should fail.
    fn record(&self, op: MockOp) -> bool {
        let fail = self.loader.fail_at.as_ref() == Some(&op);
        self.loader.lock().journal.push(op);
        fail
    }

    fn ensure_open(&self, object: KernelObject) -> Result<(), DispatchError> {
        if self.closed.contains(&object) {
            return Err(DispatchError::Closed(object));
        }
        Ok(())
    }
}

impl DispatchObjects for MockObjects {
    fn pin(&mut self, object: KernelObject, path: &Path) -> Result<(), DispatchError> {
        self.ensure_open(object)?;
        let pin_err = |reason: String| DispatchError::Pin {
            object,
            path: path.to_path_buf(),
            reason,
        };

        if self.record(MockOp::Pin(object)) {
            return Err(pin_err("mock failure".to_string()));
        }
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map(|_| ())
            .map_err(|e| pin_err(e.to_string()))
    }

    fn unpin(&mut self, object: KernelObject, path: &Path) -> Result<(), DispatchError> {
        let unpin_err = |reason: String| DispatchError::Unpin {
            object,
            path: path.to_path_buf(),
            reason,
        };

        if self.record(MockOp::Unpin(object)) {
            return Err(unpin_err("mock failure".to_string()));
        }
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unpin_err(e.to_string())),
        }
    }

    fn close(&mut self, object: KernelObject) -> Result<(), DispatchError> {
        self.ensure_open(object)?;
        self.closed.push(object);
        let fail = self.record(MockOp::Close(object));

        let mut state = self.loader.lock();
        match object {
            KernelObject::SocketTable => state.socket_set = false,
            KernelObject::PortsTable => state.ports.clear(),
            _ => {}
        }
        drop(state);

        if fail {
            return Err(DispatchError::Close {
                object,
                reason: "mock failure".to_string(),
            });
        }
        Ok(())
    }

    fn set_socket(&mut self, _socket: BorrowedFd<'_>) -> Result<(), DispatchError> {
        self.ensure_open(KernelObject::SocketTable)?;
        if self.record(MockOp::SetSocket) {
            return Err(DispatchError::TableUpdate {
                object: KernelObject::SocketTable,
                reason: "mock failure".to_string(),
            });
        }
        self.loader.lock().socket_set = true;
        Ok(())
    }

    fn add_port(&mut self, port: u16) -> Result<(), DispatchError> {
        self.ensure_open(KernelObject::PortsTable)?;
        if self.record(MockOp::AddPort(port)) {
            return Err(DispatchError::TableUpdate {
                object: KernelObject::PortsTable,
                reason: format!("mock failure inserting port {port}"),
            });
        }
        self.loader.lock().ports.push(port);
        Ok(())
    }

    fn attach(&mut self, _netns: BorrowedFd<'_>) -> Result<(), DispatchError> {
        self.ensure_open(KernelObject::Program)?;
        if self.record(MockOp::Attach) {
            return Err(DispatchError::Attach("mock failure".to_string()));
        }
        Ok(())
    }
}
