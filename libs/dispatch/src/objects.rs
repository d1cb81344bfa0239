//! Kernel object interface.
//!
//! The manager drives the lifecycle; implementations only perform single
//! kernel operations. Calls are synchronous: each is one or two syscalls.

use std::os::fd::BorrowedFd;
use std::path::Path;

use crate::error::DispatchError;
use crate::paths::KernelObject;

/// Loads a dispatch image into a fresh set of kernel objects.
pub trait DispatchLoader: Send + Sync + 'static {
    /// Objects produced by a successful load.
    type Objects: DispatchObjects;

    /// Load the image and extract the program and both tables.
    ///
    /// The program is verified and loaded but not attached; nothing is pinned.
    fn load(&self, image: &Path) -> Result<Self::Objects, DispatchError>;
}

/// Handles to one loaded dispatch image.
///
/// Dropping the value closes every handle it still owns.
pub trait DispatchObjects: Send + 'static {
    /// Pin an object at `path`.
    fn pin(&mut self, object: KernelObject, path: &Path) -> Result<(), DispatchError>;

    /// Remove the pin of an object. Must succeed if the pin is already gone.
    fn unpin(&mut self, object: KernelObject, path: &Path) -> Result<(), DispatchError>;

    /// Close an object's handle.
    fn close(&mut self, object: KernelObject) -> Result<(), DispatchError>;

    /// Store the listening socket in slot 0 of the socket table.
    fn set_socket(&mut self, socket: BorrowedFd<'_>) -> Result<(), DispatchError>;

    /// Add a port to the ports table.
    fn add_port(&mut self, port: u16) -> Result<(), DispatchError>;

    /// Attach the program to a network namespace, creating the link.
    fn attach(&mut self, netns: BorrowedFd<'_>) -> Result<(), DispatchError>;
}
