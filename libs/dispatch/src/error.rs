//! Error types for kernel dispatch setup and teardown.

use std::path::PathBuf;

use thiserror::Error;

use crate::paths::KernelObject;

/// Kernel dispatch errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// App name cannot be used as a pin path suffix.
    #[error("invalid app name for pin path: {0:?}")]
    InvalidAppName(String),

    /// App already holds a live binding in this process.
    #[error("app {0:?} already has an active dispatch binding")]
    AlreadyAttached(String),

    /// Could not determine where the dispatch image lives.
    #[error("cannot locate dispatch image: {0}")]
    ImageLocate(String),

    /// Dispatch image file does not exist.
    #[error("dispatch image not found at {}", path.display())]
    ImageMissing { path: PathBuf },

    /// Image could not be parsed or loaded into the kernel.
    #[error("failed to load dispatch image {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    /// A required program or table is absent from the image.
    #[error("dispatch image has no {kind} named {name:?}")]
    MissingObject { kind: &'static str, name: &'static str },

    /// An object in the image has an unexpected type.
    #[error("dispatch object {name:?} has wrong type: {reason}")]
    WrongObjectType { name: &'static str, reason: String },

    /// Pinning an object failed.
    #[error("failed to pin {object} at {}: {reason}", path.display())]
    Pin {
        object: KernelObject,
        path: PathBuf,
        reason: String,
    },

    /// Writing a table entry failed.
    #[error("failed to update {object}: {reason}")]
    TableUpdate {
        object: KernelObject,
        reason: String,
    },

    /// Opening the network namespace failed.
    #[error("failed to open network namespace {}: {source}", path.display())]
    Netns {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Attaching the program to the network namespace failed.
    #[error("failed to attach dispatch program: {0}")]
    Attach(String),

    /// Removing a pin failed.
    #[error("failed to unpin {object} at {}: {reason}", path.display())]
    Unpin {
        object: KernelObject,
        path: PathBuf,
        reason: String,
    },

    /// Closing an object failed.
    #[error("failed to close {object}: {reason}")]
    Close {
        object: KernelObject,
        reason: String,
    },

    /// Blocking worker running setup or teardown panicked or was cancelled.
    #[error("dispatch worker failed: {0}")]
    Worker(String),

    /// Object was used after it had been closed.
    #[error("{0} is already closed")]
    Closed(KernelObject),
}

impl DispatchError {
    /// Returns true for errors raised while unwinding a binding.
    pub fn is_teardown(&self) -> bool {
        matches!(self, DispatchError::Unpin { .. } | DispatchError::Close { .. })
    }
}
