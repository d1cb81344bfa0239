//! Kernel object identities and their app-scoped pin paths.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::DispatchError;

/// Default bpffs mount point.
pub const DEFAULT_PIN_ROOT: &str = "/sys/fs/bpf";

/// Network namespace of the running process.
pub const DEFAULT_NETNS_PATH: &str = "/proc/self/ns/net";

/// Dispatch image file name, resolved next to the running executable.
pub const IMAGE_FILE_NAME: &str = "echo_dispatch.bpf.o";

/// Program section name inside the image.
pub const PROGRAM_NAME: &str = "echo_dispatch";

/// Single-slot sockmap holding the listener socket.
pub const SOCKET_MAP_NAME: &str = "echo_socket";

/// Hash set of extra ports (`u16 -> u8`).
pub const PORTS_MAP_NAME: &str = "echo_ports";

const MAX_APP_NAME_LEN: usize = 200;

/// The four kernel objects making up one app's dispatch binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelObject {
    /// The `sk_lookup` dispatch program.
    Program,
    /// Socket-identity table (sockmap, one slot).
    SocketTable,
    /// Ports table (hash set keyed by port).
    PortsTable,
    /// Attachment of the program to the network namespace.
    Link,
}

impl KernelObject {
    /// Acquisition order; teardown walks it backwards.
    pub const ACQUISITION_ORDER: [KernelObject; 4] = [
        KernelObject::Program,
        KernelObject::SocketTable,
        KernelObject::PortsTable,
        KernelObject::Link,
    ];

    /// Pin file base name, before the app suffix.
    pub fn base_name(self) -> &'static str {
        match self {
            KernelObject::Program => "echo_dispatch_prog",
            KernelObject::SocketTable => "echo_socket",
            KernelObject::PortsTable => "echo_ports",
            KernelObject::Link => "echo_dispatch_link",
        }
    }
}

impl fmt::Display for KernelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            KernelObject::Program => "dispatch program",
            KernelObject::SocketTable => "socket table",
            KernelObject::PortsTable => "ports table",
            KernelObject::Link => "dispatch link",
        };
        f.write_str(label)
    }
}

/// Check that an app name is safe to use as a pin file suffix.
pub fn validate_app_name(app: &str) -> Result<(), DispatchError> {
    let valid_chars = app
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if app.is_empty() || app.len() > MAX_APP_NAME_LEN || !valid_chars || app == "." || app == ".." {
        return Err(DispatchError::InvalidAppName(app.to_string()));
    }
    Ok(())
}

/// Pin paths for one app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinPaths {
    root: PathBuf,
    app: String,
}

impl PinPaths {
    /// Build the pin paths for an app, validating the name.
    pub fn new(root: impl Into<PathBuf>, app: &str) -> Result<Self, DispatchError> {
        validate_app_name(app)?;
        Ok(Self {
            root: root.into(),
            app: app.to_string(),
        })
    }

    /// Pin root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path for a given object: `<root>/<base_name>-<app>`.
    pub fn path(&self, object: KernelObject) -> PathBuf {
        self.root.join(format!("{}-{}", object.base_name(), self.app))
    }

    /// All four paths in acquisition order.
    pub fn all(&self) -> Vec<PathBuf> {
        KernelObject::ACQUISITION_ORDER
            .iter()
            .map(|o| self.path(*o))
            .collect()
    }
}
