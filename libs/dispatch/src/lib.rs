//! # skp-dispatch
//!
//! Userspace lifecycle of the kernel socket dispatcher.
//!
//! A BPF `sk_lookup` program steers connections arriving on a set of ports to
//! a single listening socket. For each app this crate:
//!
//! 1. Loads the dispatch image (`echo_dispatch.bpf.o`, next to the executable)
//! 2. Pins the program and its two tables under app-scoped names
//! 3. Stores the listener socket in slot 0 of the socket table
//! 4. Inserts the app's extra ports into the ports table
//! 5. Attaches the program to the current network namespace and pins the link
//! 6. On shutdown, unpins and closes link, ports table, socket table, program
//!
//! ## Pin Layout
//!
//! ```text
//! <pin-root>/echo_socket-<app>          socket-identity table
//! <pin-root>/echo_ports-<app>           ports table
//! <pin-root>/echo_dispatch_prog-<app>   dispatch program
//! <pin-root>/echo_dispatch_link-<app>   namespace attachment link
//! ```
//!
//! Every acquired object is recorded on a stack as soon as it exists. Any
//! failure part way through setup unwinds exactly what is on the stack, in
//! reverse order, and the same stack drives teardown at shutdown.
//!
//! The kernel side sits behind [`DispatchLoader`] / [`DispatchObjects`];
//! [`AyaLoader`] is the production implementation and [`MockLoader`] records
//! operations for tests and for running without BPF privileges.

mod aya_loader;
mod error;
mod manager;
mod mock;
mod objects;
mod paths;
mod shutdown;

pub use aya_loader::{AyaLoader, AyaObjects};
pub use error::DispatchError;
pub use manager::{DispatchBinding, DispatchConfig, DispatchManager};
pub use mock::{MockLoader, MockObjects, MockOp};
pub use objects::{DispatchLoader, DispatchObjects};
pub use paths::{
    validate_app_name, KernelObject, PinPaths, DEFAULT_NETNS_PATH, DEFAULT_PIN_ROOT, IMAGE_FILE_NAME,
    PORTS_MAP_NAME, PROGRAM_NAME, SOCKET_MAP_NAME,
};
pub use shutdown::shutdown_requested;
