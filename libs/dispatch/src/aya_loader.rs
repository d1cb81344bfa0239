//! Kernel dispatch objects backed by aya.

use std::fs;
use std::io;
use std::os::fd::BorrowedFd;
use std::path::Path;

use aya::maps::{HashMap as BpfHashMap, Map, MapData, SockMap};
use aya::programs::links::{FdLink, PinnedLink};
use aya::programs::SkLookup;
use aya::Ebpf;
use tracing::debug;

use crate::error::DispatchError;
use crate::objects::{DispatchLoader, DispatchObjects};
use crate::paths::{KernelObject, PORTS_MAP_NAME, PROGRAM_NAME, SOCKET_MAP_NAME};

/// Loads `echo_dispatch.bpf.o` with aya.
#[derive(Debug, Clone, Copy, Default)]
pub struct AyaLoader;

impl AyaLoader {
    pub fn new() -> Self {
        Self
    }
}

impl DispatchLoader for AyaLoader {
    type Objects = AyaObjects;

    fn load(&self, image: &Path) -> Result<AyaObjects, DispatchError> {
        let load_err = |reason: String| DispatchError::Load {
            path: image.to_path_buf(),
            reason,
        };

        let mut ebpf = Ebpf::load_file(image).map_err(|e| load_err(e.to_string()))?;

        let socket_table = ebpf
            .take_map(SOCKET_MAP_NAME)
            .ok_or(DispatchError::MissingObject {
                kind: "map",
                name: SOCKET_MAP_NAME,
            })?;
        let ports_table = ebpf
            .take_map(PORTS_MAP_NAME)
            .ok_or(DispatchError::MissingObject {
                kind: "map",
                name: PORTS_MAP_NAME,
            })?;

        let program = sk_lookup(&mut ebpf)?;
        program.load().map_err(|e| load_err(e.to_string()))?;
        debug!(image = %image.display(), program = PROGRAM_NAME, "sk_lookup program loaded");

        Ok(AyaObjects {
            ebpf,
            program_loaded: true,
            socket_table: Some(socket_table),
            ports_table: Some(ports_table),
            link: None,
        })
    }
}

fn sk_lookup(ebpf: &mut Ebpf) -> Result<&mut SkLookup, DispatchError> {
    ebpf.program_mut(PROGRAM_NAME)
        .ok_or(DispatchError::MissingObject {
            kind: "program",
            name: PROGRAM_NAME,
        })?
        .try_into()
        .map_err(|e: aya::programs::ProgramError| DispatchError::WrongObjectType {
            name: PROGRAM_NAME,
            reason: e.to_string(),
        })
}

enum LinkState {
    Attached(FdLink),
    Pinned(PinnedLink),
}

/// Program, tables and link from one loaded image.
pub struct AyaObjects {
    ebpf: Ebpf,
    program_loaded: bool,
    socket_table: Option<Map>,
    ports_table: Option<Map>,
    link: Option<LinkState>,
}

impl AyaObjects {
    fn program(&mut self) -> Result<&mut SkLookup, DispatchError> {
        if !self.program_loaded {
            return Err(DispatchError::Closed(KernelObject::Program));
        }
        sk_lookup(&mut self.ebpf)
    }

    fn table(&mut self, object: KernelObject) -> Result<&mut Map, DispatchError> {
        let slot = match object {
            KernelObject::SocketTable => &mut self.socket_table,
            _ => &mut self.ports_table,
        };
        slot.as_mut().ok_or(DispatchError::Closed(object))
    }
}

impl DispatchObjects for AyaObjects {
    fn pin(&mut self, object: KernelObject, path: &Path) -> Result<(), DispatchError> {
        let pin_err = |reason: String| DispatchError::Pin {
            object,
            path: path.to_path_buf(),
            reason,
        };

        match object {
            KernelObject::Program => self
                .program()?
                .pin(path)
                .map_err(|e| pin_err(e.to_string())),
            KernelObject::SocketTable | KernelObject::PortsTable => self
                .table(object)?
                .pin(path)
                .map_err(|e| pin_err(e.to_string())),
            KernelObject::Link => match self.link.take() {
                Some(LinkState::Attached(link)) => {
                    // A failed pin consumes the link and detaches it.
                    let pinned = link.pin(path).map_err(|e| pin_err(e.to_string()))?;
                    self.link = Some(LinkState::Pinned(pinned));
                    Ok(())
                }
                Some(pinned @ LinkState::Pinned(_)) => {
                    self.link = Some(pinned);
                    Err(pin_err("link is already pinned".to_string()))
                }
                None => Err(DispatchError::Closed(KernelObject::Link)),
            },
        }
    }

    fn unpin(&mut self, object: KernelObject, path: &Path) -> Result<(), DispatchError> {
        let unpin_err = |reason: String| DispatchError::Unpin {
            object,
            path: path.to_path_buf(),
            reason,
        };

        if object == KernelObject::Link {
            if let Some(LinkState::Pinned(pinned)) = self.link.take() {
                let link = pinned.unpin().map_err(|e| unpin_err(e.to_string()))?;
                self.link = Some(LinkState::Attached(link));
                return Ok(());
            }
        }

        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unpin_err(e.to_string())),
        }
    }

    fn close(&mut self, object: KernelObject) -> Result<(), DispatchError> {
        match object {
            KernelObject::Program => {
                if !self.program_loaded {
                    return Ok(());
                }
                self.program_loaded = false;
                sk_lookup(&mut self.ebpf)?
                    .unload()
                    .map_err(|e| DispatchError::Close {
                        object,
                        reason: e.to_string(),
                    })
            }
            KernelObject::SocketTable => {
                self.socket_table.take();
                Ok(())
            }
            KernelObject::PortsTable => {
                self.ports_table.take();
                Ok(())
            }
            KernelObject::Link => {
                self.link.take();
                Ok(())
            }
        }
    }

    fn set_socket(&mut self, socket: BorrowedFd<'_>) -> Result<(), DispatchError> {
        let update_err = |reason: String| DispatchError::TableUpdate {
            object: KernelObject::SocketTable,
            reason,
        };

        let map = self.table(KernelObject::SocketTable)?;
        let mut sockets: SockMap<&mut MapData> = SockMap::try_from(map).map_err(|e| {
            DispatchError::WrongObjectType {
                name: SOCKET_MAP_NAME,
                reason: e.to_string(),
            }
        })?;
        sockets
            .set(0, &socket, 0)
            .map_err(|e| update_err(e.to_string()))
    }

    fn add_port(&mut self, port: u16) -> Result<(), DispatchError> {
        let map = self.table(KernelObject::PortsTable)?;
        let mut ports: BpfHashMap<&mut MapData, u16, u8> =
            BpfHashMap::try_from(map).map_err(|e| DispatchError::WrongObjectType {
                name: PORTS_MAP_NAME,
                reason: e.to_string(),
            })?;
        ports
            .insert(port, 0u8, 0)
            .map_err(|e| DispatchError::TableUpdate {
                object: KernelObject::PortsTable,
                reason: format!("port {port}: {e}"),
            })
    }

    fn attach(&mut self, netns: BorrowedFd<'_>) -> Result<(), DispatchError> {
        let program = self.program()?;
        let link_id = program
            .attach(netns)
            .map_err(|e| DispatchError::Attach(e.to_string()))?;
        let link = program
            .take_link(link_id)
            .map_err(|e| DispatchError::Attach(e.to_string()))?;
        self.link = Some(LinkState::Attached(FdLink::from(link)));
        Ok(())
    }
}
