//! Unix datagram sockets behind the shared memory transport.
//!
//! Every stream binds one socket per component at a filesystem path and
//! sends to the path of its remote. The [`ShmHub`] of a transmitter keeps
//! the live sockets so that its fan points can reach them.

use crate::gate::GatedEndpoint;
use bytes::BytesMut;
use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

const RECEIVE_MTU: usize = 65536;

static NEXT_PATH: AtomicU64 = AtomicU64::new(0);

/// A fresh socket path in the temporary directory.
pub(crate) fn default_path(component_id: u16) -> PathBuf {
    let n = NEXT_PATH.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "rtc-shm-{}-{n}-{component_id}",
        std::process::id()
    ))
}

struct LinkEntry {
    component_id: u16,
    socket: Arc<UnixDatagram>,
    remote: Option<PathBuf>,
    sending: bool,
    receiving: bool,
}

#[derive(Default)]
struct HubState {
    links: BTreeMap<u64, LinkEntry>,
    next_id: u64,
}

impl HubState {
    fn entry_mut(&mut self, id: u64) -> Result<&mut LinkEntry> {
        self.links
            .get_mut(&id)
            .ok_or_else(|| Error::Other(format!("shm link {id} is not registered")))
    }
}

/// The sockets of one session.
#[derive(Clone, Default)]
pub(crate) struct ShmHub {
    state: Arc<Mutex<HubState>>,
}

impl ShmHub {
    /// Binds a socket at `path` for one component of a stream.
    pub(crate) fn bind(&self, component_id: u16, path: PathBuf) -> Result<ShmLink> {
        let socket = UnixDatagram::bind(&path).map_err(|err| {
            Error::ErrConstruction(format!("can't bind {}: {err}", path.display()))
        })?;
        if let Err(err) = socket.set_nonblocking(true) {
            drop(socket);
            let _ = std::fs::remove_file(&path);
            return Err(err.into());
        }

        let mut state = self.state.lock()?;
        state.next_id += 1;
        let id = state.next_id;
        state.links.insert(
            id,
            LinkEntry {
                component_id,
                socket: Arc::new(socket),
                remote: None,
                sending: false,
                receiving: false,
            },
        );
        log::debug!("shm link {id} bound at {} for component {component_id}", path.display());

        Ok(ShmLink {
            state: Arc::clone(&self.state),
            id,
            component_id,
            path,
            remote: None,
            sending: false,
            receiving: false,
            released: false,
        })
    }

    /// Number of bound sockets.
    pub(crate) fn len(&self) -> Result<usize> {
        Ok(self.state.lock()?.links.len())
    }

    /// Sends `payload` to the remote of every sending link of the component.
    pub(crate) fn send(&self, component_id: u16, payload: &[u8]) -> Result<usize> {
        let targets: Vec<(Arc<UnixDatagram>, PathBuf)> = {
            let state = self.state.lock()?;
            state
                .links
                .values()
                .filter(|link| link.component_id == component_id && link.sending)
                .filter_map(|link| {
                    link.remote
                        .clone()
                        .map(|remote| (Arc::clone(&link.socket), remote))
                })
                .collect()
        };

        let mut sent = 0;
        let mut last_err = None;
        for (socket, remote) in targets {
            match socket.send_to(payload, &remote) {
                Ok(_) => sent += 1,
                Err(err) => {
                    log::warn!(
                        "failed to send {} bytes to {}: {err}",
                        payload.len(),
                        remote.display()
                    );
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(err) if sent == 0 => Err(err.into()),
            _ => Ok(sent),
        }
    }

    /// Reads one datagram sent by the remote of a receiving link.
    pub(crate) fn recv(&self, component_id: u16) -> Result<Option<TaggedBytesMut>> {
        let sources: Vec<(Arc<UnixDatagram>, Option<PathBuf>, bool)> = {
            let state = self.state.lock()?;
            state
                .links
                .values()
                .filter(|link| link.component_id == component_id)
                .map(|link| (Arc::clone(&link.socket), link.remote.clone(), link.receiving))
                .collect()
        };

        let mut buf = vec![0u8; RECEIVE_MTU];
        for (socket, remote, receiving) in sources {
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((n, source)) => {
                        let from_remote = remote
                            .as_deref()
                            .is_none_or(|remote| source.as_pathname() == Some(remote));
                        if !receiving || !from_remote {
                            log::trace!("dropping {n} bytes from {source:?}");
                            continue;
                        }
                        return Ok(Some(TaggedBytesMut {
                            now: Instant::now(),
                            transport: TransportContext::default(),
                            message: BytesMut::from(&buf[..n]),
                        }));
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(None)
    }
}

/// One bound socket of a stream. The socket closes and its path is removed
/// when the link is dropped.
pub(crate) struct ShmLink {
    state: Arc<Mutex<HubState>>,
    id: u64,
    component_id: u16,
    path: PathBuf,
    remote: Option<PathBuf>,
    sending: bool,
    receiving: bool,
    released: bool,
}

impl fmt::Debug for ShmLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmLink")
            .field("id", &self.id)
            .field("component_id", &self.component_id)
            .field("path", &self.path)
            .field("remote", &self.remote)
            .field("sending", &self.sending)
            .field("receiving", &self.receiving)
            .finish()
    }
}

impl ShmLink {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn remote(&self) -> Option<&Path> {
        self.remote.as_deref()
    }

    pub(crate) fn set_remote(&mut self, remote: PathBuf) -> Result<()> {
        let mut state = self.state.lock()?;
        state.entry_mut(self.id)?.remote = Some(remote.clone());
        log::trace!("shm link {} now talks to {}", self.id, remote.display());
        self.remote = Some(remote);
        Ok(())
    }

    pub(crate) fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let removed = self.state.lock()?.links.remove(&self.id);
        drop(removed);
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }
        log::debug!("shm link {} at {} closed", self.id, self.path.display());
        Ok(())
    }
}

impl GatedEndpoint for ShmLink {
    fn component_id(&self) -> u16 {
        self.component_id
    }

    fn is_sending(&self) -> bool {
        self.sending
    }

    fn is_receiving(&self) -> bool {
        self.receiving
    }

    fn set_sending(&mut self, sending: bool) -> Result<bool> {
        if self.sending == sending {
            return Ok(false);
        }
        self.state.lock()?.entry_mut(self.id)?.sending = sending;
        self.sending = sending;
        Ok(sending)
    }

    fn set_receiving(&mut self, receiving: bool) -> Result<()> {
        if self.receiving == receiving {
            return Ok(());
        }
        self.state.lock()?.entry_mut(self.id)?.receiving = receiving;
        self.receiving = receiving;
        Ok(())
    }
}

impl Drop for ShmLink {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            log::warn!("failed to release shm link {}: {err}", self.id);
        }
    }
}
