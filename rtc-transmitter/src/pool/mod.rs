//! Reference counted sharing of real sockets between streams.
//!
//! Every distinct [`EndpointKey`] maps to one open socket. Streams acquire an
//! [`EndpointRef`] for a key; the first acquire opens the socket, later ones
//! share it, and the socket is closed when the last handle is released or
//! dropped.
//!
//! Multicast entries keep a multiset of the TTL requested by each handle and
//! always apply the largest outstanding request to the socket.
//!
//! Inbound datagrams are filtered per handle. On a unicast entry a datagram is
//! forwarded when its source is the destination of a receiving handle, or,
//! for sources no handle talks to, when a receiving handle has no destination
//! yet. A multicast entry forwards whenever any handle receives.
//!
//! Bookkeeping is guarded by one pool wide mutex. Sending and receiving go
//! through the socket directly and never hold the lock while doing I/O.


pub(crate) mod socket;

use bytes::BytesMut;
use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext, TransportProtocol};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use socket::EndpointSocket;

pub(crate) const RECEIVE_MTU: usize = 8192;

/// Identifies one socket of the pool, unique for the lifetime of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What makes two requests share a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub component_id: u16,
    pub local_ip: Option<IpAddr>,
    pub group: Option<Ipv4Addr>,
    /// The requested port. A unicast socket may end up bound elsewhere when
    /// the requested port is taken.
    pub port: u16,
}

/// Parameters of [`EndpointPool::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRequest {
    pub component_id: u16,
    pub local_ip: Option<IpAddr>,
    pub group: Option<IpAddr>,
    pub port: u16,
    pub ttl: Option<u8>,
}

impl EndpointRequest {
    /// A unicast socket on `local_ip` (any address when `None`) and `port`.
    /// Port 0 lets the system choose.
    pub fn unicast(component_id: u16, local_ip: Option<IpAddr>, port: u16) -> Self {
        Self {
            component_id,
            local_ip,
            group: None,
            port,
            ttl: None,
        }
    }

    /// A socket joined to `group`, using the interface of `local_ip` when set.
    pub fn multicast(
        component_id: u16,
        local_ip: Option<IpAddr>,
        group: IpAddr,
        port: u16,
        ttl: u8,
    ) -> Self {
        Self {
            component_id,
            local_ip,
            group: Some(group),
            port,
            ttl: Some(ttl),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PeerFilter {
    handles: usize,
    receiving: usize,
}

/// Which sources of an entry are forwarded to the fan-in point.
#[derive(Debug, Default, Clone)]
struct ReceiveFilter {
    multicast: bool,
    receivers: usize,
    /// Receiving handles without a destination.
    unbound: usize,
    peers: BTreeMap<SocketAddr, PeerFilter>,
}

impl ReceiveFilter {
    fn forwards(&self, source: SocketAddr) -> bool {
        if self.receivers == 0 {
            return false;
        }
        if self.multicast {
            return true;
        }
        match self.peers.get(&source) {
            Some(peer) => peer.receiving > 0,
            None => self.unbound > 0,
        }
    }

    fn add(&mut self, peer: Option<SocketAddr>, receiving: bool) {
        match peer {
            Some(peer) => {
                let filter = self.peers.entry(peer).or_default();
                filter.handles += 1;
                if receiving {
                    filter.receiving += 1;
                }
            }
            None if receiving => self.unbound += 1,
            None => {}
        }
    }

    fn remove(&mut self, peer: Option<SocketAddr>, receiving: bool) {
        match peer {
            Some(peer) => {
                if let Some(filter) = self.peers.get_mut(&peer) {
                    filter.handles -= 1;
                    if receiving {
                        filter.receiving -= 1;
                    }
                    if filter.handles == 0 {
                        self.peers.remove(&peer);
                    }
                }
            }
            None if receiving => self.unbound -= 1,
            None => {}
        }
    }
}

struct Endpoint {
    id: EndpointId,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    refcount: usize,
    ttls: BTreeMap<u8, usize>,
    ttl: Option<u8>,
    senders: usize,
    destinations: BTreeMap<SocketAddr, usize>,
    filter: ReceiveFilter,
}

impl Endpoint {
    fn register_ttl(&mut self, ttl: u8) -> Result<()> {
        if self.ttl.is_none_or(|current| ttl > current) {
            self.socket.set_multicast_ttl_v4(u32::from(ttl))?;
            log::trace!("endpoint {} raised ttl to {ttl}", self.id);
            self.ttl = Some(ttl);
        }
        *self.ttls.entry(ttl).or_default() += 1;
        Ok(())
    }

    fn unregister_ttl(&mut self, ttl: u8) {
        if let Some(count) = self.ttls.get_mut(&ttl) {
            *count -= 1;
            if *count == 0 {
                self.ttls.remove(&ttl);
            }
        }

        let Some(&max) = self.ttls.keys().next_back() else {
            return;
        };
        if Some(max) != self.ttl {
            match self.socket.set_multicast_ttl_v4(u32::from(max)) {
                Ok(()) => {
                    log::trace!("endpoint {} lowered ttl to {max}", self.id);
                    self.ttl = Some(max);
                }
                Err(err) => log::warn!("endpoint {} failed to lower ttl to {max}: {err}", self.id),
            }
        }
    }

    fn add_destination(&mut self, destination: SocketAddr) {
        *self.destinations.entry(destination).or_default() += 1;
    }

    fn remove_destination(&mut self, destination: SocketAddr) {
        if let Some(count) = self.destinations.get_mut(&destination) {
            *count -= 1;
            if *count == 0 {
                self.destinations.remove(&destination);
            }
        }
    }
}

#[derive(Default)]
struct PoolState {
    endpoints: HashMap<EndpointKey, Endpoint>,
    next_id: u64,
}

impl PoolState {
    fn endpoint_mut(&mut self, key: &EndpointKey, id: EndpointId) -> Result<&mut Endpoint> {
        match self.endpoints.get_mut(key) {
            Some(endpoint) if endpoint.id == id => Ok(endpoint),
            _ => Err(Error::Other(format!("endpoint {id} is not in the pool"))),
        }
    }
}

/// The sockets of one session.
///
/// Cloning is cheap and every clone refers to the same sockets.
#[derive(Clone)]
pub struct EndpointPool {
    state: Arc<Mutex<PoolState>>,
    components: u16,
    tos: Option<u8>,
}

impl EndpointPool {
    pub fn new(components: u16, tos: Option<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState::default())),
            components,
            tos,
        }
    }

    pub fn components(&self) -> u16 {
        self.components
    }

    /// Returns a handle on the socket for `request`, opening the socket if no
    /// other handle holds it.
    pub fn acquire(&self, request: &EndpointRequest) -> Result<EndpointRef> {
        let key = self.validate(request)?;

        {
            let mut state = self.state.lock()?;
            if let Some(endpoint) = state.endpoints.get_mut(&key) {
                return self.share(key, endpoint, request.ttl);
            }
        }

        // Open the socket without holding the lock
        let socket = self.bind(&key, request.ttl)?;
        let local_addr = socket
            .local_addr()
            .map_err(|err| Error::ErrConstruction(err.to_string()))?;

        let mut state = self.state.lock()?;
        if let Some(endpoint) = state.endpoints.get_mut(&key) {
            let shared = self.share(key, endpoint, request.ttl);
            drop(state);
            log::debug!("{key:?} was opened concurrently, closing duplicate socket {local_addr}");
            drop(socket);
            return shared;
        }

        state.next_id += 1;
        let id = EndpointId(state.next_id);
        let mut endpoint = Endpoint {
            id,
            socket: Arc::new(socket),
            local_addr,
            refcount: 0,
            ttls: BTreeMap::new(),
            ttl: request.ttl,
            senders: 0,
            destinations: BTreeMap::new(),
            filter: ReceiveFilter {
                multicast: key.group.is_some(),
                ..Default::default()
            },
        };
        let endpoint_ref = self.share(key, &mut endpoint, request.ttl)?;
        state.endpoints.insert(key, endpoint);
        log::debug!("endpoint {id} opened on {local_addr} for {key:?}");

        Ok(endpoint_ref)
    }

    /// Releases a handle. Equivalent to dropping it, but reports errors.
    pub fn release(&self, endpoint: EndpointRef) -> Result<()> {
        endpoint.release()
    }

    fn validate(&self, request: &EndpointRequest) -> Result<EndpointKey> {
        if request.component_id == 0 || request.component_id > self.components {
            return Err(Error::ErrInvalidComponent(request.component_id));
        }

        let group = match request.group {
            Some(IpAddr::V4(group)) if group.is_multicast() => {
                if request.ttl.is_none_or(|ttl| ttl == 0) {
                    return Err(Error::ErrInvalidTtl);
                }
                if request.local_ip.is_some_and(|ip| !ip.is_ipv4()) {
                    return Err(Error::ErrInvalidArguments(
                        "multicast interface must be an IPv4 address".to_owned(),
                    ));
                }
                Some(group)
            }
            Some(group) => return Err(Error::ErrNotMulticastAddress(group.to_string())),
            None => {
                if request.ttl.is_some() {
                    return Err(Error::ErrInvalidArguments(
                        "ttl only applies to multicast endpoints".to_owned(),
                    ));
                }
                None
            }
        };

        Ok(EndpointKey {
            component_id: request.component_id,
            local_ip: request.local_ip,
            group,
            port: request.port,
        })
    }

    fn bind(&self, key: &EndpointKey, ttl: Option<u8>) -> Result<UdpSocket> {
        let builder = |port: u16| {
            let builder = EndpointSocket::new(port)
                .with_local_ip(key.local_ip)
                .with_tos(self.tos);
            match key.group {
                Some(group) => builder.with_group(group, ttl.unwrap_or(1)),
                None => builder,
            }
        };

        if key.group.is_some() || key.port == 0 {
            return Ok(builder(key.port).into_std()?);
        }

        let mut port = key.port;
        loop {
            match builder(port).into_std() {
                Ok(socket) => return Ok(socket),
                Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                    log::debug!("port {port} is in use for {key:?}");
                    port = port
                        .checked_add(2)
                        .ok_or(Error::ErrNoPortAvailable(key.port))?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn share(
        &self,
        key: EndpointKey,
        endpoint: &mut Endpoint,
        ttl: Option<u8>,
    ) -> Result<EndpointRef> {
        if let Some(ttl) = ttl {
            endpoint.register_ttl(ttl)?;
        }
        endpoint.refcount += 1;
        log::trace!(
            "endpoint {} on {} now has {} references",
            endpoint.id,
            endpoint.local_addr,
            endpoint.refcount
        );

        Ok(EndpointRef {
            state: Arc::clone(&self.state),
            key,
            id: endpoint.id,
            socket: Arc::clone(&endpoint.socket),
            local_addr: endpoint.local_addr,
            ttl,
            destination: key
                .group
                .map(|group| SocketAddr::new(IpAddr::V4(group), key.port)),
            sending: false,
            receiving: false,
            released: false,
        })
    }

    /// Whether a socket is open for `key`.
    pub fn contains(&self, key: &EndpointKey) -> Result<bool> {
        Ok(self.state.lock()?.endpoints.contains_key(key))
    }

    /// Number of open sockets.
    pub fn len(&self) -> Result<usize> {
        Ok(self.state.lock()?.endpoints.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Poisons the pool lock so that every later operation fails.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let state = Arc::clone(&self.state);
        let _ = std::thread::spawn(move || {
            let _guard = state.lock();
            panic!("poisoning the endpoint pool");
        })
        .join();
    }

    /// Number of handles on the socket for `key`, 0 when it is closed.
    pub fn refcount(&self, key: &EndpointKey) -> Result<usize> {
        Ok(self
            .state
            .lock()?
            .endpoints
            .get(key)
            .map_or(0, |e| e.refcount))
    }

    /// The TTL currently applied to the multicast socket for `key`.
    pub fn ttl(&self, key: &EndpointKey) -> Result<Option<u8>> {
        Ok(self.state.lock()?.endpoints.get(key).and_then(|e| e.ttl))
    }

    /// Number of handles currently sending on the socket for `key`.
    pub fn sender_count(&self, key: &EndpointKey) -> Result<usize> {
        Ok(self
            .state
            .lock()?
            .endpoints
            .get(key)
            .map_or(0, |e| e.senders))
    }

    /// Number of handles currently receiving on the socket for `key`.
    pub fn receiver_count(&self, key: &EndpointKey) -> Result<usize> {
        Ok(self
            .state
            .lock()?
            .endpoints
            .get(key)
            .map_or(0, |e| e.filter.receivers))
    }

    /// Sends `payload` to every enabled destination of every socket of the
    /// component. Returns the number of datagrams sent.
    pub fn send(&self, component_id: u16, payload: &[u8]) -> Result<usize> {
        let targets: Vec<(Arc<UdpSocket>, Vec<SocketAddr>)> = {
            let state = self.state.lock()?;
            state
                .endpoints
                .iter()
                .filter(|(key, e)| key.component_id == component_id && !e.destinations.is_empty())
                .map(|(_, e)| {
                    (
                        Arc::clone(&e.socket),
                        e.destinations.keys().copied().collect(),
                    )
                })
                .collect()
        };

        let mut sent = 0;
        let mut last_err = None;
        for (socket, destinations) in targets {
            for destination in destinations {
                match socket.send_to(payload, destination) {
                    Ok(_) => sent += 1,
                    Err(err) => {
                        log::warn!("failed to send {} bytes to {destination}: {err}", payload.len());
                        last_err = Some(err);
                    }
                }
            }
        }

        match last_err {
            Some(err) if sent == 0 => Err(err.into()),
            _ => Ok(sent),
        }
    }

    /// Reads one pending datagram from any socket of the component.
    ///
    /// Datagrams no receiving handle accepts are read and discarded. Returns
    /// `None` when nothing is pending.
    pub fn recv(&self, component_id: u16) -> Result<Option<TaggedBytesMut>> {
        let sources: Vec<(Arc<UdpSocket>, SocketAddr, ReceiveFilter)> = {
            let state = self.state.lock()?;
            state
                .endpoints
                .iter()
                .filter(|(key, _)| key.component_id == component_id)
                .map(|(_, e)| (Arc::clone(&e.socket), e.local_addr, e.filter.clone()))
                .collect()
        };

        let mut buf = vec![0u8; RECEIVE_MTU];
        for (socket, local_addr, filter) in sources {
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((n, peer_addr)) => {
                        if !filter.forwards(peer_addr) {
                            log::trace!("dropping {n} bytes from {peer_addr}, nobody receives them");
                            continue;
                        }
                        return Ok(Some(TaggedBytesMut {
                            now: Instant::now(),
                            transport: TransportContext {
                                local_addr,
                                peer_addr,
                                transport_protocol: TransportProtocol::UDP,
                                ecn: None,
                            },
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

/// An owned reference on a pooled socket.
///
/// The reference is released when the handle is dropped; [`EndpointRef::release`]
/// does the same and reports errors.
pub struct EndpointRef {
    state: Arc<Mutex<PoolState>>,
    key: EndpointKey,
    id: EndpointId,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    ttl: Option<u8>,
    destination: Option<SocketAddr>,
    sending: bool,
    receiving: bool,
    released: bool,
}

impl fmt::Debug for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRef")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("local_addr", &self.local_addr)
            .field("destination", &self.destination)
            .field("sending", &self.sending)
            .field("receiving", &self.receiving)
            .finish()
    }
}

impl EndpointRef {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The shared socket. Usable without going through the pool lock.
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// The TTL this handle registered, for multicast endpoints.
    pub fn ttl(&self) -> Option<u8> {
        self.ttl
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    /// The source this handle receives from, `None` for multicast entries and
    /// for unicast handles without a destination.
    fn peer(&self) -> Option<SocketAddr> {
        match self.key.group {
            Some(_) => None,
            None => self.destination,
        }
    }

    /// Changes where this handle sends to and receives from. While sending,
    /// the send registration moves from the old destination to the new one.
    pub fn set_destination(&mut self, destination: Option<SocketAddr>) -> Result<()> {
        if self.destination == destination {
            return Ok(());
        }

        let mut state = self.state.lock()?;
        let endpoint = state.endpoint_mut(&self.key, self.id)?;
        if self.sending {
            if let Some(old) = self.destination {
                endpoint.remove_destination(old);
            }
            if let Some(new) = destination {
                endpoint.add_destination(new);
            }
        }
        endpoint.filter.remove(self.peer(), self.receiving);
        self.destination = destination;
        endpoint.filter.add(self.peer(), self.receiving);

        Ok(())
    }

    /// Registers or unregisters this handle as a sender. Returns `true` when
    /// the socket had no sender before.
    pub fn set_sending(&mut self, sending: bool) -> Result<bool> {
        if self.sending == sending {
            return Ok(false);
        }

        let mut state = self.state.lock()?;
        let endpoint = state.endpoint_mut(&self.key, self.id)?;
        let started = if sending {
            endpoint.senders += 1;
            if let Some(destination) = self.destination {
                endpoint.add_destination(destination);
            }
            endpoint.senders == 1
        } else {
            endpoint.senders -= 1;
            if let Some(destination) = self.destination {
                endpoint.remove_destination(destination);
            }
            if endpoint.senders == 0 {
                log::trace!("endpoint {} stopped sending", self.id);
            }
            false
        };
        self.sending = sending;

        Ok(started)
    }

    /// Registers or unregisters this handle as a receiver.
    pub fn set_receiving(&mut self, receiving: bool) -> Result<()> {
        if self.receiving == receiving {
            return Ok(());
        }

        let mut state = self.state.lock()?;
        let endpoint = state.endpoint_mut(&self.key, self.id)?;
        if receiving {
            endpoint.filter.receivers += 1;
        } else {
            endpoint.filter.receivers -= 1;
        }
        endpoint.filter.remove(self.peer(), self.receiving);
        endpoint.filter.add(self.peer(), receiving);
        self.receiving = receiving;

        Ok(())
    }

    /// Gives the reference back to the pool, closing the socket if this was
    /// the last one.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let closed = {
            let mut state = self.state.lock()?;
            let endpoint = state.endpoint_mut(&self.key, self.id)?;

            if self.sending {
                endpoint.senders -= 1;
                if let Some(destination) = self.destination {
                    endpoint.remove_destination(destination);
                }
            }
            if self.receiving {
                endpoint.filter.receivers -= 1;
            }
            endpoint.filter.remove(self.peer(), self.receiving);
            if let Some(ttl) = self.ttl {
                endpoint.unregister_ttl(ttl);
            }
            endpoint.refcount -= 1;

            if endpoint.refcount == 0 {
                state.endpoints.remove(&self.key)
            } else {
                None
            }
        };

        // The socket closes once the last clone of it is gone, outside the lock
        if let Some(endpoint) = closed {
            log::debug!("endpoint {} on {} closed", endpoint.id, endpoint.local_addr);
        }

        Ok(())
    }
}

impl Drop for EndpointRef {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            log::warn!("failed to release endpoint {}: {err}", self.id);
        }
    }
}
