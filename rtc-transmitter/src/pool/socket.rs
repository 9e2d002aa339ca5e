//! Socket construction for pooled endpoints.
//!
//! [`EndpointSocket`] builds the `std::net::UdpSocket` behind one pool entry:
//!
//! - unicast endpoints are bound to the requested local address and port
//! - multicast endpoints enable `SO_REUSEADDR`/`SO_REUSEPORT`, set the
//!   multicast TTL, keep multicast loopback enabled so a receiver on the same
//!   host sees a local sender, and join the group on the requested interface
//!
//! Every socket is non-blocking and carries the session type-of-service byte
//! when one is configured.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

#[derive(Debug, Clone)]
pub(crate) struct EndpointSocket {
    local_ip: Option<IpAddr>,
    group: Option<Ipv4Addr>,
    port: u16,
    ttl: u8,
    tos: Option<u8>,
}

impl EndpointSocket {
    pub(crate) fn new(port: u16) -> Self {
        Self {
            local_ip: None,
            group: None,
            port,
            ttl: 1,
            tos: None,
        }
    }

    pub(crate) fn with_local_ip(mut self, local_ip: Option<IpAddr>) -> Self {
        self.local_ip = local_ip;
        self
    }

    pub(crate) fn with_group(mut self, group: Ipv4Addr, ttl: u8) -> Self {
        self.group = Some(group);
        self.ttl = ttl;
        self
    }

    pub(crate) fn with_tos(mut self, tos: Option<u8>) -> Self {
        self.tos = tos;
        self
    }

    /// Creates, configures and binds the socket. Nothing outlives a failed
    /// step: the half-configured socket is closed when it goes out of scope.
    pub(crate) fn into_std(self) -> io::Result<UdpSocket> {
        match self.group {
            Some(group) => self.bind_multicast(group),
            None => self.bind_unicast(),
        }
    }

    fn bind_unicast(&self) -> io::Result<UdpSocket> {
        let local_ip = self.local_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let domain = if local_ip.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if local_ip.is_ipv4() {
            self.apply_tos(&socket)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(local_ip, self.port).into())?;

        Ok(socket.into())
    }

    fn bind_multicast(&self, group: Ipv4Addr) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

        // Several sessions on one host may listen to the same group and port
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
        socket.set_reuse_port(true)?;

        socket.set_nonblocking(true)?;
        socket.set_multicast_ttl_v4(u32::from(self.ttl))?;
        socket.set_multicast_loop_v4(true)?;
        self.apply_tos(&socket)?;

        let interface = match self.local_ip {
            Some(IpAddr::V4(ip)) => ip,
            _ => Ipv4Addr::UNSPECIFIED,
        };
        if !interface.is_unspecified() {
            socket.set_multicast_if_v4(&interface)?;
        }

        let bind_ip = if cfg!(target_os = "linux") {
            group
        } else {
            // Binding to the group address only works on linux
            Ipv4Addr::UNSPECIFIED
        };
        socket.bind(&SocketAddr::new(IpAddr::V4(bind_ip), self.port).into())?;
        socket.join_multicast_v4(&group, &interface)?;

        Ok(socket.into())
    }

    #[cfg(not(any(
        target_os = "fuchsia",
        target_os = "redox",
        target_os = "solaris",
        target_os = "illumos"
    )))]
    fn apply_tos(&self, socket: &Socket) -> io::Result<()> {
        if let Some(tos) = self.tos {
            socket.set_tos(u32::from(tos))?;
        }
        Ok(())
    }

    #[cfg(any(
        target_os = "fuchsia",
        target_os = "redox",
        target_os = "solaris",
        target_os = "illumos"
    ))]
    fn apply_tos(&self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }
}
