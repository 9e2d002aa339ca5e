//! Enumeration of the IPv4 addresses assigned to local network interfaces.

use crate::error::Result;
use std::net::{IpAddr, Ipv4Addr};

/// One address of one local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub addr: IpAddr,
    pub loopback: bool,
}

/// Lists the IPv4 addresses of every interface that is up.
#[cfg(not(windows))]
pub fn ifaces() -> Result<Vec<Interface>> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let mut interfaces = vec![];
    for ifaddr in getifaddrs().map_err(std::io::Error::from)? {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP) {
            continue;
        }
        let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };

        interfaces.push(Interface {
            name: ifaddr.interface_name.clone(),
            addr: IpAddr::V4(Ipv4Addr::from(sin.ip())),
            loopback: ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK),
        });
    }

    Ok(interfaces)
}

/// Lists the loopback address and the address of the interface holding the
/// default route. Connecting a UDP socket does not put anything on the wire.
#[cfg(windows)]
pub fn ifaces() -> Result<Vec<Interface>> {
    use std::net::UdpSocket;

    let mut interfaces = vec![Interface {
        name: "loopback".to_owned(),
        addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        loopback: true,
    }];

    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    if probe.connect((Ipv4Addr::new(8, 8, 8, 8), 53)).is_ok() {
        let local = probe.local_addr()?;
        if !local.ip().is_unspecified() && !local.ip().is_loopback() {
            interfaces.push(Interface {
                name: "default".to_owned(),
                addr: local.ip(),
                loopback: false,
            });
        }
    }

    Ok(interfaces)
}

/// Local IPv4 addresses in interface order, without duplicates. Loopback
/// addresses are only listed when `include_loopback` is set.
pub fn local_addresses(include_loopback: bool) -> Result<Vec<IpAddr>> {
    let mut addrs: Vec<IpAddr> = vec![];
    for iface in ifaces()? {
        if iface.loopback && !include_loopback {
            continue;
        }
        if !addrs.contains(&iface.addr) {
            addrs.push(iface.addr);
        }
    }
    Ok(addrs)
}
