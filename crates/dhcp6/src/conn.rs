//! DHCPv6 multicast listener construction.

use std::io;
use std::net::{Ipv6Addr, SocketAddrV6};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// The All_DHCP_Relay_Agents_and_Servers multicast group.
pub const MULTICAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x1, 0x2);

/// The port clients listen on for replies.
pub const CLIENT_PORT: u16 = 546;

/// A network interface identified by one of its addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub hardware_addr: [u8; 6],
}

/// Finds the interface carrying `address`, along with its index and
/// hardware address (needed for the server DUID).
pub fn interface_by_address(address: Ipv6Addr) -> io::Result<Interface> {
    let addrs = nix::ifaddrs::getifaddrs()?;
    let mut name = None;
    for ifaddr in addrs {
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(sin6) = storage.as_sockaddr_in6() {
            if sin6.ip() == address {
                name = Some(ifaddr.interface_name);
                break;
            }
        }
    }
    let name = name.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no interface carries address {}", address),
        )
    })?;

    for ifaddr in nix::ifaddrs::getifaddrs()? {
        if ifaddr.interface_name != name {
            continue;
        }
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(link) = storage.as_link_addr() {
            if let Some(hardware_addr) = link.addr() {
                return Ok(Interface {
                    name,
                    index: link.ifindex() as u32,
                    hardware_addr,
                });
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("interface {} has no hardware address", name),
    ))
}

/// Creates the DHCPv6 listener: bound to the wildcard address on `port`,
/// joined to the relay-agents-and-servers group on `interface_index`.
/// Group and interface filtering is the kernel's job once the membership
/// is scoped to that interface.
pub fn create_listener(port: u16, interface_index: u32) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_only_v6(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    std_socket.join_multicast_v6(&MULTICAST_GROUP, interface_index)?;
    UdpSocket::from_std(std_socket)
}
