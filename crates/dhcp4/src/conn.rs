//! Listener construction and reply addressing.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::packet::Packet;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

/// Creates a broadcast-capable UDP listener for DHCP traffic.
///
/// The socket binds all interfaces: DHCPDISCOVER arrives on the broadcast
/// address and would never reach a socket bound to a specific IP. With
/// `no_bind` the port is shared with an existing DHCP server via
/// `SO_REUSEPORT`, which the kernel only offers on some platforms.
pub fn create_listener(port: u16, no_bind: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    if no_bind {
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        #[cfg(not(unix))]
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "port sharing is not available on this platform",
        ));
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    UdpSocket::from_std(socket.into())
}

/// Picks where a reply to `pkt` should be sent.
///
/// Relayed packets go back through the relay on the server port. Clients
/// that already hold an address and did not ask for broadcast are answered
/// unicast; everyone else gets the limited broadcast.
pub fn reply_destination(pkt: &Packet) -> SocketAddrV4 {
    if !pkt.relay_addr.is_unspecified() {
        return SocketAddrV4::new(pkt.relay_addr, SERVER_PORT);
    }
    if !pkt.client_addr.is_unspecified() && !pkt.broadcast {
        return SocketAddrV4::new(pkt.client_addr, CLIENT_PORT);
    }
    SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MessageType;
    use crate::Options;

    fn packet() -> Packet {
        Packet {
            msg_type: MessageType::Discover,
            transaction_id: [0; 4],
            broadcast: false,
            hardware_addr: Default::default(),
            client_addr: Ipv4Addr::UNSPECIFIED,
            your_addr: Ipv4Addr::UNSPECIFIED,
            server_addr: Ipv4Addr::UNSPECIFIED,
            relay_addr: Ipv4Addr::UNSPECIFIED,
            boot_server_name: String::new(),
            boot_filename: String::new(),
            options: Options::new(),
        }
    }

    #[test]
    fn relayed_replies_go_to_relay() {
        let mut pkt = packet();
        pkt.relay_addr = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(
            reply_destination(&pkt),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), SERVER_PORT)
        );
    }

    #[test]
    fn addressless_clients_get_broadcast() {
        assert_eq!(
            reply_destination(&packet()),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT)
        );
    }

    #[test]
    fn addressed_clients_get_unicast() {
        let mut pkt = packet();
        pkt.client_addr = Ipv4Addr::new(192, 0, 2, 9);
        assert_eq!(
            reply_destination(&pkt),
            SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 9), CLIENT_PORT)
        );
    }
}
