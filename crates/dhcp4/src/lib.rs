//! DHCPv4/BOOTP wire codec.
//!
//! Implements just enough of RFC 2131/2132 to act as a ProxyDHCP boot
//! responder: a structural packet type with deterministic marshalling, a
//! TLV option map, and helpers for constructing the broadcast-capable
//! listeners the DHCP and PXE boot-server loops read from.

pub mod conn;
pub mod mac;
pub mod options;
pub mod packet;

pub use conn::{create_listener, reply_destination, CLIENT_PORT, SERVER_PORT};
pub use mac::Mac;
pub use options::{Options, OPT_MESSAGE_TYPE};
pub use packet::{MessageType, Packet, PacketError};
