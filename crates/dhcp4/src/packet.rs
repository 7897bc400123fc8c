//! DHCPv4 packet structure and (un)marshalling.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::mac::Mac;
use crate::options::{Options, OPT_MESSAGE_TYPE};

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const HEADER_LEN: usize = 236;
const HTYPE_ETHERNET: u8 = 1;
const BROADCAST_FLAG: u16 = 0x8000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short to be DHCP")]
    Truncated,
    #[error("invalid BOOTP op {0}")]
    InvalidOp(u8),
    #[error("unsupported hardware address (htype {htype}, hlen {hlen})")]
    UnsupportedHardware { htype: u8, hlen: u8 },
    #[error("missing DHCP magic cookie")]
    MissingCookie,
    #[error("options lack an end marker")]
    MissingEndMarker,
    #[error("missing required option {0}")]
    MissingOption(u8),
    #[error("malformed option {code}: {reason}")]
    MalformedOption { code: u8, reason: String },
    #[error("invalid DHCP message type {0}")]
    InvalidMessageType(u8),
}

/// DHCP message types, from option 53.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Result<Self, PacketError> {
        Ok(match v {
            1 => MessageType::Discover,
            2 => MessageType::Offer,
            3 => MessageType::Request,
            4 => MessageType::Decline,
            5 => MessageType::Ack,
            6 => MessageType::Nak,
            7 => MessageType::Release,
            8 => MessageType::Inform,
            other => return Err(PacketError::InvalidMessageType(other)),
        })
    }

    /// BOOTP op field: client-to-server messages are BOOTREQUEST.
    fn bootp_op(self) -> u8 {
        match self {
            MessageType::Discover
            | MessageType::Request
            | MessageType::Decline
            | MessageType::Release
            | MessageType::Inform => 1,
            MessageType::Offer | MessageType::Ack | MessageType::Nak => 2,
        }
    }
}

/// A parsed DHCPv4 packet.
///
/// The message type lives in its own field rather than the option map, so
/// option 53 never appears in [`Packet::options`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub msg_type: MessageType,
    pub transaction_id: [u8; 4],
    pub broadcast: bool,
    pub hardware_addr: Mac,

    pub client_addr: Ipv4Addr,
    pub your_addr: Ipv4Addr,
    pub server_addr: Ipv4Addr,
    pub relay_addr: Ipv4Addr,

    pub boot_server_name: String,
    pub boot_filename: String,

    pub options: Options,
}

impl Packet {
    /// Returns a reply skeleton echoing the transaction id, hardware
    /// address and relay address of `self`.
    pub fn reply(&self, msg_type: MessageType) -> Packet {
        Packet {
            msg_type,
            transaction_id: self.transaction_id,
            broadcast: true,
            hardware_addr: self.hardware_addr,
            client_addr: Ipv4Addr::UNSPECIFIED,
            your_addr: Ipv4Addr::UNSPECIFIED,
            server_addr: Ipv4Addr::UNSPECIFIED,
            relay_addr: self.relay_addr,
            boot_server_name: String::new(),
            boot_filename: String::new(),
            options: Options::new(),
        }
    }

    pub fn unmarshal(bs: &[u8]) -> Result<Packet, PacketError> {
        if bs.len() < HEADER_LEN + 4 {
            return Err(PacketError::Truncated);
        }
        if bs[0] != 1 && bs[0] != 2 {
            return Err(PacketError::InvalidOp(bs[0]));
        }
        if bs[1] != HTYPE_ETHERNET || bs[2] != 6 {
            return Err(PacketError::UnsupportedHardware {
                htype: bs[1],
                hlen: bs[2],
            });
        }
        if bs[HEADER_LEN..HEADER_LEN + 4] != MAGIC_COOKIE {
            return Err(PacketError::MissingCookie);
        }

        let mut options = Options::unmarshal(&bs[HEADER_LEN + 4..])?;
        let type_value = options
            .remove(OPT_MESSAGE_TYPE)
            .ok_or(PacketError::MissingOption(OPT_MESSAGE_TYPE))?;
        if type_value.len() != 1 {
            return Err(PacketError::MalformedOption {
                code: OPT_MESSAGE_TYPE,
                reason: format!("expected 1 byte, have {}", type_value.len()),
            });
        }

        let mut transaction_id = [0u8; 4];
        transaction_id.copy_from_slice(&bs[4..8]);
        let flags = u16::from_be_bytes([bs[10], bs[11]]);
        let mut hw = [0u8; 6];
        hw.copy_from_slice(&bs[28..34]);

        Ok(Packet {
            msg_type: MessageType::from_u8(type_value[0])?,
            transaction_id,
            broadcast: flags & BROADCAST_FLAG != 0,
            hardware_addr: Mac::from(hw),
            client_addr: read_ip(&bs[12..16]),
            your_addr: read_ip(&bs[16..20]),
            server_addr: read_ip(&bs[20..24]),
            relay_addr: read_ip(&bs[24..28]),
            boot_server_name: read_cstr(&bs[44..108]),
            boot_filename: read_cstr(&bs[108..236]),
            options,
        })
    }

    pub fn marshal(&self) -> Result<Vec<u8>, PacketError> {
        if self.boot_server_name.len() >= 64 {
            return Err(PacketError::MalformedOption {
                code: 0,
                reason: "boot server name too long".to_string(),
            });
        }
        if self.boot_filename.len() >= 128 {
            return Err(PacketError::MalformedOption {
                code: 0,
                reason: "boot filename too long".to_string(),
            });
        }

        let mut out = Vec::with_capacity(HEADER_LEN + 4 + 64);
        out.push(self.msg_type.bootp_op());
        out.push(HTYPE_ETHERNET);
        out.push(6); // hlen
        out.push(0); // hops
        out.extend_from_slice(&self.transaction_id);
        out.extend_from_slice(&[0, 0]); // secs
        let flags: u16 = if self.broadcast { BROADCAST_FLAG } else { 0 };
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&self.client_addr.octets());
        out.extend_from_slice(&self.your_addr.octets());
        out.extend_from_slice(&self.server_addr.octets());
        out.extend_from_slice(&self.relay_addr.octets());
        out.extend_from_slice(&self.hardware_addr.octets());
        out.extend_from_slice(&[0u8; 10]); // chaddr padding
        write_padded(&mut out, self.boot_server_name.as_bytes(), 64);
        write_padded(&mut out, self.boot_filename.as_bytes(), 128);
        out.extend_from_slice(&MAGIC_COOKIE);
        out.push(OPT_MESSAGE_TYPE);
        out.push(1);
        out.push(self.msg_type as u8);
        self.options.marshal(&mut out)?;
        Ok(out)
    }
}

fn read_ip(bs: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bs[0], bs[1], bs[2], bs[3])
}

fn read_cstr(bs: &[u8]) -> String {
    let end = bs.iter().position(|&b| b == 0).unwrap_or(bs.len());
    String::from_utf8_lossy(&bs[..end]).into_owned()
}

fn write_padded(out: &mut Vec<u8>, bs: &[u8], width: usize) {
    out.extend_from_slice(bs);
    out.extend(std::iter::repeat(0).take(width - bs.len()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{OPT_CLIENT_SYSTEM_ARCH, OPT_VENDOR_IDENTIFIER};

    fn sample_discover() -> Packet {
        let mut options = Options::new();
        options.insert(OPT_VENDOR_IDENTIFIER, b"PXEClient:Arch:00000".to_vec());
        options.insert(OPT_CLIENT_SYSTEM_ARCH, vec![0, 0]);
        Packet {
            msg_type: MessageType::Discover,
            transaction_id: [0xde, 0xad, 0xbe, 0xef],
            broadcast: true,
            hardware_addr: "52:54:00:12:34:56".parse().unwrap(),
            client_addr: Ipv4Addr::UNSPECIFIED,
            your_addr: Ipv4Addr::UNSPECIFIED,
            server_addr: Ipv4Addr::UNSPECIFIED,
            relay_addr: Ipv4Addr::UNSPECIFIED,
            boot_server_name: String::new(),
            boot_filename: String::new(),
            options,
        }
    }

    #[test]
    fn roundtrip() {
        let pkt = sample_discover();
        let raw = pkt.marshal().unwrap();
        assert_eq!(Packet::unmarshal(&raw).unwrap(), pkt);
    }

    #[test]
    fn roundtrip_with_bootp_fields() {
        let mut pkt = sample_discover();
        pkt.msg_type = MessageType::Offer;
        pkt.your_addr = Ipv4Addr::new(192, 0, 2, 7);
        pkt.server_addr = Ipv4Addr::new(192, 0, 2, 1);
        pkt.relay_addr = Ipv4Addr::new(192, 0, 2, 254);
        pkt.boot_server_name = "192.0.2.1".to_string();
        pkt.boot_filename = "0".to_string();

        let raw = pkt.marshal().unwrap();
        assert_eq!(Packet::unmarshal(&raw).unwrap(), pkt);
    }

    #[test]
    fn raw_frame_reaches_a_fixpoint() {
        // A hand-assembled DHCPDISCOVER the way firmware actually sends
        // it: pad bytes between options, trailing padding after the end
        // marker, and a parameter request list.
        let mut raw = vec![0u8; HEADER_LEN];
        raw[0] = 1; // BOOTREQUEST
        raw[1] = HTYPE_ETHERNET;
        raw[2] = 6;
        raw[4..8].copy_from_slice(&[0x13, 0x37, 0xbe, 0xef]);
        raw[10] = 0x80; // broadcast flag
        raw[28..34].copy_from_slice(&[0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc]);
        raw.extend_from_slice(&MAGIC_COOKIE);
        raw.extend_from_slice(&[53, 1, 1]); // DHCPDISCOVER
        raw.extend_from_slice(&[0, 0]); // pad
        raw.extend_from_slice(&[55, 3, 1, 3, 6]); // parameter request list
        raw.extend_from_slice(&[60, 9]);
        raw.extend_from_slice(b"PXEClient");
        raw.extend_from_slice(&[93, 2, 0, 7]);
        raw.push(255);
        raw.extend_from_slice(&[0, 0, 0, 0]); // trailing padding

        let pkt = Packet::unmarshal(&raw).unwrap();
        assert_eq!(pkt.msg_type, MessageType::Discover);
        assert!(pkt.broadcast);
        assert_eq!(pkt.hardware_addr.to_string(), "52:54:00:aa:bb:cc");
        assert_eq!(pkt.options.get(60), Some(&b"PXEClient"[..]));
        assert_eq!(pkt.options.u16(93).unwrap(), 7);

        // Serialization normalizes layout, so one round trip reaches the
        // fixpoint: parse(serialize(p)) == p and the bytes stabilize.
        let once = pkt.marshal().unwrap();
        let again = Packet::unmarshal(&once).unwrap();
        assert_eq!(again, pkt);
        assert_eq!(again.marshal().unwrap(), once);
    }

    #[test]
    fn rejects_short_packet() {
        assert_eq!(Packet::unmarshal(&[1, 1, 6]), Err(PacketError::Truncated));
    }

    #[test]
    fn rejects_missing_cookie() {
        let mut raw = sample_discover().marshal().unwrap();
        raw[HEADER_LEN] = 0;
        assert_eq!(Packet::unmarshal(&raw), Err(PacketError::MissingCookie));
    }

    #[test]
    fn rejects_non_ethernet() {
        let mut raw = sample_discover().marshal().unwrap();
        raw[1] = 6; // IEEE 802
        assert!(matches!(
            Packet::unmarshal(&raw),
            Err(PacketError::UnsupportedHardware { .. })
        ));
    }

    #[test]
    fn rejects_missing_message_type() {
        let mut raw = sample_discover().marshal().unwrap();
        // Blank out option 53 (first option after the cookie).
        raw[HEADER_LEN + 4] = 0;
        raw[HEADER_LEN + 5] = 0;
        raw[HEADER_LEN + 6] = 0;
        assert_eq!(
            Packet::unmarshal(&raw),
            Err(PacketError::MissingOption(OPT_MESSAGE_TYPE))
        );
    }
}
