//! PXE boot-server responder.
//!
//! Handles the secondary exchange UEFI firmware performs after receiving
//! our deliberately empty ProxyDHCP offer: a unicast DHCPREQUEST on port
//! 4011, answered with a DHCPACK naming the TFTP filename for the
//! client's architecture.

use std::sync::Arc;

use dhcp4::options::{
    OPT_CLIENT_MACHINE_ID, OPT_CLIENT_NDI, OPT_CLIENT_SYSTEM_ARCH, OPT_SERVER_IDENTIFIER,
    OPT_VENDOR_IDENTIFIER,
};
use dhcp4::{MessageType, Packet};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;
use crate::events::MachineState;
use crate::server::ServerInner;
use crate::types::Firmware;

pub(crate) async fn serve_pxe(
    inner: Arc<ServerInner>,
    socket: UdpSocket,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let mut buf = [0u8; 1500];
    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            r = socket.recv_from(&mut buf) => r?,
        };

        let pkt = match Packet::unmarshal(&buf[..len]) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!("malformed packet from {}: {}", src, e);
                continue;
            }
        };
        let firmware = match validate(&pkt) {
            Ok(fw) => fw,
            Err(reason) => {
                debug!("ignoring packet from {} ({}): {}", src, pkt.hardware_addr, reason);
                continue;
            }
        };

        let resp = ack(&pkt, firmware, &inner);
        let raw = match resp.marshal() {
            Ok(raw) => raw,
            Err(e) => {
                debug!("failed to marshal reply for {}: {}", pkt.hardware_addr, e);
                continue;
            }
        };

        inner.events.record(
            pkt.hardware_addr,
            MachineState::Pxe,
            "Answered PXE boot-server request",
        );
        // The secondary exchange is unicast both ways.
        if let Err(e) = socket.send_to(&raw, src).await {
            debug!("failed to send reply to {}: {}", pkt.hardware_addr, e);
        }
    }
}

fn validate(pkt: &Packet) -> Result<Firmware, String> {
    if pkt.msg_type != MessageType::Request {
        return Err(format!("unhandled message type {:?}", pkt.msg_type));
    }
    match pkt.options.get(OPT_VENDOR_IDENTIFIER) {
        Some(vendor) if vendor.starts_with(b"PXEClient") => {}
        _ => return Err("not a PXE boot-server request".to_string()),
    }
    let arch_code = pkt
        .options
        .u16(OPT_CLIENT_SYSTEM_ARCH)
        .map_err(|e| e.to_string())?;
    match arch_code {
        0 => Ok(Firmware::X86Pc),
        6 => Ok(Firmware::Efi32),
        7 => Ok(Firmware::Efi64),
        9 => Ok(Firmware::EfiBc),
        other => Err(format!("unsupported client firmware type {}", other)),
    }
}

fn ack(pkt: &Packet, firmware: Firmware, inner: &ServerInner) -> Packet {
    let mut resp = pkt.reply(MessageType::Ack);
    resp.broadcast = false;
    resp.server_addr = inner.address;
    resp.boot_server_name = inner.address.to_string();
    resp.boot_filename = firmware.tftp_filename();
    resp.options
        .insert(OPT_SERVER_IDENTIFIER, inner.address.octets().to_vec());
    resp.options
        .insert(OPT_VENDOR_IDENTIFIER, b"PXEClient".to_vec());
    if let Some(guid) = pkt.options.get(OPT_CLIENT_MACHINE_ID) {
        resp.options.insert(OPT_CLIENT_MACHINE_ID, guid.to_vec());
    }
    if let Some(ndi) = pkt.options.get(OPT_CLIENT_NDI) {
        resp.options.insert(OPT_CLIENT_NDI, ndi.to_vec());
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhcp4::Options;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use crate::booter::StaticBooter;
    use crate::events::MachineEvents;
    use crate::types::BootSpec;

    fn inner() -> ServerInner {
        let booter = StaticBooter::new(BootSpec {
            kernel: crate::types::Id::from("/k"),
            ..BootSpec::default()
        })
        .unwrap();
        ServerInner {
            booter: Arc::new(booter),
            events: MachineEvents::new(),
            ipxe: HashMap::new(),
            address: Ipv4Addr::new(192, 0, 2, 1),
            http_port: 80,
        }
    }

    fn request(arch: u16) -> Packet {
        let mut options = Options::new();
        options.insert(OPT_VENDOR_IDENTIFIER, b"PXEClient".to_vec());
        options.insert(OPT_CLIENT_SYSTEM_ARCH, arch.to_be_bytes().to_vec());
        Packet {
            msg_type: MessageType::Request,
            transaction_id: [9, 9, 9, 9],
            broadcast: false,
            hardware_addr: "0a:0b:0c:0d:0e:0f".parse().unwrap(),
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
    fn acks_with_architecture_matched_filename() {
        let inner = inner();
        let pkt = request(7);
        let fw = validate(&pkt).unwrap();
        let resp = ack(&pkt, fw, &inner);

        assert_eq!(resp.msg_type, MessageType::Ack);
        assert_eq!(resp.transaction_id, pkt.transaction_id);
        assert_eq!(resp.boot_filename, "2");
        assert_eq!(resp.boot_server_name, "192.0.2.1");
    }

    #[test]
    fn rejects_discover_and_foreign_vendors() {
        let mut pkt = request(7);
        pkt.msg_type = MessageType::Discover;
        assert!(validate(&pkt).is_err());

        let mut pkt = request(7);
        pkt.options.insert(OPT_VENDOR_IDENTIFIER, b"HTTPClient".to_vec());
        assert!(validate(&pkt).is_err());

        let mut pkt = request(7);
        pkt.options.remove(OPT_CLIENT_SYSTEM_ARCH);
        assert!(validate(&pkt).is_err());
    }
}
