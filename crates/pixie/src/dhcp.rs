//! ProxyDHCP responder.
//!
//! Listens alongside the site's real DHCP server and contributes only
//! boot options: every reply is an OFFER, never an ACK, and the primary
//! server remains responsible for addressing.

use std::sync::Arc;

use dhcp4::options::{
    OPT_CLIENT_MACHINE_ID, OPT_CLIENT_NDI, OPT_CLIENT_SYSTEM_ARCH, OPT_SERVER_IDENTIFIER,
    OPT_USER_CLASS, OPT_VENDOR_IDENTIFIER, OPT_VENDOR_SPECIFIC,
};
use dhcp4::{MessageType, Packet};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;
use crate::events::MachineState;
use crate::server::ServerInner;
use crate::types::{Architecture, Firmware, Machine};

/// PXE boot-server discovery control sub-option, set to "bypass discovery,
/// just boot the filename". The one PXE sub-option iPXE needs to see.
fn pxe_suboptions() -> Vec<u8> {
    vec![6, 1, 8, 255]
}

pub(crate) async fn serve_dhcp(
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
        let (firmware, machine) = match classify(&pkt) {
            Ok(c) => c,
            Err(reason) => {
                debug!("ignoring packet from {} ({}): {}", src, pkt.hardware_addr, reason);
                continue;
            }
        };

        let resp = offer(&pkt, machine, firmware, &inner);
        let raw = match resp.marshal() {
            Ok(raw) => raw,
            Err(e) => {
                debug!("failed to marshal reply for {}: {}", machine.mac, e);
                continue;
            }
        };

        inner.events.record(
            machine.mac,
            MachineState::Dhcp,
            offer_description(firmware),
        );
        if let Err(e) = socket.send_to(&raw, dhcp4::reply_destination(&pkt)).await {
            debug!("failed to send reply to {}: {}", machine.mac, e);
        }
    }
}

fn offer_description(firmware: Firmware) -> &'static str {
    match firmware {
        Firmware::X86Pc => "Offering to boot iPXE over TFTP",
        Firmware::X86Ipxe | Firmware::PixieIpxe => "Offering iPXE boot script over HTTP",
        Firmware::Efi32 | Firmware::Efi64 | Firmware::EfiBc => {
            "Offering empty ProxyDHCP reply, expecting a PXE boot-server request"
        }
    }
}

/// Decides whether a packet is a netboot request we answer, and what kind
/// of firmware sent it. Everything else is dropped without a reply.
fn classify(pkt: &Packet) -> Result<(Firmware, Machine), String> {
    if pkt.msg_type != MessageType::Discover {
        return Err(format!("unhandled message type {:?}", pkt.msg_type));
    }
    match pkt.options.get(OPT_VENDOR_IDENTIFIER) {
        Some(vendor) if vendor.starts_with(b"PXEClient") => {}
        _ => return Err("not a PXE boot request".to_string()),
    }

    // Absence of the architecture option means old legacy-BIOS firmware.
    let arch_code = if pkt.options.has(OPT_CLIENT_SYSTEM_ARCH) {
        pkt.options
            .u16(OPT_CLIENT_SYSTEM_ARCH)
            .map_err(|e| e.to_string())?
    } else {
        0
    };
    let (mut firmware, arch) = match arch_code {
        0 => (Firmware::X86Pc, Architecture::Ia32),
        6 => (Firmware::Efi32, Architecture::Ia32),
        7 => (Firmware::Efi64, Architecture::X64),
        9 => (Firmware::EfiBc, Architecture::X64),
        other => return Err(format!("unsupported client firmware type {}", other)),
    };

    // A user class naming iPXE means the client has already chainloaded
    // into an HTTP-capable loader, so it can go straight to the script.
    if let Some(user_class) = pkt.options.get(OPT_USER_CLASS) {
        if contains_ipxe(user_class) {
            firmware = if firmware == Firmware::X86Pc {
                Firmware::X86Ipxe
            } else {
                Firmware::PixieIpxe
            };
        }
    }

    Ok((
        firmware,
        Machine {
            mac: pkt.hardware_addr,
            arch,
        },
    ))
}

fn contains_ipxe(user_class: &[u8]) -> bool {
    user_class
        .windows(4)
        .any(|window| window == b"iPXE")
}

/// Synthesizes the ProxyDHCP OFFER for a classified request.
fn offer(pkt: &Packet, machine: Machine, firmware: Firmware, inner: &ServerInner) -> Packet {
    let mut resp = pkt.reply(MessageType::Offer);
    resp.server_addr = inner.address;
    resp.options
        .insert(OPT_SERVER_IDENTIFIER, inner.address.octets().to_vec());
    // PXE wants the server to identify itself as a PXEClient vendor type,
    // even though it's a server. Strange, but that's the protocol.
    resp.options
        .insert(OPT_VENDOR_IDENTIFIER, b"PXEClient".to_vec());
    // The client machine identifier gets echoed when the client sent one,
    // and omitted otherwise. Fabricating one breaks some firmware.
    if let Some(guid) = pkt.options.get(OPT_CLIENT_MACHINE_ID) {
        resp.options.insert(OPT_CLIENT_MACHINE_ID, guid.to_vec());
    }
    if let Some(ndi) = pkt.options.get(OPT_CLIENT_NDI) {
        resp.options.insert(OPT_CLIENT_NDI, ndi.to_vec());
    }

    match firmware {
        Firmware::X86Pc => {
            // Completely standard PXE: tell the client to skip boot
            // discovery and load a file straight off our TFTP server.
            resp.boot_server_name = inner.address.to_string();
            resp.boot_filename = firmware.tftp_filename();
        }
        Firmware::X86Ipxe | Firmware::PixieIpxe => {
            // iPXE understands an HTTP URL in the filename field, which
            // skips the whole TFTP round trip.
            resp.boot_filename = format!(
                "http://{}:{}/_/ipxe?mac={}&arch={}",
                inner.address, inner.http_port, machine.mac, machine.arch as i32
            );
            resp.options
                .insert(OPT_VENDOR_SPECIFIC, pxe_suboptions());
        }
        Firmware::Efi32 | Firmware::Efi64 | Firmware::EfiBc => {
            // In theory the X86Pc response should also work for UEFI.  In
            // practice a lot of UEFI firmware ignores ProxyDHCP offers
            // that try to bypass boot server discovery, while seemingly
            // all of it supports the variant where option 43 is absent
            // altogether: the client then behaves as if we were a BINL
            // server and comes back with a request on the PXE boot-server
            // port. BINL is Microsoft-specific and unspecified, but the
            // flow EDK2 implements is simple, so that is what we speak:
            // no filename, no option 43, answer the secondary exchange.
        }
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

    fn discover(arch: Option<u16>, user_class: Option<&[u8]>) -> Packet {
        let mut options = Options::new();
        options.insert(OPT_VENDOR_IDENTIFIER, b"PXEClient:Arch:00000".to_vec());
        if let Some(arch) = arch {
            options.insert(OPT_CLIENT_SYSTEM_ARCH, arch.to_be_bytes().to_vec());
        }
        if let Some(uc) = user_class {
            options.insert(OPT_USER_CLASS, uc.to_vec());
        }
        Packet {
            msg_type: MessageType::Discover,
            transaction_id: [1, 2, 3, 4],
            broadcast: true,
            hardware_addr: "01:02:03:04:05:06".parse().unwrap(),
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
    fn classifies_firmware_breeds() {
        let (fw, m) = classify(&discover(Some(0), None)).unwrap();
        assert_eq!(fw, Firmware::X86Pc);
        assert_eq!(m.arch, Architecture::Ia32);

        let (fw, m) = classify(&discover(Some(7), None)).unwrap();
        assert_eq!(fw, Firmware::Efi64);
        assert_eq!(m.arch, Architecture::X64);

        // Missing architecture means old BIOS firmware.
        let (fw, _) = classify(&discover(None, None)).unwrap();
        assert_eq!(fw, Firmware::X86Pc);

        let (fw, _) = classify(&discover(Some(0), Some(b"iPXE"))).unwrap();
        assert_eq!(fw, Firmware::X86Ipxe);

        let (fw, _) = classify(&discover(Some(7), Some(b"iPXE"))).unwrap();
        assert_eq!(fw, Firmware::PixieIpxe);
    }

    #[test]
    fn ignores_non_pxe_clients() {
        let mut pkt = discover(Some(0), None);
        pkt.options.remove(OPT_VENDOR_IDENTIFIER);
        assert!(classify(&pkt).is_err());

        let mut pkt = discover(Some(0), None);
        pkt.options
            .insert(OPT_VENDOR_IDENTIFIER, b"MSFT 5.0".to_vec());
        assert!(classify(&pkt).is_err());
    }

    #[test]
    fn ignores_unknown_architectures() {
        assert!(classify(&discover(Some(11), None)).is_err());
    }

    #[test]
    fn ignores_non_discover_messages() {
        let mut pkt = discover(Some(0), None);
        pkt.msg_type = MessageType::Request;
        assert!(classify(&pkt).is_err());
    }

    #[test]
    fn bios_offer_points_at_tftp_without_option_43() {
        let inner = inner();
        let pkt = discover(Some(0), None);
        let (fw, machine) = classify(&pkt).unwrap();
        let resp = offer(&pkt, machine, fw, &inner);

        assert_eq!(resp.msg_type, MessageType::Offer);
        assert_eq!(resp.boot_server_name, "192.0.2.1");
        assert_eq!(resp.boot_filename, "0");
        assert!(!resp.options.has(OPT_VENDOR_SPECIFIC));
        assert_eq!(
            resp.options.get(OPT_SERVER_IDENTIFIER),
            Some(&[192, 0, 2, 1][..])
        );
        assert_eq!(resp.options.get(OPT_VENDOR_IDENTIFIER), Some(&b"PXEClient"[..]));
    }

    #[test]
    fn uefi_offer_is_empty() {
        let inner = inner();
        let pkt = discover(Some(7), None);
        let (fw, machine) = classify(&pkt).unwrap();
        let resp = offer(&pkt, machine, fw, &inner);

        assert!(resp.boot_filename.is_empty());
        assert!(resp.boot_server_name.is_empty());
        assert!(!resp.options.has(OPT_VENDOR_SPECIFIC));
    }

    #[test]
    fn ipxe_offer_points_at_http() {
        let inner = inner();
        let pkt = discover(Some(7), Some(b"iPXE"));
        let (fw, machine) = classify(&pkt).unwrap();
        let resp = offer(&pkt, machine, fw, &inner);

        assert_eq!(
            resp.boot_filename,
            "http://192.0.2.1:80/_/ipxe?mac=01:02:03:04:05:06&arch=1"
        );
        assert!(resp.options.has(OPT_VENDOR_SPECIFIC));
    }

    #[test]
    fn client_guid_is_echoed_not_fabricated() {
        let inner = inner();
        let mut pkt = discover(Some(0), None);
        let (fw, machine) = classify(&pkt).unwrap();

        let resp = offer(&pkt, machine, fw, &inner);
        assert!(!resp.options.has(OPT_CLIENT_MACHINE_ID));

        pkt.options
            .insert(OPT_CLIENT_MACHINE_ID, vec![0; 17]);
        let resp = offer(&pkt, machine, fw, &inner);
        assert_eq!(resp.options.get(OPT_CLIENT_MACHINE_ID), Some(&[0u8; 17][..]));
    }
}
