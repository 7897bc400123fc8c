//! DHCPv6 serve loop and server identity.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dhcp6::boot_configuration::BootConfiguration;
use dhcp6::pool::AddressPool;
use dhcp6::{Packet, PacketBuilder};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;

// 2000-01-01T00:00:00Z, the DUID-LLT time epoch (RFC 3315 §9.2).
const DUID_EPOCH_UNIX: i64 = 946_684_800;

pub(crate) struct V6Inner {
    pub duid: Vec<u8>,
    pub builder: PacketBuilder,
    pub boot_config: Arc<dyn BootConfiguration>,
    pub pool: Arc<dyn AddressPool>,
}

/// Builds this server's DUID-LLT: type 1, hardware type 1 (Ethernet),
/// seconds since the 2000-01-01 epoch, link-layer address.
pub(crate) fn duid_llt(hardware_addr: [u8; 6], now: DateTime<Utc>) -> Vec<u8> {
    let seconds = (now.timestamp() - DUID_EPOCH_UNIX).max(0) as u32;
    let mut duid = Vec::with_capacity(14);
    duid.extend_from_slice(&[0, 1]);
    duid.extend_from_slice(&[0, 1]);
    duid.extend_from_slice(&seconds.to_be_bytes());
    duid.extend_from_slice(&hardware_addr);
    duid
}

pub(crate) async fn serve_dhcpv6(
    v6: Arc<V6Inner>,
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
        if let Err(reason) = pkt.should_discard(&v6.duid) {
            debug!(
                "discarding {:?} packet (xid {:02x?}): {}",
                pkt.msg_type, pkt.transaction_id, reason
            );
            continue;
        }

        let response = match v6
            .builder
            .build_response(&pkt, &v6.duid, v6.boot_config.as_ref(), v6.pool.as_ref())
            .await
        {
            Ok(Some(response)) => response,
            Ok(None) => {
                debug!(
                    "don't know how to respond to {:?} (xid {:02x?})",
                    pkt.msg_type, pkt.transaction_id
                );
                continue;
            }
            Err(e) => {
                warn!(
                    "error creating response for xid {:02x?}: {}",
                    pkt.transaction_id, e
                );
                continue;
            }
        };

        let dest = SocketAddr::new(src.ip(), dhcp6::conn::CLIENT_PORT);
        if let Err(e) = socket.send_to(&response.marshal(), dest).await {
            warn!(
                "error sending {:?} reply (xid {:02x?}): {}",
                response.msg_type, response.transaction_id, e
            );
        }
    }
}
