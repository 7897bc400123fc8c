//! Read-only TFTP server for the iPXE chainload binaries.
//!
//! The namespace is exactly the firmware tags configured at startup; the
//! payloads are small enough that plain 512-byte lock-step transfers are
//! acceptable, and PXE-era firmware frequently supports nothing better.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Error;
use crate::server::ServerInner;
use crate::types::Firmware;

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;

const ERR_FILE_NOT_FOUND: u16 = 1;
const ERR_ACCESS_VIOLATION: u16 = 2;

const BLOCK_SIZE: usize = 512;
const ACK_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_RETRANSMITS: usize = 5;

type Transfers = Arc<Mutex<HashMap<IpAddr, (u64, tokio::task::JoinHandle<()>)>>>;

pub(crate) async fn serve_tftp(
    inner: Arc<ServerInner>,
    socket: UdpSocket,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let transfers: Transfers = Arc::new(Mutex::new(HashMap::new()));
    let mut transfer_counter: u64 = 0;
    let mut buf = [0u8; 1500];

    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            r = socket.recv_from(&mut buf) => r?,
        };
        let request = &buf[..len];
        if request.len() < 2 {
            continue;
        }
        match u16::from_be_bytes([request[0], request[1]]) {
            OP_RRQ => {}
            OP_WRQ => {
                debug!("rejecting write request from {}", src);
                let _ = socket
                    .send_to(
                        &error_packet(ERR_ACCESS_VIOLATION, "only reads are supported"),
                        src,
                    )
                    .await;
                continue;
            }
            other => {
                debug!("ignoring TFTP opcode {} from {}", other, src);
                continue;
            }
        }

        let Some(filename) = parse_rrq_filename(&request[2..]) else {
            debug!("malformed read request from {}", src);
            continue;
        };
        let Some(contents) = lookup(&inner.ipxe, &filename) else {
            debug!("read request for unknown file {:?} from {}", filename, src);
            let _ = socket
                .send_to(&error_packet(ERR_FILE_NOT_FOUND, "file not found"), src)
                .await;
            continue;
        };

        transfer_counter += 1;
        let id = transfer_counter;
        let token = shutdown.clone();
        let registry = transfers.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = run_transfer(src, &contents) => match result {
                    Ok(()) => info!("sent {:?} ({} bytes) to {}", filename, contents.len(), src),
                    Err(e) => debug!("transfer of {:?} to {} failed: {}", filename, src, e),
                }
            }
            let mut registry = lock(&registry);
            if registry.get(&src.ip()).map(|(tid, _)| *tid) == Some(id) {
                registry.remove(&src.ip());
            }
        });

        // One transfer per host: a fresh read request aborts whatever was
        // still in flight for that client.
        let mut registry = lock(&transfers);
        if let Some((_, old)) = registry.insert(src.ip(), (id, handle)) {
            old.abort();
        }
    }
}

fn lock(
    transfers: &Mutex<HashMap<IpAddr, (u64, tokio::task::JoinHandle<()>)>>,
) -> std::sync::MutexGuard<'_, HashMap<IpAddr, (u64, tokio::task::JoinHandle<()>)>> {
    transfers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Extracts the filename from an RRQ body (filename NUL mode NUL). The
/// transfer mode is ignored; we always serve binary.
fn parse_rrq_filename(body: &[u8]) -> Option<String> {
    let end = body.iter().position(|&b| b == 0)?;
    String::from_utf8(body[..end].to_vec()).ok()
}

fn lookup(ipxe: &HashMap<Firmware, Vec<u8>>, filename: &str) -> Option<Vec<u8>> {
    let tag = filename.trim_start_matches('/').parse::<u8>().ok()?;
    ipxe.get(&Firmware::from_u8(tag)?).cloned()
}

fn error_packet(code: u16, message: &str) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(4 + message.len() + 1);
    pkt.extend_from_slice(&OP_ERROR.to_be_bytes());
    pkt.extend_from_slice(&code.to_be_bytes());
    pkt.extend_from_slice(message.as_bytes());
    pkt.push(0);
    pkt
}

/// Runs one lock-step transfer from an ephemeral port.
async fn run_transfer(client: SocketAddr, contents: &[u8]) -> Result<(), Error> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect(client).await?;

    let mut sent = 0usize;
    let mut block: u16 = 1;
    loop {
        let end = (sent + BLOCK_SIZE).min(contents.len());
        let chunk = &contents[sent..end];
        send_block(&socket, block, chunk).await?;
        sent = end;
        // A short (or empty) data block terminates the transfer; an exact
        // multiple of the block size needs a trailing empty block.
        if chunk.len() < BLOCK_SIZE {
            return Ok(());
        }
        block = block.wrapping_add(1);
    }
}

async fn send_block(socket: &UdpSocket, block: u16, chunk: &[u8]) -> Result<(), Error> {
    let mut pkt = Vec::with_capacity(4 + chunk.len());
    pkt.extend_from_slice(&OP_DATA.to_be_bytes());
    pkt.extend_from_slice(&block.to_be_bytes());
    pkt.extend_from_slice(chunk);

    for _ in 0..MAX_RETRANSMITS {
        socket.send(&pkt).await?;
        match timeout(ACK_TIMEOUT, wait_for_ack(socket, block)).await {
            Ok(result) => return result,
            Err(_) => continue, // retransmit
        }
    }
    Err(Error::Upstream(format!(
        "no ACK for block {} after {} attempts",
        block, MAX_RETRANSMITS
    )))
}

async fn wait_for_ack(socket: &UdpSocket, block: u16) -> Result<(), Error> {
    let mut buf = [0u8; 512];
    loop {
        let len = socket.recv(&mut buf).await?;
        if len < 4 {
            continue;
        }
        match u16::from_be_bytes([buf[0], buf[1]]) {
            OP_ACK if u16::from_be_bytes([buf[2], buf[3]]) == block => return Ok(()),
            // Stale ACKs for earlier blocks are duplicates; keep waiting.
            OP_ACK => continue,
            OP_ERROR => {
                return Err(Error::Upstream(format!(
                    "client aborted transfer: {}",
                    String::from_utf8_lossy(&buf[4..len])
                )))
            }
            _ => continue,
        }
    }
}
