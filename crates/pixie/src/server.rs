//! The server runtime: socket ownership, worker lifecycle, shutdown.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use chrono::Utc;
use dhcp6::boot_configuration::BootConfiguration;
use dhcp6::pool::AddressPool;
use dhcp6::PacketBuilder;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::booter::Booter;
use crate::dhcpv6::V6Inner;
use crate::error::Error;
use crate::events::MachineEvents;
use crate::types::Firmware;
use crate::{dhcp, dhcpv6, http, pxe, tftp};

const PORT_DHCP: u16 = 67;
const PORT_TFTP: u16 = 69;
const PORT_HTTP: u16 = 80;
const PORT_PXE: u16 = 4011;
const PORT_DHCPV6: u16 = 547;

/// The optional DHCPv6/HTTPBoot side of the server.
pub struct Dhcpv6Config {
    /// Listen address; must be assigned to a local interface, whose
    /// hardware address also seeds the server DUID.
    pub address: Ipv6Addr,
    /// 0 means the well-known DHCPv6 server port.
    pub port: u16,
    pub boot_config: Arc<dyn BootConfiguration>,
    pub pool: Arc<dyn AddressPool>,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
}

/// Server configuration.
///
/// Client-side firmware hardcodes the DHCP, TFTP and PXE ports; changing
/// them is only useful for tests.
pub struct Config {
    pub booter: Arc<dyn Booter>,
    /// IPv4 address advertised in DHCP replies and boot URLs. The
    /// listeners bind all interfaces so broadcast traffic is received.
    pub address: Ipv4Addr,
    /// Port 0 selects the well-known default on all four of these.
    pub http_port: u16,
    pub dhcp_port: u16,
    pub tftp_port: u16,
    pub pxe_port: u16,
    /// Share the DHCP port with a local DHCP server instead of claiming
    /// it exclusively. Platform-dependent.
    pub dhcp_no_bind: bool,
    /// The iPXE binaries served over TFTP, keyed by firmware tag.
    pub ipxe: HashMap<Firmware, Vec<u8>>,
    pub dhcpv6: Option<Dhcpv6Config>,
}

impl Config {
    pub fn new(booter: Arc<dyn Booter>) -> Self {
        Config {
            booter,
            address: Ipv4Addr::UNSPECIFIED,
            http_port: 0,
            dhcp_port: 0,
            tftp_port: 0,
            pxe_port: 0,
            dhcp_no_bind: false,
            ipxe: HashMap::new(),
            dhcpv6: None,
        }
    }
}

/// State shared by the IPv4-side protocol handlers.
pub(crate) struct ServerInner {
    pub booter: Arc<dyn Booter>,
    pub events: MachineEvents,
    pub ipxe: HashMap<Firmware, Vec<u8>>,
    pub address: Ipv4Addr,
    pub http_port: u16,
}

/// Triggers an orderly shutdown of a running [`Server`].
///
/// May be signalled at any time, repeatedly; signalling before
/// [`Server::serve`] makes it return immediately.
#[derive(Clone)]
pub struct ShutdownHandle {
    errs: mpsc::Sender<Result<(), Error>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        // Non-blocking by design: if the funnel is full, the server is
        // already on its way down.
        let _ = self.errs.try_send(Ok(()));
    }
}

/// Boots machines using a [`Booter`].
pub struct Server {
    inner: Arc<ServerInner>,
    dhcp_port: u16,
    tftp_port: u16,
    pxe_port: u16,
    dhcp_no_bind: bool,
    dhcpv6: Option<Dhcpv6Config>,
    errs_tx: mpsc::Sender<Result<(), Error>>,
    errs_rx: mpsc::Receiver<Result<(), Error>>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(config: Config) -> Self {
        // One funnel slot per worker plus one for Shutdown(). Only the
        // first value is ever read; the spare capacity lets the remaining
        // workers report their exit without blocking on a channel nobody
        // drains anymore.
        let workers = 4 + usize::from(config.dhcpv6.is_some());
        let (errs_tx, errs_rx) = mpsc::channel(workers + 1);

        let inner = Arc::new(ServerInner {
            booter: config.booter,
            events: MachineEvents::new(),
            ipxe: config.ipxe,
            address: config.address,
            http_port: default_port(config.http_port, PORT_HTTP),
        });

        Server {
            inner,
            dhcp_port: default_port(config.dhcp_port, PORT_DHCP),
            tftp_port: default_port(config.tftp_port, PORT_TFTP),
            pxe_port: default_port(config.pxe_port, PORT_PXE),
            dhcp_no_bind: config.dhcp_no_bind,
            dhcpv6: config.dhcpv6,
            errs_tx,
            errs_rx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            errs: self.errs_tx.clone(),
        }
    }

    /// Listens for machines attempting to boot and drives them through
    /// the boot flow. Returns after the first fatal worker error, or with
    /// `Ok(())` once [`ShutdownHandle::shutdown`] is signalled.
    pub async fn serve(mut self) -> Result<(), Error> {
        if self.inner.address.is_unspecified() {
            return Err(Error::Configuration(
                "an advertised IPv4 address is required".to_string(),
            ));
        }

        // Every socket gets bound before any worker starts, so a bind
        // failure surfaces as a startup error instead of a half-running
        // server.
        let dhcp_socket = dhcp4::create_listener(self.dhcp_port, self.dhcp_no_bind)?;
        let pxe_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.pxe_port)).await?;
        let tftp_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.tftp_port)).await?;
        let http_listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.inner.http_port)).await?;
        let v6 = match &self.dhcpv6 {
            Some(config) => {
                let interface = dhcp6::conn::interface_by_address(config.address)?;
                let socket = dhcp6::conn::create_listener(
                    default_port(config.port, PORT_DHCPV6),
                    interface.index,
                )?;
                debug!(
                    "DHCPv6 listening on {} (interface {})",
                    config.address, interface.name
                );
                let inner = Arc::new(V6Inner {
                    duid: dhcpv6::duid_llt(interface.hardware_addr, Utc::now()),
                    builder: PacketBuilder::new(
                        config.preferred_lifetime,
                        config.valid_lifetime,
                    ),
                    boot_config: config.boot_config.clone(),
                    pool: config.pool.clone(),
                });
                Some((inner, socket))
            }
            None => None,
        };

        info!("netboot services starting on {}", self.inner.address);

        self.spawn(dhcp::serve_dhcp(
            self.inner.clone(),
            dhcp_socket,
            self.shutdown.clone(),
        ));
        self.spawn(pxe::serve_pxe(
            self.inner.clone(),
            pxe_socket,
            self.shutdown.clone(),
        ));
        self.spawn(tftp::serve_tftp(
            self.inner.clone(),
            tftp_socket,
            self.shutdown.clone(),
        ));
        self.spawn(serve_http(
            http_listener,
            http::router(self.inner.clone()),
            self.shutdown.clone(),
        ));
        if let Some((inner, socket)) = v6 {
            self.spawn(dhcpv6::serve_dhcpv6(inner, socket, self.shutdown.clone()));
        }

        // The first value out of the funnel decides the outcome; the
        // cancellation then unwinds every other worker.
        let result = self.errs_rx.recv().await.unwrap_or(Ok(()));
        self.shutdown.cancel();
        info!("netboot services stopped");
        result
    }

    fn spawn(&self, worker: impl std::future::Future<Output = Result<(), Error>> + Send + 'static) {
        let errs = self.errs_tx.clone();
        tokio::spawn(async move {
            let _ = errs.send(worker.await).await;
        });
    }
}

async fn serve_http(
    listener: TcpListener,
    router: axum::Router,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(Error::Io)
}

fn default_port(configured: u16, well_known: u16) -> u16 {
    if configured == 0 {
        well_known
    } else {
        configured
    }
}
