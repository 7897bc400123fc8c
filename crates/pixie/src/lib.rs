//! Netboot orchestrator core.
//!
//! Drives PXE and UEFI clients from power-on to a running kernel without
//! reconfiguring the site's existing DHCP infrastructure. A [`Server`]
//! multiplexes the four IPv4-side listeners (ProxyDHCP, PXE boot server,
//! TFTP, HTTP) plus an optional DHCPv6/HTTPBoot listener, all answering
//! from the same in-memory state:
//!
//! - ProxyDHCP offers tell PXE firmware where to fetch an iPXE build over
//!   TFTP (UEFI firmware is steered through the secondary boot-server
//!   exchange on port 4011 instead).
//! - Once chainloaded, iPXE re-discovers and is handed an HTTP URL, from
//!   which it fetches a generated boot script.
//! - The script's kernel/initrd references are opaque [`Id`]s resolved
//!   through the configured [`Booter`], so upstream locations never appear
//!   on the wire.
//!
//! Nothing is persisted; a restart intentionally invalidates every URL in
//! flight.

pub mod boot_configuration;
pub mod booter;
pub mod cmdline;
pub mod dhcp;
pub mod dhcpv6;
pub mod error;
pub mod events;
pub mod http;
pub mod pxe;
pub mod server;
pub mod tftp;
pub mod types;
pub mod urlsign;


pub use booter::{ApiBooter, BootFile, Booter, StaticBooter};
pub use error::Error;
pub use events::{MachineEvent, MachineEvents, MachineState};
pub use server::{Config, Dhcpv6Config, Server, ShutdownHandle};
pub use types::{Architecture, BootSpec, Firmware, Id, Machine};

pub use dhcp4::Mac;
