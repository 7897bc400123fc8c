//! Netboot daemon.
//!
//! Wires a booter and a set of iPXE binaries into a [`pixie::Server`].
//! Configuration comes from `PIXIE_*` environment variables:
//!
//! - `PIXIE_ADDRESS` (required): IPv4 address advertised to clients.
//! - `PIXIE_HTTP_PORT`, `PIXIE_DHCP_PORT`, `PIXIE_TFTP_PORT`,
//!   `PIXIE_PXE_PORT`: listener ports, defaulting to the well-known ones.
//! - `PIXIE_DHCP_NO_BIND`: share the DHCP port with a local DHCP server.
//! - `PIXIE_API_URL` (+ `PIXIE_API_TIMEOUT_SECS`): delegate boot
//!   decisions to a remote API server; or
//! - `PIXIE_KERNEL`, `PIXIE_INITRD` (comma-separated), `PIXIE_CMDLINE`,
//!   `PIXIE_MESSAGE`: boot every machine with one static spec.
//! - `PIXIE_IPXE_BIOS`, `PIXIE_IPXE_EFI32`, `PIXIE_IPXE_EFI64`,
//!   `PIXIE_IPXE_EFIBC`: paths to the iPXE binaries served over TFTP.
//! - `PIXIE_DHCPV6_ADDRESS` plus `PIXIE_HTTPBOOT_URL`, `PIXIE_IPXE_URL`,
//!   `PIXIE_POOL_START`, `PIXIE_POOL_SIZE`, `PIXIE_LIFETIME`: enable the
//!   DHCPv6/HTTPBoot listener.

use std::env;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dhcp6::pool::RandomAddressPool;
use pixie::boot_configuration::{ApiBootConfiguration, StaticBootConfiguration};
use pixie::{
    ApiBooter, BootSpec, Booter, Config, Dhcpv6Config, Firmware, Id, Server, StaticBooter,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = load_config()?;
    let server = Server::new(config);

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    server.serve().await.context("netboot server failed")?;
    Ok(())
}

fn load_config() -> Result<Config> {
    let address: Ipv4Addr = env::var("PIXIE_ADDRESS")
        .context("PIXIE_ADDRESS environment variable is required")?
        .parse()
        .context("PIXIE_ADDRESS is not an IPv4 address")?;

    let mut config = Config::new(build_booter()?);
    config.address = address;
    config.http_port = port_var("PIXIE_HTTP_PORT")?;
    config.dhcp_port = port_var("PIXIE_DHCP_PORT")?;
    config.tftp_port = port_var("PIXIE_TFTP_PORT")?;
    config.pxe_port = port_var("PIXIE_PXE_PORT")?;
    config.dhcp_no_bind = env::var("PIXIE_DHCP_NO_BIND").is_ok();
    config.ipxe = load_ipxe_binaries()?;
    config.dhcpv6 = build_dhcpv6()?;

    info!("advertised address: {}", address);
    Ok(config)
}

fn build_booter() -> Result<Arc<dyn Booter>> {
    if let Ok(api_url) = env::var("PIXIE_API_URL") {
        let timeout = match env::var("PIXIE_API_TIMEOUT_SECS") {
            Ok(secs) => Duration::from_secs(
                secs.parse().context("PIXIE_API_TIMEOUT_SECS is not a number")?,
            ),
            Err(_) => Duration::from_secs(5),
        };
        info!("using boot API at {}", api_url);
        return Ok(Arc::new(ApiBooter::new(&api_url, timeout)?));
    }

    let kernel = env::var("PIXIE_KERNEL")
        .context("either PIXIE_API_URL or PIXIE_KERNEL must be set")?;
    let initrd = env::var("PIXIE_INITRD")
        .map(|v| v.split(',').map(Id::from).collect())
        .unwrap_or_default();
    let spec = BootSpec {
        kernel: Id::from(kernel.as_str()),
        initrd,
        cmdline: env::var("PIXIE_CMDLINE").unwrap_or_default(),
        message: env::var("PIXIE_MESSAGE").ok(),
        ipxe_script: None,
    };
    info!("booting all machines with kernel {}", kernel);
    Ok(Arc::new(StaticBooter::new(spec)?))
}

fn load_ipxe_binaries() -> Result<std::collections::HashMap<Firmware, Vec<u8>>> {
    let sources = [
        ("PIXIE_IPXE_BIOS", Firmware::X86Pc),
        ("PIXIE_IPXE_EFI32", Firmware::Efi32),
        ("PIXIE_IPXE_EFI64", Firmware::Efi64),
        ("PIXIE_IPXE_EFIBC", Firmware::EfiBc),
    ];
    let mut ipxe = std::collections::HashMap::new();
    for (var, firmware) in sources {
        if let Ok(path) = env::var(var) {
            let contents =
                std::fs::read(&path).with_context(|| format!("reading {} ({})", var, path))?;
            info!("serving {} ({} bytes) for {:?}", path, contents.len(), firmware);
            ipxe.insert(firmware, contents);
        }
    }
    if ipxe.is_empty() {
        bail!("no iPXE binaries configured; set at least PIXIE_IPXE_BIOS");
    }
    Ok(ipxe)
}

fn build_dhcpv6() -> Result<Option<Dhcpv6Config>> {
    let Ok(address) = env::var("PIXIE_DHCPV6_ADDRESS") else {
        return Ok(None);
    };
    let address: Ipv6Addr = address
        .parse()
        .context("PIXIE_DHCPV6_ADDRESS is not an IPv6 address")?;

    let preference = match env::var("PIXIE_DHCPV6_PREFERENCE") {
        Ok(v) => Some(v.parse().context("PIXIE_DHCPV6_PREFERENCE is not a byte")?),
        Err(_) => None,
    };
    let dns = match env::var("PIXIE_DHCPV6_DNS") {
        Ok(v) => v
            .split(',')
            .map(|s| s.trim().parse::<Ipv6Addr>())
            .collect::<Result<Vec<_>, _>>()
            .context("PIXIE_DHCPV6_DNS contains an invalid IPv6 address")?,
        Err(_) => Vec::new(),
    };

    let pool_start: Ipv6Addr = env::var("PIXIE_POOL_START")
        .context("PIXIE_POOL_START is required for DHCPv6")?
        .parse()
        .context("PIXIE_POOL_START is not an IPv6 address")?;
    let pool_size: u64 = env::var("PIXIE_POOL_SIZE")
        .context("PIXIE_POOL_SIZE is required for DHCPv6")?
        .parse()
        .context("PIXIE_POOL_SIZE is not a number")?;
    let valid_lifetime: u32 = match env::var("PIXIE_LIFETIME") {
        Ok(v) => v.parse().context("PIXIE_LIFETIME is not a number")?,
        Err(_) => 1800,
    };
    let preferred_lifetime: u32 = match env::var("PIXIE_PREFERRED_LIFETIME") {
        Ok(v) => v.parse().context("PIXIE_PREFERRED_LIFETIME is not a number")?,
        Err(_) => valid_lifetime,
    };

    let boot_config: Arc<dyn dhcp6::BootConfiguration> =
        if let Ok(api_url) = env::var("PIXIE_DHCPV6_API_URL") {
            Arc::new(
                ApiBootConfiguration::new(&api_url, Duration::from_secs(5), preference, dns)
                    .map_err(|e| anyhow::anyhow!("building DHCPv6 API configuration: {}", e))?,
            )
        } else {
            let http_boot_url = env::var("PIXIE_HTTPBOOT_URL")
                .context("PIXIE_HTTPBOOT_URL is required for DHCPv6")?;
            let ipxe_url =
                env::var("PIXIE_IPXE_URL").context("PIXIE_IPXE_URL is required for DHCPv6")?;
            Arc::new(StaticBootConfiguration::new(
                &http_boot_url,
                &ipxe_url,
                preference,
                dns,
            ))
        };

    info!("DHCPv6 enabled on {}", address);
    Ok(Some(Dhcpv6Config {
        address,
        port: port_var("PIXIE_DHCPV6_PORT")?,
        boot_config,
        pool: Arc::new(RandomAddressPool::new(pool_start, pool_size, valid_lifetime)),
        preferred_lifetime,
        valid_lifetime,
    }))
}

fn port_var(name: &str) -> Result<u16> {
    match env::var(name) {
        Ok(v) => v.parse().with_context(|| format!("{} is not a port number", name)),
        Err(_) => Ok(0),
    }
}
