//! Source of boot-file URLs for DHCPv6 replies.

use std::net::Ipv6Addr;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootConfigurationError {
    #[error("couldn't fetch boot URL: {0}")]
    Fetch(String),
    #[error("invalid boot URL: {0}")]
    InvalidUrl(String),
}

/// Provides the values a DHCPv6 reply advertises to a booting client.
///
/// The architecture type a client reports picks between an HTTPBoot URL and
/// an iPXE configuration URL; the preference byte and recursive DNS list
/// are optional extras.
#[async_trait]
pub trait BootConfiguration: Send + Sync {
    /// The Boot File URL (RFC 5970) for a client with the given id and
    /// architecture type.
    async fn boot_url(
        &self,
        client_id: &[u8],
        client_arch_type: u16,
    ) -> Result<Vec<u8>, BootConfigurationError>;

    /// The server preference byte (RFC 3315), if one is configured.
    fn preference(&self) -> Option<u8>;

    /// Recursive DNS servers to advertise (RFC 3646); may be empty.
    fn recursive_dns(&self) -> &[Ipv6Addr];
}
