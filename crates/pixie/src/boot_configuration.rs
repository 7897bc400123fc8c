//! DHCPv6 boot configuration sources.
//!
//! Static values fixed at startup, or a remote API queried per client.

use std::net::Ipv6Addr;
use std::time::Duration;

use async_trait::async_trait;
use dhcp6::boot_configuration::{BootConfiguration, BootConfigurationError};
use url::Url;

/// Boot URLs that remain unchanged until restart.
pub struct StaticBootConfiguration {
    http_boot_url: Vec<u8>,
    ipxe_boot_url: Vec<u8>,
    preference: Option<u8>,
    recursive_dns: Vec<Ipv6Addr>,
}

impl StaticBootConfiguration {
    pub fn new(
        http_boot_url: &str,
        ipxe_boot_url: &str,
        preference: Option<u8>,
        recursive_dns: Vec<Ipv6Addr>,
    ) -> Self {
        StaticBootConfiguration {
            http_boot_url: http_boot_url.as_bytes().to_vec(),
            ipxe_boot_url: ipxe_boot_url.as_bytes().to_vec(),
            preference,
            recursive_dns,
        }
    }
}

#[async_trait]
impl BootConfiguration for StaticBootConfiguration {
    async fn boot_url(
        &self,
        _client_id: &[u8],
        client_arch_type: u16,
    ) -> Result<Vec<u8>, BootConfigurationError> {
        if client_arch_type == dhcp6::packet_builder::ARCH_HTTP_CLIENT {
            Ok(self.http_boot_url.clone())
        } else {
            Ok(self.ipxe_boot_url.clone())
        }
    }

    fn preference(&self) -> Option<u8> {
        self.preference
    }

    fn recursive_dns(&self) -> &[Ipv6Addr] {
        &self.recursive_dns
    }
}

/// Boot URLs fetched from a remote server per client id and
/// architecture type.
pub struct ApiBootConfiguration {
    client: reqwest::Client,
    url_prefix: String,
    preference: Option<u8>,
    recursive_dns: Vec<Ipv6Addr>,
}

impl ApiBootConfiguration {
    pub fn new(
        api_url: &str,
        timeout: Duration,
        preference: Option<u8>,
        recursive_dns: Vec<Ipv6Addr>,
    ) -> Result<Self, BootConfigurationError> {
        let mut url = api_url.to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BootConfigurationError::Fetch(e.to_string()))?;
        Ok(ApiBootConfiguration {
            client,
            url_prefix: url + "v1",
            preference,
            recursive_dns,
        })
    }

    fn make_url_absolute(&self, url_str: &str) -> Result<String, BootConfigurationError> {
        match Url::parse(url_str) {
            Ok(u) => Ok(u.to_string()),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = Url::parse(&self.url_prefix)
                    .map_err(|e| BootConfigurationError::InvalidUrl(e.to_string()))?;
                Ok(base
                    .join(url_str)
                    .map_err(|e| BootConfigurationError::InvalidUrl(e.to_string()))?
                    .to_string())
            }
            Err(e) => Err(BootConfigurationError::InvalidUrl(e.to_string())),
        }
    }
}

#[async_trait]
impl BootConfiguration for ApiBootConfiguration {
    async fn boot_url(
        &self,
        client_id: &[u8],
        client_arch_type: u16,
    ) -> Result<Vec<u8>, BootConfigurationError> {
        let req_url = format!(
            "{}/boot/{}/{}",
            self.url_prefix,
            hex(client_id),
            client_arch_type
        );
        let resp = self
            .client
            .get(&req_url)
            .send()
            .await
            .map_err(|e| BootConfigurationError::Fetch(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BootConfigurationError::Fetch(format!(
                "{}: {}",
                req_url,
                resp.status()
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| BootConfigurationError::Fetch(e.to_string()))?;
        let url = self.make_url_absolute(body.trim())?;
        Ok(url.into_bytes())
    }

    fn preference(&self) -> Option<u8> {
        self.preference
    }

    fn recursive_dns(&self) -> &[Ipv6Addr] {
        &self.recursive_dns
    }
}

fn hex(bs: &[u8]) -> String {
    bs.iter().map(|b| format!("{:02x}", b)).collect()
}
