//! Reply synthesis for inbound DHCPv6 packets.

use tracing::warn;

use crate::boot_configuration::{BootConfiguration, BootConfigurationError};
use crate::options::{
    self, Dhcp6Option, Options, OPT_CLIENT_ID, OPT_SERVER_ID, STATUS_NO_ADDRS_AVAILABLE,
};
use crate::packet::{MessageType, Packet};
use crate::pool::{AddressPool, IdentityAssociation, Reservation};

/// The architecture type HTTPBoot firmware reports (RFC 5970).
pub const ARCH_HTTP_CLIENT: u16 = 0x10;

/// Builds replies for validated inbound packets.
///
/// Stateless apart from the advertised lifetimes; the pool carries all
/// mutable state.
pub struct PacketBuilder {
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
}

impl PacketBuilder {
    pub fn new(preferred_lifetime: u32, valid_lifetime: u32) -> Self {
        PacketBuilder {
            preferred_lifetime,
            valid_lifetime,
        }
    }

    /// Generates the response for a packet that passed
    /// [`Packet::should_discard`]. `None` means the message type has no
    /// reply defined.
    pub async fn build_response(
        &self,
        incoming: &Packet,
        server_duid: &[u8],
        configuration: &dyn BootConfiguration,
        addresses: &dyn AddressPool,
    ) -> Result<Option<Packet>, BootConfigurationError> {
        let client_id = incoming.options.client_id().unwrap_or_default().to_vec();
        let arch_type = incoming.options.client_arch_type();

        match incoming.msg_type {
            MessageType::Solicit => {
                let boot_file_url = configuration
                    .boot_url(extract_ll_address_or_id(&client_id), arch_type)
                    .await?;
                let reservation =
                    addresses.reserve_addresses(&client_id, &incoming.options.ia_na_ids());
                if let Some(failure) = &reservation.failure {
                    warn!("allocation failed for solicit: {}", failure);
                    return Ok(Some(self.advertise_no_addrs_available(
                        incoming.transaction_id,
                        server_duid,
                        &client_id,
                        &failure.to_string(),
                    )));
                }
                Ok(Some(self.advertise(
                    incoming.transaction_id,
                    server_duid,
                    &client_id,
                    arch_type,
                    &reservation.associations,
                    &boot_file_url,
                    configuration,
                )))
            }
            MessageType::Request => {
                let boot_file_url = configuration
                    .boot_url(extract_ll_address_or_id(&client_id), arch_type)
                    .await?;
                let requested = incoming.options.ia_na_ids();
                let reservation = addresses.reserve_addresses(&client_id, &requested);
                if let Some(failure) = &reservation.failure {
                    warn!("allocation failed for request: {}", failure);
                }
                Ok(Some(self.reply(
                    incoming.transaction_id,
                    server_duid,
                    &client_id,
                    arch_type,
                    &reservation,
                    &requested,
                    &boot_file_url,
                    configuration,
                )))
            }
            MessageType::InformationRequest => {
                let boot_file_url = configuration
                    .boot_url(extract_ll_address_or_id(&client_id), arch_type)
                    .await?;
                Ok(Some(self.information_request_reply(
                    incoming.transaction_id,
                    server_duid,
                    &client_id,
                    arch_type,
                    &boot_file_url,
                    configuration,
                )))
            }
            MessageType::Release => {
                addresses.release_addresses(&client_id, &incoming.options.ia_na_ids());
                Ok(Some(self.release_reply(
                    incoming.transaction_id,
                    server_duid,
                    &client_id,
                )))
            }
            _ => Ok(None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn advertise(
        &self,
        transaction_id: [u8; 3],
        server_duid: &[u8],
        client_id: &[u8],
        arch_type: u16,
        associations: &[IdentityAssociation],
        boot_file_url: &[u8],
        configuration: &dyn BootConfiguration,
    ) -> Packet {
        let mut opts = Options::new();
        opts.add(Dhcp6Option::new(OPT_CLIENT_ID, client_id.to_vec()));
        for association in associations {
            opts.add(options::make_ia_na(
                &association.interface_id,
                self.t1(),
                self.t2(),
                &options::make_ia_addr(
                    association.ip_address,
                    self.preferred_lifetime,
                    self.valid_lifetime,
                ),
            ));
        }
        opts.add(Dhcp6Option::new(OPT_SERVER_ID, server_duid.to_vec()));
        if arch_type == ARCH_HTTP_CLIENT {
            opts.add(options::make_http_client_vendor_class());
        }
        opts.add(Dhcp6Option::new(
            options::OPT_BOOTFILE_URL,
            boot_file_url.to_vec(),
        ));
        if let Some(preference) = configuration.preference() {
            opts.add(Dhcp6Option::new(options::OPT_PREFERENCE, vec![preference]));
        }
        let dns = configuration.recursive_dns();
        if !dns.is_empty() {
            opts.add(options::make_dns_servers(dns));
        }
        Packet::new(MessageType::Advertise, transaction_id, opts)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn reply(
        &self,
        transaction_id: [u8; 3],
        server_duid: &[u8],
        client_id: &[u8],
        arch_type: u16,
        reservation: &Reservation,
        requested_iaids: &[Vec<u8>],
        boot_file_url: &[u8],
        configuration: &dyn BootConfiguration,
    ) -> Packet {
        let mut opts = Options::new();
        opts.add(Dhcp6Option::new(OPT_CLIENT_ID, client_id.to_vec()));
        for association in &reservation.associations {
            opts.add(options::make_ia_na(
                &association.interface_id,
                self.t1(),
                self.t2(),
                &options::make_ia_addr(
                    association.ip_address,
                    self.preferred_lifetime,
                    self.valid_lifetime,
                ),
            ));
        }
        let failure_message = reservation
            .failure
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        for iaid in iaids_without_addresses(&reservation.associations, requested_iaids) {
            opts.add(options::make_ia_na(
                &iaid,
                self.t1(),
                self.t2(),
                &options::make_status(STATUS_NO_ADDRS_AVAILABLE, &failure_message),
            ));
        }
        opts.add(Dhcp6Option::new(OPT_SERVER_ID, server_duid.to_vec()));
        if arch_type == ARCH_HTTP_CLIENT {
            opts.add(options::make_http_client_vendor_class());
        }
        opts.add(Dhcp6Option::new(
            options::OPT_BOOTFILE_URL,
            boot_file_url.to_vec(),
        ));
        let dns = configuration.recursive_dns();
        if !dns.is_empty() {
            opts.add(options::make_dns_servers(dns));
        }
        Packet::new(MessageType::Reply, transaction_id, opts)
    }

    pub(crate) fn information_request_reply(
        &self,
        transaction_id: [u8; 3],
        server_duid: &[u8],
        client_id: &[u8],
        arch_type: u16,
        boot_file_url: &[u8],
        configuration: &dyn BootConfiguration,
    ) -> Packet {
        let mut opts = Options::new();
        opts.add(Dhcp6Option::new(OPT_CLIENT_ID, client_id.to_vec()));
        opts.add(Dhcp6Option::new(OPT_SERVER_ID, server_duid.to_vec()));
        if arch_type == ARCH_HTTP_CLIENT {
            opts.add(options::make_http_client_vendor_class());
        }
        opts.add(Dhcp6Option::new(
            options::OPT_BOOTFILE_URL,
            boot_file_url.to_vec(),
        ));
        let dns = configuration.recursive_dns();
        if !dns.is_empty() {
            opts.add(options::make_dns_servers(dns));
        }
        Packet::new(MessageType::Reply, transaction_id, opts)
    }

    pub(crate) fn release_reply(
        &self,
        transaction_id: [u8; 3],
        server_duid: &[u8],
        client_id: &[u8],
    ) -> Packet {
        let mut opts = Options::new();
        opts.add(Dhcp6Option::new(OPT_CLIENT_ID, client_id.to_vec()));
        opts.add(Dhcp6Option::new(OPT_SERVER_ID, server_duid.to_vec()));
        opts.add(options::make_status(0, "Release received."));
        Packet::new(MessageType::Reply, transaction_id, opts)
    }

    pub(crate) fn advertise_no_addrs_available(
        &self,
        transaction_id: [u8; 3],
        server_duid: &[u8],
        client_id: &[u8],
        message: &str,
    ) -> Packet {
        let mut opts = Options::new();
        opts.add(Dhcp6Option::new(OPT_CLIENT_ID, client_id.to_vec()));
        opts.add(Dhcp6Option::new(OPT_SERVER_ID, server_duid.to_vec()));
        opts.add(options::make_status(STATUS_NO_ADDRS_AVAILABLE, message));
        Packet::new(MessageType::Advertise, transaction_id, opts)
    }

    fn t1(&self) -> u32 {
        self.preferred_lifetime / 2
    }

    fn t2(&self) -> u32 {
        (self.preferred_lifetime * 4) / 5
    }
}

/// Strips the DUID framing off a client id, leaving the link-layer address
/// (or the raw identifier for DUID types without one).
fn extract_ll_address_or_id(client_id: &[u8]) -> &[u8] {
    if client_id.len() < 2 {
        return client_id;
    }
    match u16::from_be_bytes([client_id[0], client_id[1]]) {
        1 if client_id.len() >= 8 => &client_id[8..],
        3 if client_id.len() >= 4 => &client_id[4..],
        _ => &client_id[2..],
    }
}

/// The requested IAIDs that did not receive an address.
fn iaids_without_addresses(
    granted: &[IdentityAssociation],
    requested: &[Vec<u8>],
) -> Vec<Vec<u8>> {
    requested
        .iter()
        .filter(|iaid| !granted.iter().any(|ia| &ia.interface_id == *iaid))
        .cloned()
        .collect()
}
