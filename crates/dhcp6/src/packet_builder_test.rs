//! Unit tests for DHCPv6 reply synthesis.

use std::net::Ipv6Addr;

use async_trait::async_trait;
use chrono::Utc;

use crate::boot_configuration::{BootConfiguration, BootConfigurationError};
use crate::options::{
    self, OPT_BOOTFILE_URL, OPT_PREFERENCE, OPT_RECURSIVE_DNS, OPT_STATUS_CODE, OPT_VENDOR_CLASS,
};
use crate::packet::MessageType;
use crate::packet_builder::PacketBuilder;
use crate::pool::{IdentityAssociation, PoolError, Reservation};

struct FixedBootConfiguration {
    url: Vec<u8>,
    preference: Option<u8>,
    dns: Vec<Ipv6Addr>,
}

impl FixedBootConfiguration {
    fn new() -> Self {
        FixedBootConfiguration {
            url: b"http://bootfileurl".to_vec(),
            preference: None,
            dns: Vec::new(),
        }
    }
}

#[async_trait]
impl BootConfiguration for FixedBootConfiguration {
    async fn boot_url(
        &self,
        _client_id: &[u8],
        _client_arch_type: u16,
    ) -> Result<Vec<u8>, BootConfigurationError> {
        Ok(self.url.clone())
    }

    fn preference(&self) -> Option<u8> {
        self.preference
    }

    fn recursive_dns(&self) -> &[Ipv6Addr] {
        &self.dns
    }
}

fn association(interface_id: &[u8]) -> IdentityAssociation {
    IdentityAssociation {
        ip_address: "2001:db8:f00f:cafe::1".parse().unwrap(),
        client_id: b"clientid".to_vec(),
        interface_id: interface_id.to_vec(),
        created_at: Utc::now(),
    }
}

#[test]
fn advertise_carries_identity_and_boot_url() {
    let builder = PacketBuilder::new(90, 100);
    let mut config = FixedBootConfiguration::new();
    config.dns = vec!["2001:db8:f00f:cafe::99".parse().unwrap()];

    let msg = builder.advertise(
        *b"123",
        b"serverid",
        b"clientid",
        0x11,
        &[association(b"id-1")],
        b"http://bootfileurl",
        &config,
    );

    assert_eq!(msg.msg_type, MessageType::Advertise);
    assert_eq!(msg.transaction_id, *b"123");
    assert_eq!(msg.options.client_id(), Some(&b"clientid"[..]));
    assert_eq!(msg.options.server_id(), Some(&b"serverid"[..]));
    assert_eq!(msg.options.boot_file_url(), Some(&b"http://bootfileurl"[..]));
    assert_eq!(msg.options.ia_na_ids(), vec![b"id-1".to_vec()]);
    assert!(!msg.options.has(OPT_PREFERENCE));

    let dns = msg.options.first(OPT_RECURSIVE_DNS).unwrap();
    assert_eq!(
        dns.value,
        "2001:db8:f00f:cafe::99".parse::<Ipv6Addr>().unwrap().octets()
    );
}

#[test]
fn advertise_skips_dns_when_none_configured() {
    let builder = PacketBuilder::new(90, 100);
    let config = FixedBootConfiguration::new();

    let msg = builder.advertise(
        *b"123",
        b"serverid",
        b"clientid",
        0x11,
        &[association(b"id-1")],
        b"http://bootfileurl",
        &config,
    );
    assert!(!msg.options.has(OPT_RECURSIVE_DNS));
}

#[test]
fn advertise_sets_preference_when_configured() {
    let builder = PacketBuilder::new(90, 100);
    let mut config = FixedBootConfiguration::new();
    config.preference = Some(128);

    let msg = builder.advertise(
        *b"tid",
        b"serverid",
        b"clientid",
        0x11,
        &[association(b"id-1")],
        b"http://bootfileurl",
        &config,
    );
    assert_eq!(msg.options.first(OPT_PREFERENCE).unwrap().value, vec![128]);
}

#[test]
fn http_clients_get_the_vendor_class() {
    let builder = PacketBuilder::new(90, 100);
    let config = FixedBootConfiguration::new();

    let msg = builder.advertise(
        *b"123",
        b"serverid",
        b"clientid",
        0x10,
        &[association(b"id-1")],
        b"http://bootfileurl",
        &config,
    );

    let vendor = msg.options.first(OPT_VENDOR_CLASS).unwrap();
    assert_eq!(vendor.value.len(), 16);
    assert!(msg.options.has(OPT_BOOTFILE_URL));
}

#[test]
fn no_addrs_advertise_carries_status_two() {
    let builder = PacketBuilder::new(90, 100);
    let msg =
        builder.advertise_no_addrs_available(*b"123", b"serverid", b"clientid", "Boom!");

    assert_eq!(msg.msg_type, MessageType::Advertise);
    assert_eq!(msg.options.client_id(), Some(&b"clientid"[..]));
    assert_eq!(msg.options.server_id(), Some(&b"serverid"[..]));

    let status = msg.options.first(OPT_STATUS_CODE).unwrap();
    assert_eq!(u16::from_be_bytes([status.value[0], status.value[1]]), 2);
    assert_eq!(&status.value[2..], b"Boom!");
}

#[test]
fn reply_mixes_granted_and_failed_associations() {
    let builder = PacketBuilder::new(90, 100);
    let config = FixedBootConfiguration::new();
    let reservation = Reservation {
        associations: vec![association(b"ok-1")],
        failure: Some(PoolError::NoAddressesAvailable),
    };

    let msg = builder.reply(
        *b"123",
        b"serverid",
        b"clientid",
        0x11,
        &reservation,
        &[b"ok-1".to_vec(), b"no-2".to_vec()],
        b"http://bootfileurl",
        &config,
    );

    assert_eq!(msg.msg_type, MessageType::Reply);
    let ia_nas: Vec<_> = msg.options.all(options::OPT_IA_NA).collect();
    assert_eq!(ia_nas.len(), 2);
    assert_eq!(&ia_nas[0].value[0..4], b"ok-1");
    assert_eq!(&ia_nas[1].value[0..4], b"no-2");
    // The failed IA_NA nests a status code option instead of an address.
    let nested = crate::options::Options::unmarshal(&ia_nas[1].value[12..]).unwrap();
    let status = nested.first(OPT_STATUS_CODE).unwrap();
    assert_eq!(u16::from_be_bytes([status.value[0], status.value[1]]), 2);
}

#[test]
fn release_reply_acknowledges() {
    let builder = PacketBuilder::new(90, 100);
    let msg = builder.release_reply(*b"rid", b"serverid", b"clientid");

    assert_eq!(msg.msg_type, MessageType::Reply);
    let status = msg.options.first(OPT_STATUS_CODE).unwrap();
    assert_eq!(u16::from_be_bytes([status.value[0], status.value[1]]), 0);
    assert_eq!(&status.value[2..], b"Release received.");
}

#[test]
fn t1_t2_derive_from_preferred_lifetime() {
    let builder = PacketBuilder::new(90, 100);
    let config = FixedBootConfiguration::new();
    let msg = builder.advertise(
        *b"123",
        b"serverid",
        b"clientid",
        0x11,
        &[association(b"id-1")],
        b"url",
        &config,
    );
    let ia_na = msg.options.first(options::OPT_IA_NA).unwrap();
    let t1 = u32::from_be_bytes(ia_na.value[4..8].try_into().unwrap());
    let t2 = u32::from_be_bytes(ia_na.value[8..12].try_into().unwrap());
    assert_eq!(t1, 45);
    assert_eq!(t2, 72);
}
