//! DHCPv6 options: wire format, lookup helpers and constructors.

use std::collections::HashSet;
use std::net::Ipv6Addr;

use crate::packet::PacketError;

pub const OPT_CLIENT_ID: u16 = 1;
pub const OPT_SERVER_ID: u16 = 2;
pub const OPT_IA_NA: u16 = 3;
pub const OPT_IA_TA: u16 = 4;
pub const OPT_IA_ADDR: u16 = 5;
pub const OPT_ORO: u16 = 6;
pub const OPT_PREFERENCE: u16 = 7;
pub const OPT_STATUS_CODE: u16 = 13;
pub const OPT_VENDOR_CLASS: u16 = 16;
pub const OPT_RECURSIVE_DNS: u16 = 23;
pub const OPT_BOOTFILE_URL: u16 = 59;
pub const OPT_CLIENT_ARCH_TYPE: u16 = 61;

/// Status code carried when the pool cannot grant an address.
pub const STATUS_NO_ADDRS_AVAILABLE: u16 = 2;

/// A single DHCPv6 option. The wire length is derived from the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dhcp6Option {
    pub code: u16,
    pub value: Vec<u8>,
}

impl Dhcp6Option {
    pub fn new(code: u16, value: Vec<u8>) -> Self {
        Dhcp6Option { code, value }
    }

    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.code.to_be_bytes());
        out.extend_from_slice(&(self.value.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.value);
    }
}

/// The option list of a packet, in wire order.
///
/// Order is preserved through a marshal/unmarshal round trip; lookups scan
/// the list, which is tiny for boot traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(Vec<Dhcp6Option>);

impl Options {
    pub fn new() -> Self {
        Options(Vec::new())
    }

    pub fn add(&mut self, option: Dhcp6Option) {
        self.0.push(option);
    }

    pub fn first(&self, code: u16) -> Option<&Dhcp6Option> {
        self.0.iter().find(|o| o.code == code)
    }

    pub fn all(&self, code: u16) -> impl Iterator<Item = &Dhcp6Option> {
        self.0.iter().filter(move |o| o.code == code)
    }

    pub fn has(&self, code: u16) -> bool {
        self.first(code).is_some()
    }

    pub fn unmarshal(mut bs: &[u8]) -> Result<Options, PacketError> {
        let mut ret = Options::new();
        while !bs.is_empty() {
            if bs.len() < 4 {
                return Err(PacketError::OptionTruncated);
            }
            let code = u16::from_be_bytes([bs[0], bs[1]]);
            let len = u16::from_be_bytes([bs[2], bs[3]]) as usize;
            if bs.len() < 4 + len {
                return Err(PacketError::OptionLength {
                    code,
                    claimed: len,
                    available: bs.len() - 4,
                });
            }
            let value = bs[4..4 + len].to_vec();
            match code {
                OPT_ORO if len % 2 != 0 => {
                    return Err(PacketError::OddOptionRequestLength(len));
                }
                OPT_IA_NA if len < 12 => {
                    return Err(PacketError::IaNaTooShort(len));
                }
                _ => {}
            }
            ret.add(Dhcp6Option::new(code, value));
            bs = &bs[4 + len..];
        }
        Ok(ret)
    }

    pub fn marshal(&self, out: &mut Vec<u8>) {
        for option in &self.0 {
            option.marshal(out);
        }
    }

    /// The option codes listed in the Option Request option.
    pub fn requested_options(&self) -> HashSet<u16> {
        let mut ret = HashSet::new();
        if let Some(oro) = self.first(OPT_ORO) {
            for pair in oro.value.chunks_exact(2) {
                ret.insert(u16::from_be_bytes([pair[0], pair[1]]));
            }
        }
        ret
    }

    /// True when the client asked for a Boot File URL.
    pub fn requests_boot_file_url(&self) -> bool {
        self.requested_options().contains(&OPT_BOOTFILE_URL)
    }

    pub fn client_id(&self) -> Option<&[u8]> {
        self.first(OPT_CLIENT_ID).map(|o| o.value.as_slice())
    }

    pub fn server_id(&self) -> Option<&[u8]> {
        self.first(OPT_SERVER_ID).map(|o| o.value.as_slice())
    }

    pub fn has_ia_na(&self) -> bool {
        self.has(OPT_IA_NA)
    }

    pub fn has_ia_ta(&self) -> bool {
        self.has(OPT_IA_TA)
    }

    /// IAIDs of every IA_NA option. Unmarshal guarantees a 12-byte minimum
    /// body, so the 4-byte IAID is always present.
    pub fn ia_na_ids(&self) -> Vec<Vec<u8>> {
        self.all(OPT_IA_NA).map(|o| o.value[0..4].to_vec()).collect()
    }

    /// The client architecture type (RFC 5970), or 0 when absent.
    pub fn client_arch_type(&self) -> u16 {
        match self.first(OPT_CLIENT_ARCH_TYPE) {
            Some(o) if o.value.len() >= 2 => u16::from_be_bytes([o.value[0], o.value[1]]),
            _ => 0,
        }
    }

    pub fn boot_file_url(&self) -> Option<&[u8]> {
        self.first(OPT_BOOTFILE_URL).map(|o| o.value.as_slice())
    }
}

/// Builds an IA_NA option wrapping one IA Address or Status option.
pub fn make_ia_na(iaid: &[u8], t1: u32, t2: u32, inner: &Dhcp6Option) -> Dhcp6Option {
    let mut value = Vec::with_capacity(12 + 4 + inner.value.len());
    value.extend_from_slice(&iaid[0..4]);
    value.extend_from_slice(&t1.to_be_bytes());
    value.extend_from_slice(&t2.to_be_bytes());
    inner.marshal(&mut value);
    Dhcp6Option::new(OPT_IA_NA, value)
}

/// Builds an IA Address option with the given lifetimes.
pub fn make_ia_addr(addr: Ipv6Addr, preferred_lifetime: u32, valid_lifetime: u32) -> Dhcp6Option {
    let mut value = Vec::with_capacity(24);
    value.extend_from_slice(&addr.octets());
    value.extend_from_slice(&preferred_lifetime.to_be_bytes());
    value.extend_from_slice(&valid_lifetime.to_be_bytes());
    Dhcp6Option::new(OPT_IA_ADDR, value)
}

/// Builds a Status Code option.
pub fn make_status(code: u16, message: &str) -> Dhcp6Option {
    let mut value = Vec::with_capacity(2 + message.len());
    value.extend_from_slice(&code.to_be_bytes());
    value.extend_from_slice(message.as_bytes());
    Dhcp6Option::new(OPT_STATUS_CODE, value)
}

/// Builds a Recursive DNS servers option.
pub fn make_dns_servers(addresses: &[Ipv6Addr]) -> Dhcp6Option {
    let mut value = Vec::with_capacity(16 * addresses.len());
    for addr in addresses {
        value.extend_from_slice(&addr.octets());
    }
    Dhcp6Option::new(OPT_RECURSIVE_DNS, value)
}

/// The fixed Vendor Class option UEFI HTTPBoot clients expect to see
/// echoed: zero enterprise number, then the 10-byte class "HTTPClient".
pub fn make_http_client_vendor_class() -> Dhcp6Option {
    let mut value = Vec::with_capacity(16);
    value.extend_from_slice(&[0, 0, 0, 0]);
    value.extend_from_slice(&10u16.to_be_bytes());
    value.extend_from_slice(b"HTTPClient");
    Dhcp6Option::new(OPT_VENDOR_CLASS, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_order() {
        let mut opts = Options::new();
        opts.add(Dhcp6Option::new(OPT_CLIENT_ID, b"client".to_vec()));
        opts.add(Dhcp6Option::new(OPT_SERVER_ID, b"server".to_vec()));
        opts.add(Dhcp6Option::new(OPT_ORO, vec![0, 59]));

        let mut raw = Vec::new();
        opts.marshal(&mut raw);
        assert_eq!(Options::unmarshal(&raw).unwrap(), opts);
    }

    #[test]
    fn odd_option_request_length_rejected() {
        let mut raw = Vec::new();
        Dhcp6Option::new(OPT_ORO, vec![0, 59, 0]).marshal(&mut raw);
        assert!(matches!(
            Options::unmarshal(&raw),
            Err(PacketError::OddOptionRequestLength(3))
        ));
    }

    #[test]
    fn overlong_option_rejected() {
        let raw = [0, 1, 0, 10, 0xab];
        assert!(matches!(
            Options::unmarshal(&raw),
            Err(PacketError::OptionLength { code: 1, .. })
        ));
    }

    #[test]
    fn unknown_options_pass_through() {
        let mut raw = Vec::new();
        Dhcp6Option::new(4242, vec![1, 2, 3]).marshal(&mut raw);
        let opts = Options::unmarshal(&raw).unwrap();
        assert_eq!(opts.first(4242).unwrap().value, vec![1, 2, 3]);
    }

    #[test]
    fn requested_options_parse() {
        let mut opts = Options::new();
        opts.add(Dhcp6Option::new(OPT_ORO, vec![0, 59, 0, 23]));
        assert!(opts.requests_boot_file_url());
        assert!(opts.requested_options().contains(&OPT_RECURSIVE_DNS));
        assert!(!opts.requested_options().contains(&OPT_PREFERENCE));
    }

    #[test]
    fn ia_na_ids_extracts_each_iaid() {
        let mut opts = Options::new();
        let inner = make_ia_addr("2001:db8::1".parse().unwrap(), 90, 100);
        opts.add(make_ia_na(b"aaaa", 1, 2, &inner));
        opts.add(make_ia_na(b"bbbb", 1, 2, &inner));
        assert_eq!(opts.ia_na_ids(), vec![b"aaaa".to_vec(), b"bbbb".to_vec()]);
    }

    #[test]
    fn http_client_vendor_class_is_sixteen_bytes() {
        let opt = make_http_client_vendor_class();
        assert_eq!(opt.value.len(), 16);
        assert_eq!(&opt.value[6..], b"HTTPClient");
    }
}
