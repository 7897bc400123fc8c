//! DHCPv6 packet structure, (un)marshalling and inbound validation.

use thiserror::Error;

use crate::options::Options;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short to be DHCPv6")]
    Truncated,
    #[error("option header truncated")]
    OptionTruncated,
    #[error("option {code} claims {claimed} bytes of payload, but only {available} are present")]
    OptionLength {
        code: u16,
        claimed: usize,
        available: usize,
    },
    #[error("option request payload length must be even, got {0}")]
    OddOptionRequestLength(usize),
    #[error("identity association option has only {0} bytes of payload")]
    IaNaTooShort(usize),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
}

/// Why an inbound packet was dropped without a reply.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscardReason {
    #[error("{0:?} does not request a boot file URL")]
    NoBootFileUrlRequest(MessageType),
    #[error("{0:?} carries no client ID")]
    NoClientId(MessageType),
    #[error("solicit carries a server ID")]
    SolicitWithServerId,
    #[error("{0:?} carries no server ID")]
    NoServerId(MessageType),
    #[error("{0:?} is addressed to another server")]
    ForeignServerId(MessageType),
    #[error("information-request carries an identity association")]
    InformationRequestWithIa,
    #[error("no reply defined for {0:?}")]
    UnhandledMessageType(MessageType),
}

/// DHCPv6 message types, RFC 3315 §5.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
    Decline = 9,
    Reconfigure = 10,
    InformationRequest = 11,
    RelayForw = 12,
    RelayRepl = 13,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Result<Self, PacketError> {
        Ok(match v {
            1 => MessageType::Solicit,
            2 => MessageType::Advertise,
            3 => MessageType::Request,
            4 => MessageType::Confirm,
            5 => MessageType::Renew,
            6 => MessageType::Rebind,
            7 => MessageType::Reply,
            8 => MessageType::Release,
            9 => MessageType::Decline,
            10 => MessageType::Reconfigure,
            11 => MessageType::InformationRequest,
            12 => MessageType::RelayForw,
            13 => MessageType::RelayRepl,
            other => return Err(PacketError::UnknownMessageType(other)),
        })
    }
}

/// A DHCPv6 packet: message type, 3-byte transaction id, options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub msg_type: MessageType,
    pub transaction_id: [u8; 3],
    pub options: Options,
}

impl Packet {
    pub fn new(msg_type: MessageType, transaction_id: [u8; 3], options: Options) -> Self {
        Packet {
            msg_type,
            transaction_id,
            options,
        }
    }

    pub fn unmarshal(bs: &[u8]) -> Result<Packet, PacketError> {
        if bs.len() < 4 {
            return Err(PacketError::Truncated);
        }
        let msg_type = MessageType::from_u8(bs[0])?;
        let mut transaction_id = [0u8; 3];
        transaction_id.copy_from_slice(&bs[1..4]);
        Ok(Packet {
            msg_type,
            transaction_id,
            options: Options::unmarshal(&bs[4..])?,
        })
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.push(self.msg_type as u8);
        out.extend_from_slice(&self.transaction_id);
        self.options.marshal(&mut out);
        out
    }

    /// Validates an inbound packet against the preconditions its message
    /// type must satisfy before a reply may be built. Failures are drop
    /// reasons, not errors: no reply is ever sent for them.
    pub fn should_discard(&self, server_duid: &[u8]) -> Result<(), DiscardReason> {
        match self.msg_type {
            MessageType::Solicit => self.check_solicit(),
            MessageType::Request => self.check_request(server_duid),
            MessageType::InformationRequest => self.check_information_request(server_duid),
            MessageType::Release => Ok(()),
            other => Err(DiscardReason::UnhandledMessageType(other)),
        }
    }

    fn check_solicit(&self) -> Result<(), DiscardReason> {
        if !self.options.requests_boot_file_url() {
            return Err(DiscardReason::NoBootFileUrlRequest(self.msg_type));
        }
        if self.options.client_id().is_none() {
            return Err(DiscardReason::NoClientId(self.msg_type));
        }
        if self.options.server_id().is_some() {
            return Err(DiscardReason::SolicitWithServerId);
        }
        Ok(())
    }

    fn check_request(&self, server_duid: &[u8]) -> Result<(), DiscardReason> {
        if !self.options.requests_boot_file_url() {
            return Err(DiscardReason::NoBootFileUrlRequest(self.msg_type));
        }
        if self.options.client_id().is_none() {
            return Err(DiscardReason::NoClientId(self.msg_type));
        }
        match self.options.server_id() {
            None => Err(DiscardReason::NoServerId(self.msg_type)),
            Some(id) if id != server_duid => Err(DiscardReason::ForeignServerId(self.msg_type)),
            Some(_) => Ok(()),
        }
    }

    fn check_information_request(&self, server_duid: &[u8]) -> Result<(), DiscardReason> {
        if !self.options.requests_boot_file_url() {
            return Err(DiscardReason::NoBootFileUrlRequest(self.msg_type));
        }
        if self.options.has_ia_na() || self.options.has_ia_ta() {
            return Err(DiscardReason::InformationRequestWithIa);
        }
        if let Some(id) = self.options.server_id() {
            if id != server_duid {
                return Err(DiscardReason::ForeignServerId(self.msg_type));
            }
        }
        Ok(())
    }
}
