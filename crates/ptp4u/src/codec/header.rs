//! The 34-byte PTPv2 header (IEEE 1588-2019 §13.3).

use zerocopy::byteorder::big_endian::{I64, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::identity::{PortIdentity, WirePortIdentity};

/// A tiny `bitflags`-shaped macro, kept local so this crate does not pull in
/// the `bitflags` crate for a handful of constant bits (mirrors the
/// teacher's `NLM_F_*`/`IFLA_*` plain-`const` convention rather than a
/// bitflags dependency).
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub $ty);

        impl $name {
            $(pub const $variant: $ty = $value;)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn contains(self, bit: $ty) -> bool {
                self.0 & bit != 0
            }

            pub const fn set(mut self, bit: $ty) -> Self {
                self.0 |= bit;
                self
            }
        }
    };
}

/// Message type tag: low nibble of the header's first byte, and the map key
/// the server uses to look up per-client subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0x0,
    DelayReq = 0x1,
    FollowUp = 0x8,
    DelayResp = 0x9,
    Announce = 0xB,
    Signaling = 0xC,
}

impl MessageType {
    /// Parse from the low 4 bits of the header's first byte.
    pub fn from_nibble(b: u8) -> Result<Self> {
        match b & 0x0F {
            0x0 => Ok(Self::Sync),
            0x1 => Ok(Self::DelayReq),
            0x8 => Ok(Self::FollowUp),
            0x9 => Ok(Self::DelayResp),
            0xB => Ok(Self::Announce),
            0xC => Ok(Self::Signaling),
            other => Err(Error::UnknownMessageType(other)),
        }
    }

    fn control_field(self) -> u8 {
        match self {
            Self::Sync => 0,
            Self::DelayReq => 1,
            Self::FollowUp => 2,
            Self::DelayResp => 3,
            Self::Announce => 5,
            Self::Signaling => 5,
        }
    }
}

/// Peek the message type without copying the buffer.
pub fn decode_message_type(bytes: &[u8]) -> Result<MessageType> {
    if bytes.is_empty() {
        return Err(Error::Truncated {
            expected: 1,
            actual: 0,
        });
    }
    MessageType::from_nibble(bytes[0])
}

bitflags_lite! {
    /// `flagField` bits used by this server (IEEE 1588 Table 37).
    pub struct Flags: u16 {
        const ALTERNATE_MASTER = 1 << 0;
        const TWO_STEP = 1 << 1;
        const UNICAST = 1 << 2;
        const PTP_TIMESCALE = 1 << 9;
        const TIME_TRACEABLE = 1 << 10;
        const FREQUENCY_TRACEABLE = 1 << 11;
    }
}

/// On-wire 34-byte header, big-endian, fixed layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct WireHeader {
    sdo_id_and_type: u8,
    version: u8,
    message_length: U16,
    domain_number: u8,
    minor_sdo_id: u8,
    flags: U16,
    correction_field: I64,
    reserved: zerocopy::byteorder::big_endian::U32,
    source_port_identity: WirePortIdentity,
    sequence_id: U16,
    control_field: u8,
    log_message_interval: i8,
}

impl WireHeader {
    pub const SIZE: usize = 34;
    pub const VERSION: u8 = 2;

    pub fn as_bytes_checked(&self) -> &[u8] {
        IntoBytes::as_bytes(self)
    }

    pub fn from_prefix(data: &[u8]) -> Result<(&Self, &[u8])> {
        Self::ref_from_prefix(data).map_err(|_| Error::Truncated {
            expected: Self::SIZE,
            actual: data.len(),
        })
    }
}

/// Ergonomic, owned representation of a PTP header used by packet templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtpHeader {
    pub transport_specific: u8,
    pub message_type: MessageType,
    pub domain_number: u8,
    pub flags: u16,
    pub correction_field: i64,
    pub source_port_identity: PortIdentity,
    pub sequence_id: u16,
    pub log_message_interval: i8,
}

impl PtpHeader {
    /// Build a header with this server's customary defaults for `message_type`.
    pub fn new(message_type: MessageType, source: PortIdentity, domain_number: u8) -> Self {
        Self {
            transport_specific: 0,
            message_type,
            domain_number,
            flags: 0,
            correction_field: 0,
            source_port_identity: source,
            sequence_id: 0,
            log_message_interval: 0,
        }
    }

    /// Encode into `buf`, given the already-known total body length, returning the
    /// number of header bytes written (always [`WireHeader::SIZE`]). Allocation-free.
    pub fn encode(&self, body_len: usize, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < WireHeader::SIZE {
            return Err(Error::Truncated {
                expected: WireHeader::SIZE,
                actual: buf.len(),
            });
        }
        let wire = WireHeader {
            sdo_id_and_type: (self.transport_specific << 4) | (self.message_type as u8 & 0x0F),
            version: WireHeader::VERSION & 0x0F,
            message_length: ((WireHeader::SIZE + body_len) as u16).into(),
            domain_number: self.domain_number,
            minor_sdo_id: 0,
            flags: self.flags.into(),
            correction_field: self.correction_field.into(),
            reserved: 0u32.into(),
            source_port_identity: WirePortIdentity::from_identity(self.source_port_identity),
            sequence_id: self.sequence_id.into(),
            control_field: self.message_type.control_field(),
            log_message_interval: self.log_message_interval,
        };
        buf[..WireHeader::SIZE].copy_from_slice(wire.as_bytes_checked());
        Ok(WireHeader::SIZE)
    }

    /// Decode from the front of `data`, returning the header and the remaining body bytes.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8])> {
        let (wire, rest) = WireHeader::from_prefix(data)?;
        let message_type = MessageType::from_nibble(wire.sdo_id_and_type)?;
        let header = PtpHeader {
            transport_specific: wire.sdo_id_and_type >> 4,
            message_type,
            domain_number: wire.domain_number,
            flags: wire.flags.get(),
            correction_field: wire.correction_field.get(),
            source_port_identity: wire.source_port_identity.to_identity(),
            sequence_id: wire.sequence_id.get(),
            log_message_interval: wire.log_message_interval,
        };
        let declared_len = wire.message_length.get() as usize;
        let body = if declared_len >= WireHeader::SIZE && declared_len <= data.len() {
            &rest[..declared_len - WireHeader::SIZE]
        } else {
            rest
        };
        Ok((header, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let source = PortIdentity::new(crate::identity::ClockIdentity(0x1122334455667788), 1);
        let mut header = PtpHeader::new(MessageType::Sync, source, 0);
        header.flags = Flags::empty().set(Flags::UNICAST).set(Flags::TWO_STEP).0;
        header.sequence_id = 42;
        header.correction_field = -123;

        let mut buf = [0u8; 64];
        let n = header.encode(10, &mut buf).unwrap();
        assert_eq!(n, WireHeader::SIZE);

        let (decoded, body) = PtpHeader::decode(&buf[..34 + 10]).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body.len(), 10);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let err = PtpHeader::decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut bytes = [0u8; 34];
        bytes[0] = 0x0F; // not a recognized low nibble
        let err = PtpHeader::decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::UnknownMessageType(0x0F)));
    }
}
