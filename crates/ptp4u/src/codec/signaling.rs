//! SIGNALING message body and its unicast-negotiation TLVs
//! (IEEE 1588-2019 §16.1, Table 98 TLV type values).
//!
//! TLVs are walked with `winnow`, the same "consume until the declared
//! length is exhausted" shape the teacher's `netlink::messages::link` module
//! uses to walk nested `IFLA_*` attributes.

use winnow::binary::{be_i8, be_u16, be_u32, be_u8};
use winnow::error::{ContextError, ErrMode};
use winnow::token::take;
use winnow::Parser;

use zerocopy::FromBytes;

use crate::error::{Error, Result};
use crate::identity::{PortIdentity, WirePortIdentity};

const TLV_REQUEST_UNICAST_TRANSMISSION: u16 = 0x0004;
const TLV_GRANT_UNICAST_TRANSMISSION: u16 = 0x0005;
const TLV_CANCEL_UNICAST_TRANSMISSION: u16 = 0x0006;
const TLV_ACKNOWLEDGE_CANCEL_UNICAST_TRANSMISSION: u16 = 0x0007;

/// One SIGNALING TLV, decoded to its specific shape where known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tlv {
    RequestUnicastTransmission {
        message_type: u8,
        log_inter_message_period: i8,
        duration_field: u32,
    },
    GrantUnicastTransmission {
        message_type: u8,
        log_inter_message_period: i8,
        duration_field: u32,
        renewal: bool,
    },
    CancelUnicastTransmission {
        message_type: u8,
    },
    AcknowledgeCancelUnicastTransmission {
        message_type: u8,
    },
    /// Any TLV type this server doesn't interpret; carried opaquely so it
    /// can be re-encoded unchanged if ever echoed (it currently isn't).
    Unknown { tlv_type: u16, value: Vec<u8> },
}

impl Tlv {
    fn tlv_type(&self) -> u16 {
        match self {
            Self::RequestUnicastTransmission { .. } => TLV_REQUEST_UNICAST_TRANSMISSION,
            Self::GrantUnicastTransmission { .. } => TLV_GRANT_UNICAST_TRANSMISSION,
            Self::CancelUnicastTransmission { .. } => TLV_CANCEL_UNICAST_TRANSMISSION,
            Self::AcknowledgeCancelUnicastTransmission { .. } => {
                TLV_ACKNOWLEDGE_CANCEL_UNICAST_TRANSMISSION
            }
            Self::Unknown { tlv_type, .. } => *tlv_type,
        }
    }

    /// Encoded `value` length for this TLV (excludes the 4-byte type+length header).
    fn value_len(&self) -> usize {
        match self {
            Self::RequestUnicastTransmission { .. } => 6,
            Self::GrantUnicastTransmission { .. } => 8,
            Self::CancelUnicastTransmission { .. } => 2,
            Self::AcknowledgeCancelUnicastTransmission { .. } => 2,
            Self::Unknown { value, .. } => value.len(),
        }
    }

    /// Total encoded length, including the type+length header.
    pub fn encoded_len(&self) -> usize {
        4 + self.value_len()
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let total = self.encoded_len();
        if buf.len() < total {
            return Err(Error::Truncated {
                expected: total,
                actual: buf.len(),
            });
        }
        buf[0..2].copy_from_slice(&self.tlv_type().to_be_bytes());
        buf[2..4].copy_from_slice(&(self.value_len() as u16).to_be_bytes());
        let value = &mut buf[4..total];
        match self {
            Self::RequestUnicastTransmission {
                message_type,
                log_inter_message_period,
                duration_field,
            } => {
                value[0] = message_type << 4;
                value[1] = *log_inter_message_period as u8;
                value[2..6].copy_from_slice(&duration_field.to_be_bytes());
            }
            Self::GrantUnicastTransmission {
                message_type,
                log_inter_message_period,
                duration_field,
                renewal,
            } => {
                value[0] = message_type << 4;
                value[1] = *log_inter_message_period as u8;
                value[2..6].copy_from_slice(&duration_field.to_be_bytes());
                value[6] = if *renewal { 1 } else { 0 };
                value[7] = 0;
            }
            Self::CancelUnicastTransmission { message_type } => {
                value[0] = message_type << 4;
                value[1] = 0;
            }
            Self::AcknowledgeCancelUnicastTransmission { message_type } => {
                value[0] = message_type << 4;
                value[1] = 0;
            }
            Self::Unknown { value: v, .. } => value.copy_from_slice(v),
        }
        Ok(total)
    }
}

fn parse_one<'i>(input: &mut &'i [u8]) -> winnow::PResult<Tlv> {
    let tlv_type = be_u16.parse_next(input)?;
    let length = be_u16.parse_next(input)?;
    let value = take(length as usize).parse_next(input)?;
    let tlv = match tlv_type {
        TLV_REQUEST_UNICAST_TRANSMISSION => {
            let mut v = value;
            let msg_type_and_reserved = be_u8.parse_next(&mut v)?;
            let log_inter_message_period = be_i8.parse_next(&mut v)?;
            let duration_field = be_u32.parse_next(&mut v)?;
            Tlv::RequestUnicastTransmission {
                message_type: msg_type_and_reserved >> 4,
                log_inter_message_period,
                duration_field,
            }
        }
        TLV_GRANT_UNICAST_TRANSMISSION => {
            let mut v = value;
            let msg_type_and_reserved = be_u8.parse_next(&mut v)?;
            let log_inter_message_period = be_i8.parse_next(&mut v)?;
            let duration_field = be_u32.parse_next(&mut v)?;
            let renewal_byte = be_u8.parse_next(&mut v)?;
            Tlv::GrantUnicastTransmission {
                message_type: msg_type_and_reserved >> 4,
                log_inter_message_period,
                duration_field,
                renewal: renewal_byte & 0x01 != 0,
            }
        }
        TLV_CANCEL_UNICAST_TRANSMISSION => {
            let mut v = value;
            let msg_type_and_flags = be_u8.parse_next(&mut v)?;
            Tlv::CancelUnicastTransmission {
                message_type: msg_type_and_flags >> 4,
            }
        }
        TLV_ACKNOWLEDGE_CANCEL_UNICAST_TRANSMISSION => {
            let mut v = value;
            let msg_type_and_flags = be_u8.parse_next(&mut v)?;
            Tlv::AcknowledgeCancelUnicastTransmission {
                message_type: msg_type_and_flags >> 4,
            }
        }
        other => Tlv::Unknown {
            tlv_type: other,
            value: value.to_vec(),
        },
    };
    Ok(tlv)
}

/// Walk a SIGNALING message's TLV list until the buffer is exhausted.
/// Malformed trailing bytes are logged and dropped rather than failing the
/// whole decode, matching spec.md's unknown-TLV tolerance.
pub fn parse_tlvs(mut data: &[u8]) -> Vec<Tlv> {
    let mut tlvs = Vec::new();
    while !data.is_empty() {
        match parse_one(&mut data) {
            Ok(tlv) => tlvs.push(tlv),
            Err(ErrMode::Incomplete(_)) | Err(_) => {
                tracing::debug!(remaining = data.len(), "truncated SIGNALING TLV, stopping");
                break;
            }
        }
    }
    tlvs
}

/// SIGNALING message body: the port the TLVs apply to, plus the TLV list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingBody {
    pub target_port_identity: PortIdentity,
    pub tlvs: Vec<Tlv>,
}

impl SignalingBody {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (wire, rest) = WirePortIdentity::ref_from_prefix(data).map_err(|_| Error::Truncated {
            expected: WirePortIdentity::SIZE,
            actual: data.len(),
        })?;
        Ok(Self {
            target_port_identity: wire.to_identity(),
            tlvs: parse_tlvs(rest),
        })
    }

    pub fn encoded_len(&self) -> usize {
        WirePortIdentity::SIZE + self.tlvs.iter().map(Tlv::encoded_len).sum::<usize>()
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let total = self.encoded_len();
        if buf.len() < total {
            return Err(Error::Truncated {
                expected: total,
                actual: buf.len(),
            });
        }
        let wire = WirePortIdentity::from_identity(self.target_port_identity);
        buf[..WirePortIdentity::SIZE].copy_from_slice(zerocopy::IntoBytes::as_bytes(&wire));
        let mut offset = WirePortIdentity::SIZE;
        for tlv in &self.tlvs {
            offset += tlv.encode(&mut buf[offset..])?;
        }
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ClockIdentity;

    fn port() -> PortIdentity {
        PortIdentity::new(ClockIdentity(0x1122334455667788), 1)
    }

    #[test]
    fn request_tlv_round_trips() {
        let body = SignalingBody {
            target_port_identity: port(),
            tlvs: vec![Tlv::RequestUnicastTransmission {
                message_type: 0x0, // Sync
                log_inter_message_period: -2,
                duration_field: 60,
            }],
        };
        let mut buf = [0u8; 64];
        let n = body.encode(&mut buf).unwrap();
        let decoded = SignalingBody::decode(&buf[..n]).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn grant_tlv_round_trips_with_renewal_bit() {
        let body = SignalingBody {
            target_port_identity: port(),
            tlvs: vec![Tlv::GrantUnicastTransmission {
                message_type: 0xB, // Announce
                log_inter_message_period: 0,
                duration_field: 60,
                renewal: true,
            }],
        };
        let mut buf = [0u8; 64];
        let n = body.encode(&mut buf).unwrap();
        let decoded = SignalingBody::decode(&buf[..n]).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn cancel_and_ack_round_trip() {
        let body = SignalingBody {
            target_port_identity: port(),
            tlvs: vec![
                Tlv::CancelUnicastTransmission { message_type: 0x9 },
                Tlv::AcknowledgeCancelUnicastTransmission { message_type: 0x9 },
            ],
        };
        let mut buf = [0u8; 64];
        let n = body.encode(&mut buf).unwrap();
        let decoded = SignalingBody::decode(&buf[..n]).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn unknown_tlv_is_preserved_opaquely() {
        let mut data = Vec::new();
        data.extend_from_slice(&0x1234u16.to_be_bytes());
        data.extend_from_slice(&3u16.to_be_bytes());
        data.extend_from_slice(&[1, 2, 3]);
        let tlvs = parse_tlvs(&data);
        assert_eq!(
            tlvs,
            vec![Tlv::Unknown {
                tlv_type: 0x1234,
                value: vec![1, 2, 3],
            }]
        );
    }

    #[test]
    fn truncated_tlv_list_stops_cleanly() {
        let mut data = Vec::new();
        data.extend_from_slice(&TLV_CANCEL_UNICAST_TRANSMISSION.to_be_bytes());
        data.extend_from_slice(&10u16.to_be_bytes()); // claims 10 bytes, only 1 follows
        data.push(0);
        assert!(parse_tlvs(&data).is_empty());
    }
}
