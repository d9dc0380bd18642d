//! PTPv2 wire codec: header, per-type bodies, SIGNALING TLVs, and the small
//! timestamp/interval conversions the rest of the crate needs.

mod body;
mod header;
mod interval;
mod signaling;
mod timestamp;

pub use body::{AnnounceBody, DelayReqBody, DelayRespBody, FollowUpBody, PtpTimestamp, SyncBody};
pub use header::{decode_message_type, Flags, MessageType, PtpHeader, WireHeader};
pub use interval::{interval_from_log, log_interval};
pub use signaling::{SignalingBody, Tlv};

use crate::error::Result;
use crate::identity::PortIdentity;

/// A fully-decoded PTP message: header plus its typed body.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Sync(PtpHeader, SyncBody),
    DelayReq(PtpHeader, DelayReqBody),
    FollowUp(PtpHeader, FollowUpBody),
    DelayResp(PtpHeader, DelayRespBody),
    Announce(PtpHeader, AnnounceBody),
    Signaling(PtpHeader, SignalingBody),
}

impl Message {
    pub fn header(&self) -> &PtpHeader {
        match self {
            Self::Sync(h, _)
            | Self::DelayReq(h, _)
            | Self::FollowUp(h, _)
            | Self::DelayResp(h, _)
            | Self::Announce(h, _)
            | Self::Signaling(h, _) => h,
        }
    }

    pub fn source(&self) -> PortIdentity {
        self.header().source_port_identity
    }

    /// Decode a complete PTP datagram (header + matching body).
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (header, body) = PtpHeader::decode(data)?;
        Ok(match header.message_type {
            MessageType::Sync => Self::Sync(header, SyncBody::decode(body)?),
            MessageType::DelayReq => Self::DelayReq(header, DelayReqBody::decode(body)?),
            MessageType::FollowUp => Self::FollowUp(header, FollowUpBody::decode(body)?),
            MessageType::DelayResp => Self::DelayResp(header, DelayRespBody::decode(body)?),
            MessageType::Announce => Self::Announce(header, AnnounceBody::decode(body)?),
            MessageType::Signaling => Self::Signaling(header, SignalingBody::decode(body)?),
        })
    }

    /// Encode into `buf`. Returns the total datagram length.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let (header, body_len) = match self {
            Self::Sync(h, b) => (h, b.encode(&mut buf[WireHeader::SIZE..])?),
            Self::DelayReq(h, b) => (h, b.encode(&mut buf[WireHeader::SIZE..])?),
            Self::FollowUp(h, b) => (h, b.encode(&mut buf[WireHeader::SIZE..])?),
            Self::DelayResp(h, b) => (h, b.encode(&mut buf[WireHeader::SIZE..])?),
            Self::Announce(h, b) => (h, b.encode(&mut buf[WireHeader::SIZE..])?),
            Self::Signaling(h, b) => (h, b.encode(&mut buf[WireHeader::SIZE..])?),
        };
        header.encode(body_len, buf)?;
        Ok(WireHeader::SIZE + body_len)
    }
}
