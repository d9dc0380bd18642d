//! Per-message-type bodies (IEEE 1588-2019 §13.6-13.9, §13.5).
//!
//! Each body is a fixed-size, big-endian, allocation-free wire struct paired
//! with a small owned type the rest of the crate works with.

use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::identity::{ClockIdentity, PortIdentity, WirePortIdentity};

/// A PTP timestamp: seconds (48-bit on the wire, stored widened) plus
/// nanoseconds-of-second. See [`crate::codec::timestamp`] for conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PtpTimestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

/// On-wire 10-byte timestamp: 48-bit seconds + 32-bit nanoseconds.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct WireTimestamp {
    seconds_hi: U16,
    seconds_lo: U32,
    nanoseconds: U32,
}

impl WireTimestamp {
    pub const SIZE: usize = 10;

    pub fn from_timestamp(ts: PtpTimestamp) -> Self {
        Self {
            seconds_hi: ((ts.seconds >> 32) as u16).into(),
            seconds_lo: (ts.seconds as u32).into(),
            nanoseconds: ts.nanoseconds.into(),
        }
    }

    pub fn to_timestamp(self) -> PtpTimestamp {
        PtpTimestamp {
            seconds: ((self.seconds_hi.get() as u64) << 32) | self.seconds_lo.get() as u64,
            nanoseconds: self.nanoseconds.get(),
        }
    }
}

/// Sync / Delay_Req body: a single origin/request timestamp.
/// The value is generally zeroed at send time for one-step-incapable senders
/// and carried in the matching Follow_Up instead; this server always runs
/// two-step, so `origin_timestamp` is written as zero on Sync and ignored on
/// decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncBody {
    pub origin_timestamp: PtpTimestamp,
}

impl SyncBody {
    pub const SIZE: usize = WireTimestamp::SIZE;

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(Error::Truncated {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        let wire = WireTimestamp::from_timestamp(self.origin_timestamp);
        buf[..Self::SIZE].copy_from_slice(wire.as_bytes());
        Ok(Self::SIZE)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (wire, _) = WireTimestamp::ref_from_prefix(data).map_err(|_| Error::Truncated {
            expected: Self::SIZE,
            actual: data.len(),
        })?;
        Ok(Self {
            origin_timestamp: wire.to_timestamp(),
        })
    }
}

/// Delay_Req body is identical in shape to Sync's.
pub type DelayReqBody = SyncBody;

/// Follow_Up body: the precise origin timestamp for the preceding Sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FollowUpBody {
    pub precise_origin_timestamp: PtpTimestamp,
}

impl FollowUpBody {
    pub const SIZE: usize = WireTimestamp::SIZE;

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(Error::Truncated {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        let wire = WireTimestamp::from_timestamp(self.precise_origin_timestamp);
        buf[..Self::SIZE].copy_from_slice(wire.as_bytes());
        Ok(Self::SIZE)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (wire, _) = WireTimestamp::ref_from_prefix(data).map_err(|_| Error::Truncated {
            expected: Self::SIZE,
            actual: data.len(),
        })?;
        Ok(Self {
            precise_origin_timestamp: wire.to_timestamp(),
        })
    }
}

/// Delay_Resp body: receive timestamp of the Delay_Req plus the requesting
/// client's port identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DelayRespBody {
    pub receive_timestamp: PtpTimestamp,
    pub requesting_port_identity: PortIdentity,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct WireDelayResp {
    receive_timestamp: WireTimestamp,
    requesting_port_identity: WirePortIdentity,
}

impl DelayRespBody {
    pub const SIZE: usize = WireTimestamp::SIZE + WirePortIdentity::SIZE;

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(Error::Truncated {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        let wire = WireDelayResp {
            receive_timestamp: WireTimestamp::from_timestamp(self.receive_timestamp),
            requesting_port_identity: WirePortIdentity::from_identity(
                self.requesting_port_identity,
            ),
        };
        buf[..Self::SIZE].copy_from_slice(wire.as_bytes());
        Ok(Self::SIZE)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (wire, _) = WireDelayResp::ref_from_prefix(data).map_err(|_| Error::Truncated {
            expected: Self::SIZE,
            actual: data.len(),
        })?;
        Ok(Self {
            receive_timestamp: wire.receive_timestamp.to_timestamp(),
            requesting_port_identity: wire.requesting_port_identity.to_identity(),
        })
    }
}

/// Announce body: grandmaster advertisement. This server always advertises
/// itself as grandmaster (no BMCA, no foreign masters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceBody {
    pub origin_timestamp: PtpTimestamp,
    pub current_utc_offset: i16,
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_quality_class: u8,
    pub grandmaster_clock_quality_accuracy: u8,
    pub grandmaster_clock_quality_log_variance: u16,
    pub grandmaster_priority2: u8,
    pub grandmaster_identity: ClockIdentity,
    pub steps_removed: u16,
    pub time_source: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct WireAnnounce {
    origin_timestamp: WireTimestamp,
    current_utc_offset: zerocopy::byteorder::big_endian::I16,
    reserved: u8,
    grandmaster_priority1: u8,
    grandmaster_clock_quality_class: u8,
    grandmaster_clock_quality_accuracy: u8,
    grandmaster_clock_quality_log_variance: U16,
    grandmaster_priority2: u8,
    grandmaster_identity: zerocopy::byteorder::big_endian::U64,
    steps_removed: U16,
    time_source: u8,
}

impl AnnounceBody {
    pub const SIZE: usize = 30;

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(Error::Truncated {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        let wire = WireAnnounce {
            origin_timestamp: WireTimestamp::from_timestamp(self.origin_timestamp),
            current_utc_offset: self.current_utc_offset.into(),
            reserved: 0,
            grandmaster_priority1: self.grandmaster_priority1,
            grandmaster_clock_quality_class: self.grandmaster_clock_quality_class,
            grandmaster_clock_quality_accuracy: self.grandmaster_clock_quality_accuracy,
            grandmaster_clock_quality_log_variance: self
                .grandmaster_clock_quality_log_variance
                .into(),
            grandmaster_priority2: self.grandmaster_priority2,
            grandmaster_identity: self.grandmaster_identity.as_u64().into(),
            steps_removed: self.steps_removed.into(),
            time_source: self.time_source,
        };
        buf[..Self::SIZE].copy_from_slice(wire.as_bytes());
        Ok(Self::SIZE)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (wire, _) = WireAnnounce::ref_from_prefix(data).map_err(|_| Error::Truncated {
            expected: Self::SIZE,
            actual: data.len(),
        })?;
        Ok(Self {
            origin_timestamp: wire.origin_timestamp.to_timestamp(),
            current_utc_offset: wire.current_utc_offset.get(),
            grandmaster_priority1: wire.grandmaster_priority1,
            grandmaster_clock_quality_class: wire.grandmaster_clock_quality_class,
            grandmaster_clock_quality_accuracy: wire.grandmaster_clock_quality_accuracy,
            grandmaster_clock_quality_log_variance: wire
                .grandmaster_clock_quality_log_variance
                .get(),
            grandmaster_priority2: wire.grandmaster_priority2,
            grandmaster_identity: ClockIdentity(wire.grandmaster_identity.get()),
            steps_removed: wire.steps_removed.get(),
            time_source: wire.time_source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_body_round_trips() {
        let body = SyncBody {
            origin_timestamp: PtpTimestamp {
                seconds: 0x0000_0001_2345_6789,
                nanoseconds: 500_000_000,
            },
        };
        let mut buf = [0u8; SyncBody::SIZE];
        body.encode(&mut buf).unwrap();
        assert_eq!(SyncBody::decode(&buf).unwrap(), body);
    }

    #[test]
    fn delay_resp_body_round_trips() {
        let body = DelayRespBody {
            receive_timestamp: PtpTimestamp {
                seconds: 42,
                nanoseconds: 7,
            },
            requesting_port_identity: PortIdentity::new(ClockIdentity(0xaabbccddeeff0011), 3),
        };
        let mut buf = [0u8; DelayRespBody::SIZE];
        body.encode(&mut buf).unwrap();
        assert_eq!(DelayRespBody::decode(&buf).unwrap(), body);
    }

    #[test]
    fn announce_body_round_trips() {
        let body = AnnounceBody {
            origin_timestamp: PtpTimestamp::default(),
            current_utc_offset: 37,
            grandmaster_priority1: 128,
            grandmaster_clock_quality_class: 6,
            grandmaster_clock_quality_accuracy: 0x20,
            grandmaster_clock_quality_log_variance: 0xffff,
            grandmaster_priority2: 128,
            grandmaster_identity: ClockIdentity(0x0102030405060708),
            steps_removed: 0,
            time_source: 0xa0,
        };
        let mut buf = [0u8; AnnounceBody::SIZE];
        body.encode(&mut buf).unwrap();
        assert_eq!(AnnounceBody::decode(&buf).unwrap(), body);
    }

    #[test]
    fn truncated_body_is_rejected() {
        assert!(matches!(
            SyncBody::decode(&[0u8; 4]),
            Err(Error::Truncated { .. })
        ));
    }
}
