//! Conversions between [`PtpTimestamp`] and `std::time`, including the
//! software-timestamping UTC offset correction (IEEE 1588 uses TAI; PHC/HW
//! timestamps are already TAI, `CLOCK_REALTIME`-derived SW timestamps are
//! UTC and need the offset added back in).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::body::PtpTimestamp;

impl PtpTimestamp {
    /// Build from a `SystemTime`, saturating to zero for times before the epoch.
    pub fn from_system_time(t: SystemTime) -> Self {
        let dur = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self {
            seconds: dur.as_secs(),
            nanoseconds: dur.subsec_nanos(),
        }
    }

    /// Convert to a `SystemTime`.
    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::new(self.seconds, self.nanoseconds)
    }

    /// Add `offset_seconds` (positive or negative) to this timestamp. Used to
    /// move a `CLOCK_REALTIME`-derived (UTC) software timestamp onto the TAI
    /// timescale PTP requires; never applied to hardware/PHC timestamps,
    /// which are already TAI.
    pub fn apply_utc_offset(self, offset_seconds: i16) -> Self {
        let seconds = (self.seconds as i64 + offset_seconds as i64).max(0) as u64;
        Self {
            seconds,
            nanoseconds: self.nanoseconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_time_round_trips() {
        let t = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        let ts = PtpTimestamp::from_system_time(t);
        assert_eq!(ts.to_system_time(), t);
    }

    #[test]
    fn utc_offset_is_additive() {
        let ts = PtpTimestamp {
            seconds: 1000,
            nanoseconds: 0,
        };
        assert_eq!(ts.apply_utc_offset(37).seconds, 1037);
        assert_eq!(ts.apply_utc_offset(-37).seconds, 963);
    }
}
