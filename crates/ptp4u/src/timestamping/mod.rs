//! Hardware/software timestamping adapter (IEEE 1588's transparent-clock-free
//! two-step TX path needs an accurate send timestamp from the kernel or NIC).

mod socket;

pub use socket::TimestampedSocket;

use crate::error::{Error, Result};

/// Which timestamping source to use for RX and TX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimestampMode {
    /// NIC-generated timestamps via `SOF_TIMESTAMPING_TX_HARDWARE` /
    /// `SOF_TIMESTAMPING_RX_HARDWARE`, latched against the PHC.
    Hardware,
    /// Kernel-generated timestamps via `SOF_TIMESTAMPING_TX_SOFTWARE` /
    /// `SOF_TIMESTAMPING_RX_SOFTWARE`, latched against `CLOCK_REALTIME` —
    /// requires the UTC offset correction on every timestamp read.
    Software,
}

impl TimestampMode {
    /// Whether timestamps from this mode need [`crate::codec::PtpTimestamp::apply_utc_offset`].
    pub fn needs_utc_correction(self) -> bool {
        matches!(self, Self::Software)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hardware => "hardware",
            Self::Software => "software",
        }
    }
}

impl std::str::FromStr for TimestampMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hardware" | "hw" => Ok(Self::Hardware),
            "software" | "sw" => Ok(Self::Software),
            other => Err(Error::InvalidConfig {
                key: "timestamping".into(),
                reason: format!("unknown timestamp mode '{other}'"),
            }),
        }
    }
}
