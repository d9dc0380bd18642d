//! Crate-wide error type.

use std::io;

/// Result type used throughout `ptp4u`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while operating a unicast PTPv2 server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A packet was shorter than the type being decoded requires.
    #[error("truncated packet: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum bytes required.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// The low nibble of the first header byte did not match a known message type.
    #[error("unknown PTP message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// A TX timestamp did not arrive within `AttemptsTXTS` poll iterations.
    #[error("TX timestamp not observed within the retry budget")]
    TxTimestampMissing,

    /// A driver/NIC does not support the requested timestamping mode.
    #[error("timestamping mode {mode:?} not supported on {interface}: {reason}")]
    TimestampUnsupported {
        /// Mode that was requested.
        mode: crate::timestamping::TimestampMode,
        /// Interface name.
        interface: String,
        /// Driver-reported reason, if any.
        reason: String,
    },

    /// A dynamic-config key had a value outside its sanity range.
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// The offending key.
        key: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// A static-config value was invalid at startup (fatal).
    #[error("invalid static configuration: {0}")]
    InvalidStaticConfig(String),

    /// The configured interface does not exist or has no usable MAC address.
    #[error("interface '{0}' not found or has no hardware address")]
    InterfaceNotFound(String),
}
