//! Static (startup, immutable) and dynamic (hot-reloadable) server configuration.
//!
//! The dynamic file is a flat `key = value` list, not TOML/YAML — parsed the
//! same plain `&str`-splitting-plus-`.parse()` way `util::rate`/`util::addr`
//! convert user-supplied text elsewhere in this workspace, since pulling in a
//! config-format crate for half a dozen scalar keys would be overkill.

use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::timestamping::TimestampMode;

/// Startup configuration. Immutable for the life of the process; changing
/// any of these fields requires a restart.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    /// Outgoing interface; its MAC seeds this server's `ClockIdentity`.
    pub interface: String,
    pub ip: std::net::IpAddr,
    pub event_port: u16,
    pub general_port: u16,
    pub worker_count: usize,
    /// Bounded job-queue capacity, per worker, per message kind.
    pub queue_capacity: usize,
    pub timestamp_mode: TimestampMode,
    pub dscp: u8,
    pub pid_file: std::path::PathBuf,
    pub dynamic_config_path: Option<std::path::PathBuf>,
    pub attempts_txts: u32,
    pub timeout_txts: Duration,
}

impl StaticConfig {
    /// Validate the parts that can be checked without touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::InvalidStaticConfig(
                "worker_count must be at least 1".into(),
            ));
        }
        if self.event_port == self.general_port {
            return Err(Error::InvalidStaticConfig(
                "event_port and general_port must differ".into(),
            ));
        }
        if self.dscp > 63 {
            return Err(Error::InvalidStaticConfig(format!(
                "dscp {} exceeds the 6-bit DSCP range",
                self.dscp
            )));
        }
        Ok(())
    }

    /// `TOS`/`TCLASS` byte for this config's DSCP value (ECN bits left at 0).
    pub fn dscp_tos_byte(&self) -> u8 {
        self.dscp << 2
    }
}

/// Hot-reloadable configuration: everything SIGHUP can change without
/// restarting listeners or workers.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicConfig {
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub clock_log_variance: u16,
    pub utc_offset_seconds: i16,
    pub priority1: u8,
    pub priority2: u8,
    pub time_source: u8,
    /// Shortest tick interval a SIGNALING request may ask for; faster
    /// requests are denied.
    pub min_subscription_interval: Duration,
    /// Longest grant duration a SIGNALING request may ask for; longer
    /// requests are denied, not clamped.
    pub max_subscription_duration: Duration,
    /// Period of the metrics/inventory snapshot background task.
    pub metrics_interval: Duration,
    /// Period of the drain-predicate poll background task.
    pub drain_check_interval: Duration,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            clock_class: 6,
            clock_accuracy: 0x20,
            clock_log_variance: 0xffff,
            utc_offset_seconds: 37,
            priority1: 128,
            priority2: 128,
            time_source: 0xa0,
            min_subscription_interval: Duration::from_millis(100),
            max_subscription_duration: Duration::from_secs(300),
            metrics_interval: Duration::from_secs(60),
            drain_check_interval: Duration::from_secs(1),
        }
    }
}

impl DynamicConfig {
    /// Sanity range a reload must stay within; a dynamic-config file sourced
    /// from tzdata-derived UTC offset data should never be wildly wrong, and
    /// a typo (`370` instead of `37`) should not silently poison every
    /// outgoing Announce.
    const UTC_OFFSET_RANGE: std::ops::RangeInclusive<i16> = 30..=50;

    pub fn validate(&self) -> Result<()> {
        if !Self::UTC_OFFSET_RANGE.contains(&self.utc_offset_seconds) {
            return Err(Error::InvalidConfig {
                key: "utcoffset".into(),
                reason: format!(
                    "{} outside sane range {:?}",
                    self.utc_offset_seconds,
                    Self::UTC_OFFSET_RANGE
                ),
            });
        }
        Ok(())
    }

    /// Parse a flat `key = value` file (blank lines and `#` comments ignored).
    ///
    /// Recognized keys match the external dynamic-config format: `clockclass`,
    /// `clockaccuracy`, `clockvariance`, `utcoffset`, `priority1`, `priority2`,
    /// `timesource`, `minsubinterval`, `maxsubduration`, `metricinterval`,
    /// `draininterval`. The four `*interval`/`*duration` keys take human
    /// duration units (`2s`, `500ms`, `3h`); everything else is a plain
    /// integer.
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| Error::InvalidConfig {
                key: line.to_string(),
                reason: "expected 'key = value'".into(),
            })?;
            let key = key.trim();
            let value = value.trim();
            let parse_u8 = || {
                value.parse::<u8>().map_err(|e| Error::InvalidConfig {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            };
            match key {
                "clockclass" => config.clock_class = parse_u8()?,
                "clockaccuracy" => config.clock_accuracy = parse_u8()?,
                "clockvariance" => {
                    config.clock_log_variance =
                        value.parse().map_err(|e: std::num::ParseIntError| {
                            Error::InvalidConfig {
                                key: key.to_string(),
                                reason: e.to_string(),
                            }
                        })?
                }
                "utcoffset" => {
                    config.utc_offset_seconds =
                        value.parse().map_err(|e: std::num::ParseIntError| {
                            Error::InvalidConfig {
                                key: key.to_string(),
                                reason: e.to_string(),
                            }
                        })?
                }
                "priority1" => config.priority1 = parse_u8()?,
                "priority2" => config.priority2 = parse_u8()?,
                "timesource" => config.time_source = parse_u8()?,
                "minsubinterval" => config.min_subscription_interval = parse_human_duration(key, value)?,
                "maxsubduration" => config.max_subscription_duration = parse_human_duration(key, value)?,
                "metricinterval" => config.metrics_interval = parse_human_duration(key, value)?,
                "draininterval" => config.drain_check_interval = parse_human_duration(key, value)?,
                other => {
                    return Err(Error::InvalidConfig {
                        key: other.to_string(),
                        reason: "unknown key".into(),
                    })
                }
            }
        }
        config.validate()?;
        Ok(config)
    }
}

/// Parse a human duration like `2s`, `500ms`, or `3h`: a run of ASCII digits
/// followed by a unit suffix (`ns`, `us`, `ms`, `s`, `m`, `h`).
fn parse_human_duration(key: &str, value: &str) -> Result<Duration> {
    let split_at = value.find(|c: char| !c.is_ascii_digit()).ok_or_else(|| Error::InvalidConfig {
        key: key.to_string(),
        reason: format!("expected a number followed by a unit (e.g. '2s'), got '{value}'"),
    })?;
    let (number, unit) = value.split_at(split_at);
    let number: u64 = number.parse().map_err(|_| Error::InvalidConfig {
        key: key.to_string(),
        reason: format!("'{number}' is not a valid duration magnitude"),
    })?;
    match unit {
        "ns" => Ok(Duration::from_nanos(number)),
        "us" => Ok(Duration::from_micros(number)),
        "ms" => Ok(Duration::from_millis(number)),
        "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(number.saturating_mul(3600))),
        other => Err(Error::InvalidConfig {
            key: key.to_string(),
            reason: format!("unrecognized duration unit '{other}'"),
        }),
    }
}

/// Mutex-guarded current dynamic config, swapped wholesale on reload.
#[derive(Debug)]
pub struct DynamicConfigCell(Mutex<DynamicConfig>);

impl DynamicConfigCell {
    pub fn new(initial: DynamicConfig) -> Self {
        Self(Mutex::new(initial))
    }

    pub fn get(&self) -> DynamicConfig {
        self.0.lock().expect("dynamic config mutex poisoned").clone()
    }

    pub fn replace(&self, new: DynamicConfig) {
        *self.0.lock().expect("dynamic config mutex poisoned") = new;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_file() {
        let cfg = DynamicConfig::parse("clockclass = 13\nutcoffset = 37\n").unwrap();
        assert_eq!(cfg.clock_class, 13);
        assert_eq!(cfg.utc_offset_seconds, 37);
        assert_eq!(cfg.priority1, 128, "unset keys keep their default");
    }

    #[test]
    fn ignores_blank_lines_and_comments() {
        let cfg = DynamicConfig::parse("# comment\n\nclockclass = 5\n").unwrap();
        assert_eq!(cfg.clock_class, 5);
    }

    #[test]
    fn parses_human_duration_keys() {
        let cfg = DynamicConfig::parse(
            "minsubinterval = 250ms\nmaxsubduration = 2h\nmetricinterval = 30s\ndraininterval = 500ms\n",
        )
        .unwrap();
        assert_eq!(cfg.min_subscription_interval, Duration::from_millis(250));
        assert_eq!(cfg.max_subscription_duration, Duration::from_secs(2 * 3600));
        assert_eq!(cfg.metrics_interval, Duration::from_secs(30));
        assert_eq!(cfg.drain_check_interval, Duration::from_millis(500));
    }

    #[test]
    fn rejects_a_duration_without_a_unit_suffix() {
        let err = DynamicConfig::parse("minsubinterval = 250").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn rejects_utc_offset_outside_sanity_range() {
        let err = DynamicConfig::parse("utcoffset = 370").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn rejects_unknown_key() {
        let err = DynamicConfig::parse("bogus = 1").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn static_config_rejects_zero_workers() {
        let cfg = StaticConfig {
            interface: "eth0".into(),
            ip: "127.0.0.1".parse().unwrap(),
            event_port: 319,
            general_port: 320,
            worker_count: 0,
            queue_capacity: 128,
            timestamp_mode: TimestampMode::Software,
            dscp: 46,
            pid_file: "/tmp/ptp4u.pid".into(),
            dynamic_config_path: None,
            attempts_txts: 100,
            timeout_txts: Duration::from_millis(1),
        };
        assert!(cfg.validate().is_err());
    }
}
