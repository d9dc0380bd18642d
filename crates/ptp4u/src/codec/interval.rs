//! `logMessageInterval` / TLV duration field conversions: PTP expresses
//! message periods as a signed power-of-two-seconds exponent, never a raw
//! duration.

use std::time::Duration;

/// Truncated `log2` of `interval` in seconds, clamped to the representable
/// `i8` range. `Duration::ZERO` maps to `i8::MIN` (treated by callers as "as
/// fast as possible", matching the SIGNALING duration-field convention).
pub fn log_interval(interval: Duration) -> i8 {
    let secs = interval.as_secs_f64();
    if secs <= 0.0 {
        return i8::MIN;
    }
    let log = secs.log2().floor();
    if log >= i8::MAX as f64 {
        i8::MAX
    } else if log <= i8::MIN as f64 {
        i8::MIN
    } else {
        log as i8
    }
}

/// Inverse of [`log_interval`]: `2^n` seconds.
pub fn interval_from_log(n: i8) -> Duration {
    Duration::from_secs_f64(2f64.powi(n as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_second_is_zero() {
        assert_eq!(log_interval(Duration::from_secs(1)), 0);
    }

    #[test]
    fn two_seconds_is_one() {
        assert_eq!(log_interval(Duration::from_secs(2)), 1);
    }

    #[test]
    fn quarter_second_is_minus_two() {
        assert_eq!(log_interval(Duration::from_millis(250)), -2);
    }

    #[test]
    fn round_trip_through_power_of_two() {
        let d = interval_from_log(3);
        assert_eq!(d, Duration::from_secs(8));
        assert_eq!(log_interval(d), 3);
    }
}
