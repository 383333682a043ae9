//! Monotonic tick source for request timestamps.
//!
//! Ticks are nanoseconds since the first use of the clock in this process.
//! Message headers carry only the low 32 bits of a tick (about 4.29 s of
//! range); round-trip times are computed with wrapping arithmetic on those
//! low bits.

use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Current time in ticks (nanoseconds).
#[inline]
pub fn now() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

/// Low 32 bits of the current tick, as stamped into message headers.
#[inline]
pub fn now32() -> u32 {
    now() as u32
}

/// Elapsed ticks between a stamped issue time and `end`, modulo 2^32.
#[inline]
pub fn elapsed32(issue_time: u32, end: u32) -> u32 {
    end.wrapping_sub(issue_time)
}

/// Convert ticks to microseconds.
#[inline]
pub fn to_micros(ticks: u64) -> f64 {
    ticks as f64 / 1_000.0
}

/// Convert ticks to seconds.
#[inline]
pub fn to_seconds(ticks: u64) -> f64 {
    ticks as f64 / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn test_elapsed_wraps() {
        assert_eq!(elapsed32(10, 25), 15);
        // Issued just before the 32-bit wrap, completed just after
        assert_eq!(elapsed32(u32::MAX - 4, 5), 10);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(to_micros(2_500), 2.5);
        assert_eq!(to_seconds(1_500_000_000), 1.5);
    }
}
