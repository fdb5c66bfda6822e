use std::time::Duration;

mod backoff;
pub use backoff::ExponentialBackoff;

mod keyed;
pub use keyed::{KeyedGuard, KeyedLocks};

/// Returns the time it takes to serialize `bytes` onto a link of `rate_bps` bits per second.
///
/// A rate of zero means "unlimited" and yields a zero duration.
#[inline]
pub fn transmission_time(bytes: usize, rate_bps: u32) -> Duration {
    if rate_bps == 0 {
        return Duration::ZERO;
    }

    let bits = bytes as u128 * 8;
    let nanos = bits * 1_000_000_000 / rate_bps as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

pub mod constants {
    /// Bits per second in one megabit per second.
    pub const MBIT: u64 = 1_000_000;
}
