//! Expiration policy for cached entries.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// Seconds in an hour.
pub const ONE_HOUR_IN_SECONDS: u64 = 3600;
/// Seconds in a day.
pub const ONE_DAY_IN_SECONDS: u64 = ONE_HOUR_IN_SECONDS * 24;
/// Seconds in a week.
pub const ONE_WEEK_IN_SECONDS: u64 = ONE_DAY_IN_SECONDS * 7;
/// Seconds in a 30 day month.
pub const ONE_MONTH_IN_SECONDS: u64 = ONE_DAY_IN_SECONDS * 30;
/// Seconds in a 365 day year. Ceiling reported for entries that never expire.
pub const ONE_YEAR_IN_SECONDS: u64 = ONE_DAY_IN_SECONDS * 365;

/// Longest expiration handed to a store. Anything longer never expires.
pub const MAX_STORE_TTL_IN_SECONDS: u64 = ONE_YEAR_IN_SECONDS * 100;

/// Time-to-live of a store entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
pub enum Ttl {
    /// Expires after this many seconds.
    Seconds(u64),
    /// Never expires.
    Unbounded,
}

impl Ttl {
    /// Seconds to advertise in freshness headers, capped at
    /// [`ONE_YEAR_IN_SECONDS`]. `Unbounded` is presented as the cap.
    pub fn header_seconds(self) -> u64 {
        match self {
            Ttl::Seconds(secs) => secs.min(ONE_YEAR_IN_SECONDS),
            Ttl::Unbounded => ONE_YEAR_IN_SECONDS,
        }
    }

    /// The TTL a store should apply. Expirations beyond
    /// [`MAX_STORE_TTL_IN_SECONDS`] become [`Ttl::Unbounded`].
    pub fn for_store(self) -> Ttl {
        match self {
            Ttl::Seconds(secs) if secs > MAX_STORE_TTL_IN_SECONDS => {
                Ttl::Unbounded
            }
            ttl => ttl,
        }
    }

    /// The store-side expiration, `None` meaning no expiration.
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Ttl::Seconds(secs) => Some(Duration::from_secs(secs)),
            Ttl::Unbounded => None,
        }
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::Seconds(secs) => write!(f, "{secs}s"),
            Ttl::Unbounded => f.write_str("unbounded"),
        }
    }
}

/// Per-endpoint expiration, as seconds and/or milliseconds.
///
/// ```
/// use redis_response_cache::{Expire, Ttl};
///
/// assert_eq!(Expire::new(Some(0), Some(500)).resolve(), Ttl::Seconds(1));
/// assert_eq!(Expire::new(Some(2), Some(1500)).resolve(), Ttl::Seconds(3));
/// assert_eq!(Expire::never().resolve(), Ttl::Unbounded);
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize,
)]
#[serde(default)]
pub struct Expire {
    /// Whole seconds
    pub seconds: Option<u64>,
    /// Milliseconds, added to `seconds` after flooring to whole seconds
    pub milliseconds: Option<u64>,
}

impl Expire {
    /// Creates an expiration from its two optional parts.
    pub fn new(seconds: Option<u64>, milliseconds: Option<u64>) -> Self {
        Self { seconds, milliseconds }
    }

    /// Expire after `seconds`.
    pub fn seconds(seconds: u64) -> Self {
        Self::new(Some(seconds), None)
    }

    /// Expire after `milliseconds`.
    pub fn milliseconds(milliseconds: u64) -> Self {
        Self::new(None, Some(milliseconds))
    }

    /// Never expire.
    pub fn never() -> Self {
        Self::default()
    }

    /// One minute.
    pub fn one_minute() -> Self {
        Self::seconds(60)
    }

    /// One hour.
    pub fn one_hour() -> Self {
        Self::seconds(ONE_HOUR_IN_SECONDS)
    }

    /// One day.
    pub fn one_day() -> Self {
        Self::seconds(ONE_DAY_IN_SECONDS)
    }

    /// One week.
    pub fn one_week() -> Self {
        Self::seconds(ONE_WEEK_IN_SECONDS)
    }

    /// Thirty days.
    pub fn one_month() -> Self {
        Self::seconds(ONE_MONTH_IN_SECONDS)
    }

    /// 365 days.
    pub fn one_year() -> Self {
        Self::seconds(ONE_YEAR_IN_SECONDS)
    }

    /// Resolves to a concrete TTL.
    ///
    /// No nonzero part means [`Ttl::Unbounded`]. Otherwise the parts are
    /// summed with milliseconds floored to seconds, and a nonzero
    /// configuration never resolves below one second.
    pub fn resolve(self) -> Ttl {
        let secs = self.seconds.unwrap_or(0);
        let millis = self.milliseconds.unwrap_or(0);
        if secs == 0 && millis == 0 {
            return Ttl::Unbounded;
        }
        Ttl::Seconds(secs.saturating_add(millis / 1000).max(1))
    }
}

impl From<Duration> for Expire {
    fn from(value: Duration) -> Self {
        Self::new(
            Some(value.as_secs()),
            Some(u64::from(value.subsec_millis())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_or_zero_is_unbounded() {
        assert_eq!(Expire::new(None, None).resolve(), Ttl::Unbounded);
        assert_eq!(Expire::new(Some(0), Some(0)).resolve(), Ttl::Unbounded);
        assert_eq!(Expire::new(Some(0), None).resolve(), Ttl::Unbounded);
    }

    #[test]
    fn sub_second_floors_to_one() {
        assert_eq!(Expire::new(Some(0), Some(500)).resolve(), Ttl::Seconds(1));
        assert_eq!(Expire::milliseconds(999).resolve(), Ttl::Seconds(1));
        assert_eq!(Expire::milliseconds(2999).resolve(), Ttl::Seconds(2));
    }

    #[test]
    fn parts_are_summed() {
        assert_eq!(Expire::new(Some(5), Some(2500)).resolve(), Ttl::Seconds(7));
        assert_eq!(Expire::one_hour().resolve(), Ttl::Seconds(3600));
        assert_eq!(
            Expire::from(Duration::from_millis(5250)).resolve(),
            Ttl::Seconds(5)
        );
    }

    #[test]
    fn header_ceiling() {
        assert_eq!(Ttl::Unbounded.header_seconds(), 31_536_000);
        assert_eq!(Ttl::Seconds(60).header_seconds(), 60);
        assert_eq!(Ttl::Unbounded.as_duration(), None);
    }

    #[test]
    fn long_ttls_are_capped_in_headers() {
        let two_years = Expire::seconds(2 * ONE_YEAR_IN_SECONDS).resolve();
        assert_eq!(two_years, Ttl::Seconds(2 * ONE_YEAR_IN_SECONDS));
        assert_eq!(two_years.header_seconds(), ONE_YEAR_IN_SECONDS);
        assert_eq!(Ttl::Seconds(u64::MAX).header_seconds(), ONE_YEAR_IN_SECONDS);
        assert_eq!(
            Expire::new(Some(u64::MAX), Some(u64::MAX)).resolve(),
            Ttl::Seconds(u64::MAX)
        );
    }

    #[test]
    fn store_ttls_are_bounded() {
        assert_eq!(Ttl::Seconds(u64::MAX).for_store(), Ttl::Unbounded);
        assert_eq!(
            Ttl::Seconds(MAX_STORE_TTL_IN_SECONDS).for_store(),
            Ttl::Seconds(MAX_STORE_TTL_IN_SECONDS)
        );
        assert_eq!(Ttl::Seconds(60).for_store(), Ttl::Seconds(60));
        assert_eq!(Ttl::Unbounded.for_store(), Ttl::Unbounded);
    }
}
