use std::{
    fmt::{self, Display},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize, de};

/// The number of milliseconds since the [`UNIX_EPOCH`].
///
/// - Every temporal field in the escrow data model (`pay_by_time`,
///   `unlock_time`, cooldowns, lease timestamps) is one of these.
/// - Internally represented by a non-negative [`i64`] so the value survives
///   round-trips through stores and APIs which don't support unsigned ints.
/// - Can represent any time from January 1st, 1970 00:00:00.000 UTC to
///   roughly 292 million years in the future.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct TimestampMs(i64);

impl TimestampMs {
    pub const MIN: Self = TimestampMs(0);
    pub const MAX: Self = TimestampMs(i64::MAX);

    /// Creates a new [`TimestampMs`] from the current [`SystemTime`].
    ///
    /// Panics if the current time is not within bounds.
    pub fn now() -> Self {
        Self::try_from(SystemTime::now()).unwrap()
    }

    /// Constructs a [`TimestampMs`] from an [`i64`] in milliseconds.
    /// Returns an error if the value is negative.
    pub fn try_from_ms(ms: i64) -> anyhow::Result<Self> {
        if ms >= 0 {
            Ok(Self(ms))
        } else {
            Err(anyhow::anyhow!("Timestamp must be non-negative: {ms}"))
        }
    }

    /// Returns the contained [`i64`].
    #[inline]
    pub fn to_i64(self) -> i64 {
        self.0
    }

    /// Saturating timestamp + duration addition.
    pub fn saturating_add(self, duration: Duration) -> Self {
        let add_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(add_ms))
    }

    /// Saturating timestamp - duration subtraction, clamped at the epoch.
    pub fn saturating_sub(self, duration: Duration) -> Self {
        let sub_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(sub_ms).max(0))
    }

    /// The duration from `earlier` until `self`, or [`Duration::ZERO`] if
    /// `earlier` is actually later.
    pub fn duration_since(self, earlier: Self) -> Duration {
        let delta_ms = self.0.saturating_sub(earlier.0).max(0);
        Duration::from_millis(delta_ms as u64)
    }
}

/// Get a [`SystemTime`] corresponding to this timestamp.
impl From<TimestampMs> for SystemTime {
    fn from(timestamp: TimestampMs) -> Self {
        let timestamp_u64 = u64::try_from(timestamp.0)
            .expect("Non-negative invariant was violated");
        UNIX_EPOCH + Duration::from_millis(timestamp_u64)
    }
}

/// Attempts to convert a [`SystemTime`] into a [`TimestampMs`].
///
/// Returns an error if the [`SystemTime`] is not within bounds.
impl TryFrom<SystemTime> for TimestampMs {
    type Error = anyhow::Error;
    fn try_from(system_time: SystemTime) -> anyhow::Result<Self> {
        let ms = system_time
            .duration_since(UNIX_EPOCH)
            .context("Current time is before January 1st, 1970")?
            .as_millis();
        i64::try_from(ms)
            .map(Self)
            .context("Current time is more than 292 million years past epoch")
    }
}

/// Enforces that the inner [`i64`] is non-negative.
impl<'de> Deserialize<'de> for TimestampMs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        if value >= 0 {
            Ok(TimestampMs(value))
        } else {
            Err(de::Error::invalid_value(
                de::Unexpected::Signed(value),
                &"Unix timestamp must be non-negative",
            ))
        }
    }
}

impl Display for TimestampMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for TimestampMs {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let ms = i64::from_str(s).context("Not a valid i64 timestamp")?;
        Self::try_from_ms(ms)
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::Arbitrary,
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for TimestampMs {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            (0..i64::MAX).prop_map(TimestampMs).boxed()
        }
    }
}
