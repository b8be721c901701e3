use std::{cmp::min, time::Duration};

const INITIAL_WAIT_MS: u64 = 250;
const MAXIMUM_WAIT_MS: u64 = 32_000;
const EXP_BASE: u64 = 2;

crate::const_assert!(INITIAL_WAIT_MS != 0);

/// Get an iterator of [`Duration`]s which can be passed into e.g.
/// `tokio::time::sleep` to observe time-based exponential backoff.
///
/// ```ignore
/// let mut backoff_durations = backoff::get_backoff_iter();
/// for _ in 0..10 {
///     tokio::time::sleep(backoff_durations.next().unwrap()).await;
/// }
/// ```
pub fn get_backoff_iter() -> impl Iterator<Item = Duration> {
    iter_with_bounds(INITIAL_WAIT_MS, MAXIMUM_WAIT_MS)
}

/// Like [`get_backoff_iter`], but with caller-specified initial and maximum
/// waits in milliseconds. Request handlers use this to observe their
/// 500 ms -> 7500 ms retry schedule.
pub fn iter_with_bounds(
    initial_wait_ms: u64,
    maximum_wait_ms: u64,
) -> impl Iterator<Item = Duration> {
    debug_assert!(initial_wait_ms != 0);
    debug_assert!(initial_wait_ms <= maximum_wait_ms);

    (0u32..).map(move |index| {
        let factor = EXP_BASE.saturating_pow(index);
        let wait_ms = initial_wait_ms.saturating_mul(factor);
        let bounded_wait_ms = min(wait_ms, maximum_wait_ms);
        Duration::from_millis(bounded_wait_ms)
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_integer_overflow() {
        let mut backoff_durations = get_backoff_iter();
        for _ in 0..200 {
            backoff_durations.next();
        }
    }

    #[test]
    fn respects_bounds() {
        let waits = iter_with_bounds(500, 7500).take(5).collect::<Vec<_>>();
        assert_eq!(waits[0], Duration::from_millis(500));
        assert_eq!(waits[1], Duration::from_millis(1000));
        assert_eq!(waits[4], Duration::from_millis(7500));
    }
}
