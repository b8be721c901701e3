//! The advanced-retry helper shared by all lifecycle handlers.
//!
//! Transient failures (chain unavailability, store conflicts, busy wallets)
//! are retried up to [`MAX_ATTEMPTS`] times with exponential backoff from
//! 500 ms to 7500 ms. Any other failure aborts immediately; on exhaustion
//! the last transient error is returned and the handler abandons the
//! request until the next tick (or parks it).

use std::future::Future;

use escrow_std::backoff;
use tracing::warn;

/// Attempt cap, first attempt included.
pub const MAX_ATTEMPTS: usize = 5;

const INITIAL_WAIT_MS: u64 = 500;
const MAXIMUM_WAIT_MS: u64 = 7_500;

/// Whether an error is worth another attempt.
pub trait RetryClass {
    fn is_transient(&self) -> bool;
}

/// Run `op` with the handler retry schedule. `op` is re-invoked only for
/// errors whose [`RetryClass::is_transient`] returns true.
pub async fn with_retries<T, E, F, Fut>(
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    E: RetryClass + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut waits =
        backoff::iter_with_bounds(INITIAL_WAIT_MS, MAXIMUM_WAIT_MS);

    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(out) => return Ok(out),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                let wait = waits.next().expect("backoff iter is infinite");
                warn!(
                    "{label}: attempt {attempt}/{MAX_ATTEMPTS} failed \
                     ({e}), retrying in {wait:?}"
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop returns on the final attempt")
}
