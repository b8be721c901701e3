//! Workspace-wide constants. Chain-wire constants (execution budgets,
//! collateral) live in `escrow-chain`.

use std::time::Duration;

/// Minimum gap between consecutive request deadlines
/// (`pay_by_time` → `submit_result_time` → `unlock_time` →
/// `external_dispute_unlock_time`).
pub const MIN_TIME_GAP: Duration = Duration::from_secs(5 * 60);

/// Default pad added on top of a source's cooldown when stamping a party's
/// new cooldown time. Absorbs block-time skew between our clock and the
/// chain; must exceed the worst-case finality horizon of the target network.
/// Override with `COOLDOWN_PAD_MS`.
pub const DEFAULT_COOLDOWN_PAD: Duration = Duration::from_secs(20 * 60);

/// Default scheduler tick cadence (`SCHEDULER_TICK_MS`).
pub const DEFAULT_SCHEDULER_TICK: Duration = Duration::from_secs(30);

/// Default age past which a pending transaction with no on-chain trace is
/// considered dropped (`TX_STUCK_MS`).
pub const DEFAULT_TX_STUCK: Duration = Duration::from_secs(30 * 60);

/// Default age past which a wallet lease whose transaction already failed is
/// force-released by the reaper.
pub const DEFAULT_MAX_LEASE_AGE: Duration = Duration::from_secs(10 * 60);

/// Default maximum number of requests a selector query returns per wallet.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;

/// Default half-width of a transaction's validity window
/// (`TIME_BUFFER_MS`).
pub const DEFAULT_TIME_BUFFER: Duration = Duration::from_secs(180);
