//! Slot arithmetic and transaction validity windows.
//!
//! Slots are the chain's clock: one slot per second past a per-network
//! reference point. A transaction is only accepted inside its
//! `[invalid_before, invalid_after]` slot range, so every escrow interaction
//! carries a window of `now ± time_buffer` widened by the network's slot
//! buffer.

use std::time::Duration;

use escrow_core::{network::Network, time::TimestampMs};
use serde::{Deserialize, Serialize};

/// Per-network slot clock parameters.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlotConfig {
    /// Wall-clock time of `zero_slot`, in ms since the unix epoch.
    pub zero_time_ms: i64,
    /// The slot number at `zero_time_ms`.
    pub zero_slot: u64,
    /// Slot length in milliseconds.
    pub slot_length_ms: u64,
}

impl SlotConfig {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Main => Self {
                zero_time_ms: 1_596_059_091_000,
                zero_slot: 4_492_800,
                slot_length_ms: 1_000,
            },
            Network::Test => Self {
                zero_time_ms: 1_655_769_600_000,
                zero_slot: 86_400,
                slot_length_ms: 1_000,
            },
        }
    }

    /// The slot containing the given wall-clock instant. Instants before the
    /// reference point clamp to `zero_slot`.
    pub fn slot_at(&self, time: TimestampMs) -> u64 {
        let delta_ms = time.to_i64().saturating_sub(self.zero_time_ms);
        if delta_ms <= 0 {
            return self.zero_slot;
        }
        self.zero_slot + (delta_ms as u64) / self.slot_length_ms
    }

    /// The wall-clock instant at the start of the given slot.
    pub fn time_at(&self, slot: u64) -> TimestampMs {
        let offset_ms =
            slot.saturating_sub(self.zero_slot) * self.slot_length_ms;
        TimestampMs::try_from_ms(self.zero_time_ms + offset_ms as i64)
            .expect("slot reference points are past the epoch")
    }
}

/// The slot range a transaction is valid in, inclusive on both ends.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub invalid_before: u64,
    pub invalid_after: u64,
}

/// Compute the validity window for a transaction built at `now`:
/// `[slot(now - time_buffer) - 1, slot(now + time_buffer) + slot_buffer]`
/// where `slot_buffer` is the per-network settlement allowance.
pub fn validity_window(
    network: Network,
    now: TimestampMs,
    time_buffer: Duration,
) -> ValidityWindow {
    let config = SlotConfig::for_network(network);
    let lower = config.slot_at(now.saturating_sub(time_buffer));
    let upper = config.slot_at(now.saturating_add(time_buffer));
    ValidityWindow {
        invalid_before: lower.saturating_sub(1),
        invalid_after: upper + network.validity_slot_buffer(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BUFFER: Duration = Duration::from_secs(180);

    fn now() -> TimestampMs {
        TimestampMs::try_from_ms(1_700_000_000_000).unwrap()
    }

    #[test]
    fn slot_time_inverse() {
        let config = SlotConfig::for_network(Network::Main);
        let slot = config.slot_at(now());
        let time = config.time_at(slot);
        // time_at returns the slot start, within one slot of the input.
        assert!(now().duration_since(time) < Duration::from_secs(1));
        assert_eq!(config.slot_at(time), slot);
    }

    #[test]
    fn pre_reference_times_clamp() {
        let config = SlotConfig::for_network(Network::Test);
        assert_eq!(config.slot_at(TimestampMs::MIN), config.zero_slot);
    }

    #[test]
    fn window_straddles_now() {
        let window = validity_window(Network::Main, now(), BUFFER);
        let config = SlotConfig::for_network(Network::Main);
        let now_slot = config.slot_at(now());
        assert!(window.invalid_before < now_slot);
        assert!(window.invalid_after > now_slot);
        // The test network's wider slot buffer widens the window.
        let test_window = validity_window(Network::Test, now(), BUFFER);
        assert!(
            test_window.invalid_after - test_window.invalid_before
                > window.invalid_after - window.invalid_before
        );
    }
}
