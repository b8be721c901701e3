//! Transactional "lock-and-query": atomically reserve a batch of requests
//! plus the hot wallets that will sign for them.
//!
//! Everything here runs inside one serializable store transaction; the
//! all-or-nothing scope is what prevents two scheduler workers from picking
//! the same request or wallet. Each returned [`Batch`] pairs one leased
//! wallet with one request: a wallet carries at most one in-flight
//! transaction, so handing it more than one request per tick could never
//! satisfy the wallet-lease invariant. Remaining eligible requests are
//! simply picked up on later ticks.

use escrow_core::{
    action::RequestedAction,
    model::{EscrowRequest, HotWallet, PaymentSource},
    state::{OnChainState, RequestSide},
    time::TimestampMs,
};
use std::{collections::HashSet, time::Duration};

use crate::{
    locker,
    store::{StoreData, StoreError},
};

/// Constraint on a request's last observed on-chain state.
#[derive(Copy, Clone, Debug)]
pub enum StateFilter {
    /// No on-chain UTXO may exist yet (funds locking).
    Absent,
    /// The state must be one of the given set.
    AnyOf(&'static [OnChainState]),
}

/// Temporal eligibility predicate.
#[derive(Copy, Clone, Debug)]
pub enum TimeWindow {
    /// `unlock_time < now` (seller withdrawal).
    PastUnlock,
    /// `external_dispute_unlock_time < now` (buyer refund withdrawal).
    PastExternalDisputeUnlock,
}

/// What a lifecycle handler wants to drain.
#[derive(Copy, Clone, Debug)]
pub struct SelectorFilter {
    pub side: RequestSide,
    pub action: RequestedAction,
    pub state: StateFilter,
    /// Require `next_action.result_hash` to be present (submit result).
    pub requires_result_hash: bool,
    pub time_window: Option<TimeWindow>,
}

/// One leased unit of work.
#[derive(Clone, Debug)]
pub struct Batch {
    pub source: PaymentSource,
    pub wallet: HotWallet,
    pub request: EscrowRequest,
}

/// Atomically select up to `max_batches` eligible requests across all
/// active payment sources, leasing one wallet per request.
pub fn lock_and_query(
    data: &mut StoreData,
    filter: &SelectorFilter,
    now: TimestampMs,
    max_batches: usize,
) -> Result<Vec<Batch>, StoreError> {
    let mut batches = Vec::new();
    let mut claimed_requests = HashSet::new();

    let sources = data.find_payment_sources_active(now);
    'sources: for source in sources {
        let wallets = data
            .available_hot_wallets(source.id, filter.side.wallet_kind());

        for wallet in wallets {
            if batches.len() >= max_batches {
                break 'sources;
            }

            let Some(request) = find_eligible(
                data, &source, &wallet, filter, now, &claimed_requests,
            ) else {
                continue;
            };

            // Lease the wallet and pin it to the request in the same store
            // transaction that selected them.
            locker::acquire(data, wallet.id, now)?;
            let request_id = request.id;
            data.update_request(request_id, now, |r| {
                r.smart_contract_wallet_id = Some(wallet.id);
            })?;
            claimed_requests.insert(request_id);

            batches.push(Batch {
                source: source.clone(),
                wallet: data.get_hot_wallet(wallet.id)?.clone(),
                request: data.get_request(request_id)?.clone(),
            });
        }
    }

    Ok(batches)
}

fn find_eligible(
    data: &StoreData,
    source: &PaymentSource,
    wallet: &HotWallet,
    filter: &SelectorFilter,
    now: TimestampMs,
    claimed: &HashSet<escrow_core::ids::RequestId>,
) -> Option<EscrowRequest> {
    let cooldown_horizon =
        now.saturating_sub(Duration::from_millis(source.cooldown_ms));

    data.requests
        .values()
        .filter(|r| !claimed.contains(&r.id))
        .filter(|r| r.payment_source_id == source.id)
        .filter(|r| r.side == filter.side)
        .filter(|r| r.next_action.requested_action == filter.action)
        // Parked requests are invisible until the error is cleared.
        .filter(|r| r.next_action.error_type.is_none())
        .filter(|r| match filter.state {
            StateFilter::Absent => r.on_chain_state.is_none(),
            StateFilter::AnyOf(states) =>
                r.on_chain_state.is_some_and(|s| states.contains(&s)),
        })
        .filter(|r| {
            !filter.requires_result_hash
                || r.next_action.result_hash.is_some()
        })
        .filter(|r| match filter.time_window {
            None => true,
            Some(TimeWindow::PastUnlock) => r.times.unlock_time < now,
            Some(TimeWindow::PastExternalDisputeUnlock) =>
                r.times.external_dispute_unlock_time < now,
        })
        // The acting party must have waited out its cooldown (plus the
        // source cooldown again, absorbing chain latency).
        .filter(|r| r.cooldown_of(r.own_party()) < cooldown_horizon)
        // A request that already has a signing wallet stays pinned to it.
        .filter(|r| {
            r.smart_contract_wallet_id.is_none_or(|id| id == wallet.id)
        })
        .min_by_key(|r| r.created_at)
        .cloned()
}
