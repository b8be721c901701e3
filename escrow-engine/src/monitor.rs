//! On-chain reconciliation.
//!
//! The monitor is the only component that moves a request forward on the
//! strength of *observed* chain state: it confirms pending transactions
//! (releasing wallet leases), reconciles each request's `on_chain_state`
//! with the decoded escrow UTXOs at the script address, derives the next
//! internally driven action when a time window is crossed, and parks
//! requests whose transaction vanished from the chain.
//!
//! "Confirmed but the UTXO is already consumed" is distinguished from
//! "confirmed and still present": for an interaction transaction whose
//! output no longer sits at the script address, the monitor reads the
//! transaction's own outputs; for a withdrawal-family transaction the
//! consumed UTXO *is* the expected outcome and the request goes terminal.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use escrow_core::{
    action::{NextAction, RequestedAction, RequestErrorType},
    ids::{RequestId, TxHash},
    model::{EscrowRequest, PaymentSource},
    state::{OnChainState, RequestSide, TxStatus},
    time::TimestampMs,
};
use escrow_chain::{
    client::{ChainClient, Utxo},
    codec::EscrowDatum,
};
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use crate::{
    lifecycle::datum_matches_request,
    locker,
    store::{MemoryStore, StoreData, StoreError},
};

/// Wakes the chain monitor outside its regular cadence.
///
/// Intents whose effect should be observed promptly (an operator clearing a
/// parked request) nudge here instead of waiting out the monitor interval.
/// Nudges coalesce: any number of nudges between two monitor passes trigger
/// exactly one extra pass, backed by the single stored permit of
/// [`tokio::sync::Notify`].
#[derive(Clone, Default)]
pub struct MonitorNudge(Arc<Notify>);

impl MonitorNudge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a prompt monitor pass.
    pub fn nudge(&self) {
        self.0.notify_one();
    }

    /// Wait for the next nudge.
    pub(crate) async fn nudged(&self) {
        self.0.notified().await;
    }
}

/// Periodic on-chain reconciliation job.
#[derive(Clone)]
pub struct ChainMonitor {
    store: MemoryStore,
    chain: Arc<dyn ChainClient>,
    /// Age past which a pending transaction with no on-chain trace parks
    /// its request with `TxDropped`.
    tx_stuck: Duration,
}

/// What the monitor learned about one pending transaction, gathered from
/// the chain before the store transaction applies it.
struct TxObservation {
    request_id: RequestId,
    tx_hash: TxHash,
    outcome: TxOutcome,
}

enum TxOutcome {
    /// Confirmed; the escrow UTXO (from the address scan or the
    /// transaction's own outputs) decodes to this state.
    ConfirmedWithState(OnChainState),
    /// Confirmed and the escrow UTXO is gone: a withdrawal-family
    /// transaction reached its terminal state.
    ConfirmedConsumed,
    /// Not on-chain and past the stuck threshold.
    Dropped,
    /// Not on-chain yet, still within the threshold.
    StillPending,
}

impl ChainMonitor {
    pub fn new(
        store: MemoryStore,
        chain: Arc<dyn ChainClient>,
        tx_stuck: Duration,
    ) -> Self {
        Self {
            store,
            chain,
            tx_stuck,
        }
    }

    /// One reconciliation pass over every active payment source.
    #[instrument(skip(self), name = "(chain-monitor)")]
    pub async fn tick(&self) -> anyhow::Result<()> {
        let now = TimestampMs::now();
        let sources = self
            .store
            .run_serializable(move |data| {
                Ok(data.find_payment_sources_active(now))
            })
            .await
            .context("Could not list active sources")?;

        for source in sources {
            if let Err(e) = self.reconcile_source(&source).await {
                warn!(
                    source_id = %source.id,
                    "Source reconciliation failed: {e:#}"
                );
            }
        }
        Ok(())
    }

    async fn reconcile_source(
        &self,
        source: &PaymentSource,
    ) -> anyhow::Result<()> {
        let now = TimestampMs::now();

        // Decode every escrow UTXO currently at the script address.
        // Undecodable datums are foreign and ignored (datum tampering or
        // unrelated UTXOs must not affect request state).
        let decoded: Vec<(Utxo, EscrowDatum)> = self
            .chain
            .fetch_utxos(&source.contract_address)
            .await
            .context("Could not fetch script UTXOs")?
            .into_iter()
            .filter_map(|utxo| {
                let datum =
                    utxo.datum.as_ref().and_then(EscrowDatum::from_plutus)?;
                Some((utxo, datum))
            })
            .collect();

        // Gather chain-side facts about pending transactions first; the
        // store transaction below must not suspend.
        let source_id = source.id;
        let pending = self
            .store
            .run_serializable(move |data| {
                Ok(data.requests_with_pending_tx(source_id))
            })
            .await?;

        let mut observations = Vec::with_capacity(pending.len());
        for request in &pending {
            match self.observe(request, &decoded, now).await {
                Ok(Some(observation)) => observations.push(observation),
                Ok(None) => (),
                Err(e) => warn!(
                    request_id = %request.id,
                    "Could not observe pending tx: {e:#}"
                ),
            }
        }

        // Apply everything for this source in one serializable write.
        let source = source.clone();
        self.store
            .run_serializable(move |data| {
                for observation in &observations {
                    apply_observation(data, &source, observation, now)?;
                }
                reconcile_waiting(data, &source, &decoded, now)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Chain-side half of confirmation handling for one request.
    async fn observe(
        &self,
        request: &EscrowRequest,
        decoded: &[(Utxo, EscrowDatum)],
        now: TimestampMs,
    ) -> anyhow::Result<Option<TxObservation>> {
        let request_id = request.id;
        let pending_tx = self
            .store
            .run_serializable(move |data| {
                let request = data.get_request(request_id)?;
                let Some(tx_id) = request.current_transaction_id else {
                    return Ok(None);
                };
                let tx = data.get_transaction(tx_id)?;
                Ok(tx.tx_hash.map(|hash| (hash, tx.created_at)))
            })
            .await?;
        let Some((tx_hash, created_at)) = pending_tx else {
            return Ok(None);
        };

        if self.chain.tx_confirmed(&tx_hash).await?.is_none() {
            let outcome = if now.duration_since(created_at) > self.tx_stuck {
                TxOutcome::Dropped
            } else {
                TxOutcome::StillPending
            };
            return Ok(Some(TxObservation {
                request_id,
                tx_hash,
                outcome,
            }));
        }

        // Confirmed. Prefer the escrow UTXO this transaction produced: from
        // the address scan if still unspent, else from the transaction's
        // own outputs (present-but-consumed distinction).
        let state = match find_state_for(request, decoded) {
            Some(state) => Some(state),
            None => {
                let outputs = self
                    .chain
                    .fetch_utxos_of_tx(&tx_hash)
                    .await
                    .context("Could not fetch confirmed tx outputs")?;
                outputs
                    .iter()
                    .filter_map(|utxo| {
                        utxo.datum.as_ref().and_then(EscrowDatum::from_plutus)
                    })
                    .find(|datum| {
                        datum.blockchain_identifier
                            == request.blockchain_identifier
                    })
                    .map(|datum| datum.state.to_on_chain_state())
            }
        };

        let outcome = match state {
            Some(state) => TxOutcome::ConfirmedWithState(state),
            None => TxOutcome::ConfirmedConsumed,
        };
        Ok(Some(TxObservation {
            request_id: request.id,
            tx_hash,
            outcome,
        }))
    }
}

/// Store-side half of confirmation handling.
fn apply_observation(
    data: &mut StoreData,
    source: &PaymentSource,
    observation: &TxObservation,
    now: TimestampMs,
) -> Result<(), StoreError> {
    let request = data.get_request(observation.request_id)?.clone();
    let Some(tx_id) = request.current_transaction_id else {
        return Ok(());
    };
    let wallet_id = request.smart_contract_wallet_id;

    match &observation.outcome {
        TxOutcome::StillPending => Ok(()),
        TxOutcome::Dropped => {
            warn!(
                request_id = %request.id,
                tx_hash = %observation.tx_hash,
                "Transaction dropped from the chain; parking request"
            );
            data.update_transaction(tx_id, source.id, now, |tx| {
                tx.status = TxStatus::Failed;
            })?;
            data.update_request(request.id, now, |r| {
                r.next_action = NextAction::parked(
                    RequestErrorType::TxDropped,
                    format!(
                        "transaction {} was not confirmed within the stuck \
                         threshold",
                        observation.tx_hash,
                    ),
                );
            })?;
            if let Some(wallet_id) = wallet_id {
                locker::release(data, wallet_id)?;
            }
            Ok(())
        }
        TxOutcome::ConfirmedWithState(state) => {
            data.update_transaction(tx_id, source.id, now, |tx| {
                tx.status = TxStatus::Confirmed;
            })?;
            if let Some(wallet_id) = wallet_id {
                locker::release_if_settled(data, wallet_id)?;
            }
            let next = derive_next_action(request.side, *state, &request, now);
            info!(
                request_id = %request.id,
                ?state,
                ?next,
                "Transaction confirmed"
            );
            data.update_request(request.id, now, |r| {
                r.on_chain_state = Some(*state);
                // Do not clobber a `*Requested` action an intent set while
                // this transaction was in flight.
                let action = r.next_action.requested_action;
                if action.is_initiated()
                    || action == RequestedAction::WaitingForExternalAction
                {
                    r.next_action = NextAction::new(next);
                }
            })
        }
        TxOutcome::ConfirmedConsumed => {
            data.update_transaction(tx_id, source.id, now, |tx| {
                tx.status = TxStatus::Confirmed;
            })?;
            if let Some(wallet_id) = wallet_id {
                locker::release_if_settled(data, wallet_id)?;
            }
            let terminal = terminal_state_for(&request);
            info!(
                request_id = %request.id,
                ?terminal,
                "Withdrawal confirmed; escrow UTXO consumed"
            );
            data.update_request(request.id, now, |r| {
                r.on_chain_state = terminal.or(r.on_chain_state);
                r.next_action = NextAction::new(match terminal {
                    Some(_) => RequestedAction::None,
                    // Consumed but we cannot name the terminal state: leave
                    // it for withdrawal bookkeeping by an operator.
                    None => RequestedAction::WaitingForManualAction,
                });
            })
        }
    }
}

/// Reconcile requests that wait on the counterparty: their state can change
/// under us via transactions submitted by the other side's deployment.
fn reconcile_waiting(
    data: &mut StoreData,
    source: &PaymentSource,
    decoded: &[(Utxo, EscrowDatum)],
    now: TimestampMs,
) -> Result<(), StoreError> {
    let waiting = data.requests_awaiting_external(source.id);
    for request in waiting {
        let observed = find_state_for(&request, decoded);

        let (new_state, next) = match observed {
            Some(state) => (
                Some(state),
                derive_next_action(request.side, state, &request, now),
            ),
            None => match request.on_chain_state {
                // Nothing on-chain yet (e.g. payment side waiting for the
                // buyer's lock): keep waiting.
                None => continue,
                // The UTXO disappeared without a transaction of ours: the
                // counterparty withdrew. Infer the terminal state from the
                // last known one.
                Some(state) => {
                    let terminal = counterparty_terminal(request.side, state);
                    (Some(terminal), RequestedAction::None)
                }
            },
        };

        let state_changed = new_state != request.on_chain_state;
        let action_changed =
            next != request.next_action.requested_action;
        if state_changed || action_changed {
            info!(
                request_id = %request.id,
                ?new_state,
                ?next,
                "Reconciled from chain"
            );
            data.update_request(request.id, now, |r| {
                if let Some(state) = new_state {
                    r.on_chain_state = Some(state);
                }
                r.next_action = NextAction::new(next);
            })?;
        }
    }
    Ok(())
}

/// Find the decoded escrow UTXO belonging to `request`, matching every
/// identity field of the datum.
fn find_state_for(
    request: &EscrowRequest,
    decoded: &[(Utxo, EscrowDatum)],
) -> Option<OnChainState> {
    decoded
        .iter()
        .find(|(_, datum)| {
            datum.blockchain_identifier == request.blockchain_identifier
                && datum_matches_request(
                    datum,
                    request,
                    datum.buyer_vkey,
                    datum.seller_vkey,
                )
        })
        .map(|(_, datum)| datum.state.to_on_chain_state())
}

/// The next internally driven action implied by an observed state and the
/// time windows crossed.
pub(crate) fn derive_next_action(
    side: RequestSide,
    state: OnChainState,
    request: &EscrowRequest,
    now: TimestampMs,
) -> RequestedAction {
    if state.is_terminal() {
        return RequestedAction::None;
    }
    match (side, state) {
        (RequestSide::Payment, OnChainState::ResultSubmitted)
            if request.times.unlock_time < now =>
            RequestedAction::WithdrawRequested,
        (RequestSide::Purchase, OnChainState::RefundRequested)
            if request.times.external_dispute_unlock_time < now =>
            RequestedAction::WithdrawRefundRequested,
        _ => RequestedAction::WaitingForExternalAction,
    }
}

/// Terminal state reached when our own withdrawal-family transaction
/// consumed the escrow UTXO.
fn terminal_state_for(request: &EscrowRequest) -> Option<OnChainState> {
    match request.next_action.requested_action {
        RequestedAction::WithdrawInitiated => Some(OnChainState::Withdrawn),
        RequestedAction::WithdrawRefundInitiated =>
            Some(OnChainState::RefundWithdrawn),
        RequestedAction::AuthorizeRefundInitiated =>
            match request.on_chain_state {
                Some(OnChainState::Disputed) =>
                    Some(OnChainState::DisputedWithdrawn),
                _ => Some(OnChainState::RefundWithdrawn),
            },
        _ => None,
    }
}

/// Terminal state when the *counterparty* consumed the escrow UTXO while we
/// were waiting.
fn counterparty_terminal(
    side: RequestSide,
    last_state: OnChainState,
) -> OnChainState {
    match (side, last_state) {
        // An undisputed result was withdrawn by the seller.
        (_, OnChainState::ResultSubmitted) => OnChainState::Withdrawn,
        // A refund was resolved, by authorization or timeout.
        (_, OnChainState::Disputed) => OnChainState::DisputedWithdrawn,
        (_, OnChainState::RefundRequested) => OnChainState::RefundWithdrawn,
        // FundsLocked disappearing without a state transition cannot be
        // attributed; report the generic terminal.
        _ => OnChainState::Withdrawn,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derive_respects_time_windows() {
        let request = crate::testing::fixtures::request_template(
            RequestSide::Payment,
            "bi-derive",
        );
        let before = request.times.unlock_time;
        let after = request
            .times
            .unlock_time
            .saturating_add(Duration::from_secs(1));

        assert_eq!(
            derive_next_action(
                RequestSide::Payment,
                OnChainState::ResultSubmitted,
                &request,
                before,
            ),
            RequestedAction::WaitingForExternalAction
        );
        assert_eq!(
            derive_next_action(
                RequestSide::Payment,
                OnChainState::ResultSubmitted,
                &request,
                after,
            ),
            RequestedAction::WithdrawRequested
        );
        assert_eq!(
            derive_next_action(
                RequestSide::Purchase,
                OnChainState::RefundRequested,
                &request,
                request
                    .times
                    .external_dispute_unlock_time
                    .saturating_add(Duration::from_secs(1)),
            ),
            RequestedAction::WithdrawRefundRequested
        );
        assert_eq!(
            derive_next_action(
                RequestSide::Purchase,
                OnChainState::Withdrawn,
                &request,
                after,
            ),
            RequestedAction::None
        );
    }
}
