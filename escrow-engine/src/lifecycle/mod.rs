//! The lifecycle engine: one handler per requested action.
//!
//! Every handler shares the same shape. A tick atomically selects work via
//! the [`selector`](crate::selector) (leasing one wallet per request), then
//! processes the batches concurrently:
//!
//! 1. *Prepare* (retried on transient failures): validate invariants, locate
//!    and match the on-chain escrow UTXO, build the new datum, construct the
//!    transaction with two-pass budget estimation, and sign it.
//! 2. *Commit* (once): in a single serializable store transaction, flip the
//!    request to its `*Initiated` state, create the pending transaction
//!    record, attach it to the request and the leased wallet, and stamp the
//!    acting party's cooldown.
//! 3. *Submit* (retried on transient failures): hand the signed transaction
//!    to the chain and record its hash.
//!
//! A non-transient failure parks the request (`error_type` +
//! human-readable note) and releases the wallet lease; transient exhaustion
//! before the commit abandons the attempt for this tick, leaving the
//! request eligible for the next one.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use escrow_core::{
    action::{NextAction, RequestedAction, RequestErrorType},
    ids::{TransactionId, Vkey},
    model::{EscrowRequest, Party, TransactionRecord},
    seal::SealKey,
    state::{OnChainState, RequestSide, TxStatus, WalletKind},
    time::TimestampMs,
};
use escrow_chain::{
    client::{ChainClient, ChainError, Utxo},
    codec::{self, CooldownTimes, DatumState, EscrowDatum},
    slots::{self, ValidityWindow},
    txbuild::{SignedTx, TOTAL_COLLATERAL, TxBuildError},
    wallet::SignError,
};
use tracing::{info, instrument, warn};

use crate::{
    retry::{self, RetryClass},
    selector::{self, Batch, SelectorFilter, StateFilter, TimeWindow},
    store::{MemoryStore, StoreError},
};

mod collect;
mod funds;
mod refund;
mod result;

/// Engine-wide knobs, fixed at startup.
#[derive(Clone)]
pub struct EngineConfig {
    pub seal_key: SealKey,
    /// Pad added to party cooldowns on top of the source cooldown.
    pub cooldown_pad: Duration,
    /// Half-width of transaction validity windows.
    pub time_buffer: Duration,
    /// Bound on batches selected per tick.
    pub max_batch_size: usize,
}

/// The cloneable lifecycle engine. One instance drives all actions; the
/// scheduler invokes [`tick`](Self::tick) per action on its own cadence.
#[derive(Clone)]
pub struct LifecycleEngine {
    pub(crate) store: MemoryStore,
    pub(crate) chain: Arc<dyn ChainClient>,
    pub(crate) config: EngineConfig,
}

/// How a handler failed on one request.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying within this tick; abandoned after exhaustion.
    #[error("transient: {0:#}")]
    Transient(#[source] anyhow::Error),
    /// Park the request for manual intervention.
    #[error("park({0:?}): {1:#}")]
    Park(RequestErrorType, #[source] anyhow::Error),
}

impl RetryClass for HandlerError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict
            | StoreError::Timeout
            | StoreError::WalletBusy(_) => Self::Transient(e.into()),
            other => Self::Park(RequestErrorType::Unknown, other.into()),
        }
    }
}

impl From<ChainError> for HandlerError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::TransientNetwork(_) => Self::Transient(e.into()),
            ChainError::NotFound(_) =>
                Self::Park(RequestErrorType::UtxoNotFound, e.into()),
            ChainError::Invalid(_) | ChainError::Unknown(_) =>
                Self::Park(RequestErrorType::Unknown, e.into()),
        }
    }
}

impl From<TxBuildError> for HandlerError {
    fn from(e: TxBuildError) -> Self {
        match e {
            TxBuildError::InsufficientFunds
            | TxBuildError::InsufficientCollateral
            | TxBuildError::FeeExceedsInputs { .. } =>
                Self::Park(RequestErrorType::InsufficientFunds, e.into()),
            TxBuildError::Evaluation(_) => Self::Park(
                RequestErrorType::ScriptEvaluationFailed,
                e.into(),
            ),
            TxBuildError::Chain(ref inner)
                if inner.is_transient() =>
                Self::Transient(e.into()),
            other => Self::Park(RequestErrorType::Unknown, other.into()),
        }
    }
}

impl From<SignError> for HandlerError {
    fn from(e: SignError) -> Self {
        Self::Park(RequestErrorType::Unknown, e.into())
    }
}

/// The output of a handler's prepare stage, ready to commit and submit.
pub(crate) struct PreparedTx {
    pub signed: SignedTx,
    /// Which party's cooldown to stamp at commit, if any.
    pub cooldown_party: Option<Party>,
    /// Result hash to record on the request at commit (submit result).
    pub record_result_hash: Option<String>,
}

impl LifecycleEngine {
    pub fn new(
        store: MemoryStore,
        chain: Arc<dyn ChainClient>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            chain,
            config,
        }
    }

    /// Run one tick of the given `*Requested` action: select, lease, and
    /// process every eligible request.
    #[instrument(skip(self), name = "(lifecycle-tick)")]
    pub async fn tick(&self, action: RequestedAction) -> anyhow::Result<()> {
        let filter = filter_for(action)
            .with_context(|| format!("{action:?} has no handler"))?;
        let now = TimestampMs::now();
        let max_batches = self.config.max_batch_size;

        let batches = self
            .store
            .run_serializable(|data| {
                selector::lock_and_query(data, &filter, now, max_batches)
            })
            .await
            .context("Selector query failed")?;

        if batches.is_empty() {
            return Ok(());
        }
        info!("Processing {} request(s)", batches.len());

        // Each batch holds its own wallet lease, so they are independent.
        let jobs = batches
            .into_iter()
            .map(|batch| self.handle_batch(action, batch));
        futures::future::join_all(jobs).await;
        Ok(())
    }

    async fn handle_batch(&self, action: RequestedAction, batch: Batch) {
        let label: &'static str = action.into();
        let request_id = batch.request.id;

        let prepared =
            match retry::with_retries(label, || self.prepare(action, &batch))
                .await
            {
                Ok(prepared) => prepared,
                Err(HandlerError::Transient(e)) => {
                    warn!(
                        %request_id,
                        "{label}: abandoning until next tick: {e:#}"
                    );
                    self.abandon(&batch).await;
                    return;
                }
                Err(HandlerError::Park(error_type, e)) => {
                    self.park(&batch, error_type, &e).await;
                    return;
                }
            };

        let tx_id = match self.commit(action, &batch, &prepared).await {
            Ok(tx_id) => tx_id,
            Err(HandlerError::Transient(e)) => {
                warn!(%request_id, "{label}: commit failed: {e:#}");
                self.abandon(&batch).await;
                return;
            }
            Err(HandlerError::Park(error_type, e)) => {
                self.park(&batch, error_type, &e).await;
                return;
            }
        };

        let raw_tx = prepared.signed.to_bytes();
        let submitted = retry::with_retries(label, || async {
            self.chain.submit(&raw_tx).await.map_err(HandlerError::from)
        })
        .await;

        match submitted {
            Ok(tx_hash) => {
                debug_assert_eq!(tx_hash, prepared.signed.hash());
                let source_id = batch.source.id;
                let record = self
                    .store
                    .run_serializable(move |data| {
                        data.update_transaction(
                            tx_id,
                            source_id,
                            TimestampMs::now(),
                            |tx| tx.tx_hash = Some(tx_hash),
                        )
                    })
                    .await;
                if let Err(e) = record {
                    warn!(%request_id, "Could not record tx hash: {e:#}");
                }
                info!(%request_id, %tx_hash, "{label}: submitted");
            }
            Err(e) => {
                // The transaction record exists but never reached the
                // chain. Fail it, park the request, and free the wallet.
                let source_id = batch.source.id;
                let failed = self
                    .store
                    .run_serializable(move |data| {
                        data.update_transaction(
                            tx_id,
                            source_id,
                            TimestampMs::now(),
                            |tx| tx.status = TxStatus::Failed,
                        )
                    })
                    .await;
                if let Err(e) = failed {
                    warn!(%request_id, "Could not fail tx record: {e:#}");
                }
                let (error_type, source_err) = match e {
                    HandlerError::Transient(e) =>
                        (RequestErrorType::TxDropped, e),
                    HandlerError::Park(t, e) => (t, e),
                };
                self.park(&batch, error_type, &source_err).await;
            }
        }
    }

    async fn prepare(
        &self,
        action: RequestedAction,
        batch: &Batch,
    ) -> Result<PreparedTx, HandlerError> {
        match action {
            RequestedAction::FundsLockingRequested =>
                funds::prepare(self, batch).await,
            RequestedAction::SetRefundRequested =>
                refund::prepare_set(self, batch).await,
            RequestedAction::UnSetRefundRequested =>
                refund::prepare_unset(self, batch).await,
            RequestedAction::AuthorizeRefundRequested =>
                refund::prepare_authorize(self, batch).await,
            RequestedAction::SubmitResultRequested =>
                result::prepare(self, batch).await,
            RequestedAction::WithdrawRequested =>
                collect::prepare_withdraw(self, batch).await,
            RequestedAction::WithdrawRefundRequested =>
                collect::prepare_withdraw_refund(self, batch).await,
            other => Err(HandlerError::Park(
                RequestErrorType::InvalidState,
                anyhow!("{other:?} is not a handled action"),
            )),
        }
    }

    /// Stage 2: the single store transaction that makes the attempt
    /// durable. Returns the new pending transaction's id.
    async fn commit(
        &self,
        action: RequestedAction,
        batch: &Batch,
        prepared: &PreparedTx,
    ) -> Result<TransactionId, HandlerError> {
        let initiated = action.initiated().ok_or_else(|| {
            HandlerError::Park(
                RequestErrorType::InvalidState,
                anyhow!("{action:?} has no initiated state"),
            )
        })?;
        let request_id = batch.request.id;
        let wallet_id = batch.wallet.id;
        let source_cooldown_ms = batch.source.cooldown_ms;
        let cooldown_pad = self.config.cooldown_pad;
        let cooldown_party = prepared.cooldown_party;
        let record_result_hash = prepared.record_result_hash.clone();

        let tx_id = self
            .store
            .run_serializable(move |data| {
                let now = TimestampMs::now();

                let wallet = data.get_hot_wallet(wallet_id)?;
                if wallet.pending_transaction_id.is_some() {
                    return Err(StoreError::WalletBusy(wallet_id));
                }

                let tx_id = data.insert_transaction(TransactionRecord {
                    id: TransactionId(0),
                    tx_hash: None,
                    status: TxStatus::Pending,
                    blocks_wallet_id: Some(wallet_id),
                    created_at: now,
                    updated_at: now,
                });
                data.get_hot_wallet_mut(wallet_id)?
                    .pending_transaction_id = Some(tx_id);

                data.update_request(request_id, now, |request| {
                    if let Some(old_tx) = request.current_transaction_id {
                        request.transaction_history.push(old_tx);
                    }
                    request.current_transaction_id = Some(tx_id);
                    let result_hash =
                        request.next_action.result_hash.clone();
                    request.next_action = NextAction {
                        requested_action: initiated,
                        result_hash,
                        error_type: None,
                        error_note: None,
                    };
                    if let Some(hash) = &record_result_hash {
                        request.result_hash = Some(hash.clone());
                    }
                    if let Some(party) = cooldown_party {
                        request.set_cooldown(
                            party,
                            codec::new_cooldown_time(
                                now,
                                source_cooldown_ms,
                                cooldown_pad,
                            ),
                        );
                    }
                })?;
                Ok(tx_id)
            })
            .await?;
        Ok(tx_id)
    }

    /// Give the request back to the next tick: release the lease (nothing
    /// was committed) and leave the `*Requested` action in place.
    async fn abandon(&self, batch: &Batch) {
        let wallet_id = batch.wallet.id;
        let released = self
            .store
            .run_serializable(move |data| {
                crate::locker::release_if_settled(data, wallet_id)
            })
            .await;
        if let Err(e) = released {
            warn!(%wallet_id, "Could not release lease: {e:#}");
        }
    }

    /// Park the request for manual intervention and release the lease.
    async fn park(
        &self,
        batch: &Batch,
        error_type: RequestErrorType,
        source_err: &anyhow::Error,
    ) {
        let request_id = batch.request.id;
        let wallet_id = batch.wallet.id;
        let error_note = format!("{source_err:#}");
        warn!(%request_id, ?error_type, "Parking request: {error_note}");

        let parked = self
            .store
            .run_serializable(move |data| {
                data.update_request(request_id, TimestampMs::now(), |r| {
                    r.next_action =
                        NextAction::parked(error_type, error_note.clone());
                })?;
                crate::locker::release(data, wallet_id)?;
                Ok(())
            })
            .await;
        if let Err(e) = parked {
            warn!(%request_id, "Could not park request: {e:#}");
        }
    }

    // --- Shared prepare helpers --- //

    /// The validity window for a transaction built now.
    pub(crate) fn window(&self, batch: &Batch) -> ValidityWindow {
        slots::validity_window(
            batch.source.network,
            TimestampMs::now(),
            self.config.time_buffer,
        )
    }

    /// Fetch the signing wallet's UTXOs and split off a collateral UTXO
    /// (the smallest one able to cover the fixed total collateral).
    pub(crate) async fn wallet_and_collateral_utxos(
        &self,
        batch: &Batch,
    ) -> Result<(Vec<Utxo>, Utxo), HandlerError> {
        let utxos = self.chain.fetch_utxos(&batch.wallet.address).await?;
        let collateral = utxos
            .iter()
            .filter(|u| u.datum.is_none())
            .filter(|u| u.lovelace() >= TOTAL_COLLATERAL)
            .min_by_key(|u| u.lovelace().to_i64())
            .cloned()
            .ok_or_else(|| {
                HandlerError::Park(
                    RequestErrorType::InsufficientFunds,
                    anyhow!("no UTXO can cover the total collateral"),
                )
            })?;
        let fee_utxos = utxos
            .into_iter()
            .filter(|u| u.outpoint != collateral.outpoint)
            .collect();
        Ok((fee_utxos, collateral))
    }

    /// Resolve the buyer and seller verification keys for a request: the
    /// request's own side uses the leased hot wallet, the counterparty
    /// comes from its stored wallet descriptor.
    pub(crate) async fn party_vkeys(
        &self,
        batch: &Batch,
    ) -> Result<(Vkey, Vkey), HandlerError> {
        let own_vkey = batch.wallet.vkey;
        let counterparty_id = match batch.request.side {
            RequestSide::Purchase => batch.request.seller_wallet_id,
            RequestSide::Payment => batch.request.buyer_wallet_id,
        }
        .ok_or_else(|| {
            HandlerError::Park(
                RequestErrorType::InvalidState,
                anyhow!("request has no counterparty wallet attached"),
            )
        })?;

        let counterparty_vkey = self
            .store
            .run_serializable(move |data| {
                Ok(data.get_wallet_base(counterparty_id)?.vkey)
            })
            .await?;

        Ok(match batch.request.side {
            RequestSide::Purchase => (own_vkey, counterparty_vkey),
            RequestSide::Payment => (counterparty_vkey, own_vkey),
        })
    }

    /// Locate the escrow UTXO for this request at the script address and
    /// require its decoded state to be one of `allowed_states`.
    ///
    /// Every identity field of the datum must match the request exactly; a
    /// UTXO carrying the same blockchain identifier but any mismatched
    /// field belongs to a different request (e.g. a double-submit race) and
    /// must not be spent.
    pub(crate) async fn find_escrow_utxo(
        &self,
        batch: &Batch,
        buyer_vkey: Vkey,
        seller_vkey: Vkey,
        allowed_states: &[OnChainState],
    ) -> Result<(Utxo, EscrowDatum), HandlerError> {
        let utxos = self
            .chain
            .fetch_utxos(&batch.source.contract_address)
            .await?;

        let mut identifier_seen = false;
        for utxo in utxos {
            let Some(datum) = utxo
                .datum
                .as_ref()
                .and_then(EscrowDatum::from_plutus)
            else {
                continue;
            };
            if datum.blockchain_identifier
                != batch.request.blockchain_identifier
            {
                continue;
            }
            identifier_seen = true;
            if !datum_matches_request(
                &datum,
                &batch.request,
                buyer_vkey,
                seller_vkey,
            ) {
                continue;
            }
            let state = datum.state.to_on_chain_state();
            if !allowed_states.contains(&state) {
                return Err(HandlerError::Park(
                    RequestErrorType::InvalidState,
                    anyhow!(
                        "escrow UTXO is in state {state:?}, handler \
                         requires one of {allowed_states:?}"
                    ),
                ));
            }
            return Ok((utxo, datum));
        }

        if identifier_seen {
            Err(HandlerError::Park(
                RequestErrorType::DatumMismatch,
                anyhow!(
                    "a UTXO carries this blockchain identifier but its \
                     datum does not match the request"
                ),
            ))
        } else {
            Err(HandlerError::Park(
                RequestErrorType::UtxoNotFound,
                anyhow!("no escrow UTXO found for this request"),
            ))
        }
    }

    /// The collection address of the batch's payment source.
    pub(crate) async fn collection_address(
        &self,
        batch: &Batch,
    ) -> Result<escrow_core::ids::Address, HandlerError> {
        let source_id = batch.source.id;
        Ok(self
            .store
            .run_serializable(move |data| {
                Ok(data
                    .any_hot_wallet_of_kind(source_id, WalletKind::Collection)?
                    .address)
            })
            .await?)
    }

    /// The new cooldown record for an action by `acting_party`: the actor's
    /// cooldown advances, the counterparty's resets to zero.
    pub(crate) fn next_cooldowns(
        &self,
        batch: &Batch,
        acting_party: Party,
    ) -> CooldownTimes {
        let stamped = codec::new_cooldown_time(
            TimestampMs::now(),
            batch.source.cooldown_ms,
            self.config.cooldown_pad,
        );
        match acting_party {
            Party::Buyer => CooldownTimes {
                buyer: stamped,
                seller: TimestampMs::MIN,
            },
            Party::Seller => CooldownTimes {
                seller: stamped,
                buyer: TimestampMs::MIN,
            },
        }
    }
}

/// Compare a decoded datum against the request's identity fields
/// (verification keys, identifier, input hash, all four deadlines, and the
/// collateral return).
pub(crate) fn datum_matches_request(
    datum: &EscrowDatum,
    request: &EscrowRequest,
    buyer_vkey: Vkey,
    seller_vkey: Vkey,
) -> bool {
    datum.buyer_vkey == buyer_vkey
        && datum.seller_vkey == seller_vkey
        && datum.blockchain_identifier == request.blockchain_identifier
        && datum.input_hash == request.input_hash
        && datum.pay_by_time == request.times.pay_by_time
        && datum.submit_result_time == request.times.submit_result_time
        && datum.unlock_time == request.times.unlock_time
        && datum.external_dispute_unlock_time
            == request.times.external_dispute_unlock_time
        && datum.collateral_return_lovelace
            == request.collateral_return_lovelace
}

/// Map a datum state transition for refund-family actions.
pub(crate) fn refund_transition(
    from: DatumState,
    set: bool,
) -> Option<DatumState> {
    match (from, set) {
        (DatumState::FundsLocked, true) => Some(DatumState::RefundRequested),
        (DatumState::ResultSubmitted, true) => Some(DatumState::Disputed),
        (DatumState::RefundRequested, false) => Some(DatumState::FundsLocked),
        (DatumState::Disputed, false) => Some(DatumState::ResultSubmitted),
        _ => None,
    }
}

/// The selector filter implementing each handler's eligibility row.
pub(crate) fn filter_for(
    action: RequestedAction,
) -> Option<SelectorFilter> {
    use OnChainState::*;
    let filter = match action {
        RequestedAction::FundsLockingRequested => SelectorFilter {
            side: RequestSide::Purchase,
            action,
            state: StateFilter::Absent,
            requires_result_hash: false,
            time_window: None,
        },
        RequestedAction::SetRefundRequested => SelectorFilter {
            side: RequestSide::Purchase,
            action,
            state: StateFilter::AnyOf(&[FundsLocked, ResultSubmitted]),
            requires_result_hash: false,
            time_window: None,
        },
        RequestedAction::UnSetRefundRequested => SelectorFilter {
            side: RequestSide::Purchase,
            action,
            state: StateFilter::AnyOf(&[RefundRequested, Disputed]),
            requires_result_hash: false,
            time_window: None,
        },
        RequestedAction::SubmitResultRequested => SelectorFilter {
            side: RequestSide::Payment,
            action,
            state: StateFilter::AnyOf(&[FundsLocked, RefundRequested]),
            requires_result_hash: true,
            time_window: None,
        },
        RequestedAction::AuthorizeRefundRequested => SelectorFilter {
            side: RequestSide::Payment,
            action,
            state: StateFilter::AnyOf(&[RefundRequested, Disputed]),
            requires_result_hash: false,
            time_window: None,
        },
        RequestedAction::WithdrawRequested => SelectorFilter {
            side: RequestSide::Payment,
            action,
            state: StateFilter::AnyOf(&[ResultSubmitted]),
            requires_result_hash: false,
            time_window: Some(TimeWindow::PastUnlock),
        },
        RequestedAction::WithdrawRefundRequested => SelectorFilter {
            side: RequestSide::Purchase,
            action,
            state: StateFilter::AnyOf(&[RefundRequested]),
            requires_result_hash: false,
            time_window: Some(TimeWindow::PastExternalDisputeUnlock),
        },
        _ => return None,
    };
    Some(filter)
}

/// All actions the scheduler drives through [`LifecycleEngine::tick`].
pub const HANDLED_ACTIONS: [RequestedAction; 7] = [
    RequestedAction::FundsLockingRequested,
    RequestedAction::SetRefundRequested,
    RequestedAction::UnSetRefundRequested,
    RequestedAction::SubmitResultRequested,
    RequestedAction::AuthorizeRefundRequested,
    RequestedAction::WithdrawRequested,
    RequestedAction::WithdrawRefundRequested,
];
