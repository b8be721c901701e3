//! The typed in-process API external surfaces (HTTP admin, tests) call
//! into. Each intent validates its preconditions inside one serializable
//! store transaction and flips the request's `NextAction` to the matching
//! `*Requested` value, or fails with a typed error; the engine never
//! silently discards work.

use escrow_core::{
    action::{NextAction, RequestedAction},
    amount::{Amount, Funds},
    ids::{
        Address, BlockchainIdentifier, PaymentSourceId, RequestId, Vkey,
        WalletId,
    },
    model::{EscrowRequest, RequestTimes, WalletBase},
    rng::{Crng, SysRng},
    state::{OnChainState, RequestSide, WalletKind},
    time::TimestampMs,
};
use thiserror::Error;
use tracing::info;

use crate::{
    locker,
    monitor::MonitorNudge,
    store::{MemoryStore, StoreError},
};

#[derive(Debug, Error)]
pub enum IntentError {
    #[error("request {0} not found")]
    NotFound(RequestId),
    #[error("request {0} is a {1:?} request; this intent targets the other side")]
    WrongSide(RequestId, RequestSide),
    #[error("request {0} does not admit this intent: {1}")]
    InvalidState(RequestId, String),
    #[error("request {0} is parked; clear its error first")]
    Parked(RequestId),
    #[error("invalid intent: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parameters for [`Intents::create_payment`].
pub struct CreatePayment {
    pub payment_source_id: PaymentSourceId,
    pub times: RequestTimes,
    pub requested_funds: Funds,
    pub collateral_return_lovelace: Amount,
    pub input_hash: String,
    pub metadata: Option<String>,
    /// The buyer's wallet, as reported by the purchasing deployment.
    pub buyer_vkey: Vkey,
    pub buyer_address: Address,
}

/// Parameters for [`Intents::create_purchase`].
pub struct CreatePurchase {
    pub payment_source_id: PaymentSourceId,
    /// The identifier minted by the seller side's `create_payment`.
    pub blockchain_identifier: BlockchainIdentifier,
    pub times: RequestTimes,
    pub paid_funds: Funds,
    pub collateral_return_lovelace: Amount,
    pub input_hash: String,
    pub metadata: Option<String>,
    /// The seller's wallet, as quoted by the selling deployment.
    pub seller_vkey: Vkey,
    pub seller_address: Address,
}

/// The intent API. Cloneable; all clones share the store.
#[derive(Clone)]
pub struct Intents {
    store: MemoryStore,
    /// Nudges the chain monitor after intents whose effect should be
    /// observed promptly.
    monitor_nudge: MonitorNudge,
}

impl Intents {
    pub fn new(store: MemoryStore, monitor_nudge: MonitorNudge) -> Self {
        Self {
            store,
            monitor_nudge,
        }
    }

    /// Create a seller-side payment request, minting the blockchain
    /// identifier its purchase must reference.
    pub async fn create_payment(
        &self,
        params: CreatePayment,
    ) -> Result<(RequestId, BlockchainIdentifier), IntentError> {
        let identifier = mint_identifier(&mut SysRng::new());
        let identifier2 = identifier.clone();

        let request_id = self
            .store
            .run_serializable(move |data| {
                let now = TimestampMs::now();
                validate_times(&params.times, now)
                    .map_err(StoreError::Invalid)?;
                data.get_payment_source(params.payment_source_id)?;

                let buyer_wallet_id = data.upsert_wallet_base(WalletBase {
                    id: WalletId(0),
                    payment_source_id: params.payment_source_id,
                    address: params.buyer_address.clone(),
                    vkey: params.buyer_vkey,
                    kind: WalletKind::Purchasing,
                })?;

                let mut request = new_request(
                    RequestSide::Payment,
                    params.payment_source_id,
                    identifier2.clone(),
                    params.times,
                    params.requested_funds.clone(),
                    params.collateral_return_lovelace,
                    params.input_hash.clone(),
                    params.metadata.clone(),
                    now,
                );
                request.buyer_wallet_id = Some(buyer_wallet_id);
                request.next_action = NextAction::new(
                    RequestedAction::WaitingForExternalAction,
                );
                data.insert_request(request)
            })
            .await?;

        info!(%request_id, %identifier, "Created payment request");
        Ok((request_id, identifier))
    }

    /// Create a buyer-side purchase request; the funds-locking handler
    /// picks it up on its next tick.
    pub async fn create_purchase(
        &self,
        params: CreatePurchase,
    ) -> Result<RequestId, IntentError> {
        let request_id = self
            .store
            .run_serializable(move |data| {
                let now = TimestampMs::now();
                validate_times(&params.times, now)
                    .map_err(StoreError::Invalid)?;
                data.get_payment_source(params.payment_source_id)?;

                let seller_wallet_id = data.upsert_wallet_base(WalletBase {
                    id: WalletId(0),
                    payment_source_id: params.payment_source_id,
                    address: params.seller_address.clone(),
                    vkey: params.seller_vkey,
                    kind: WalletKind::Selling,
                })?;

                let mut request = new_request(
                    RequestSide::Purchase,
                    params.payment_source_id,
                    params.blockchain_identifier.clone(),
                    params.times,
                    params.paid_funds.clone(),
                    params.collateral_return_lovelace,
                    params.input_hash.clone(),
                    params.metadata.clone(),
                    now,
                );
                request.seller_wallet_id = Some(seller_wallet_id);
                request.next_action =
                    NextAction::new(RequestedAction::FundsLockingRequested);
                data.insert_request(request)
            })
            .await?;

        info!(%request_id, "Created purchase request");
        Ok(request_id)
    }

    /// Buyer asks for a refund.
    pub async fn request_refund(
        &self,
        request_id: RequestId,
    ) -> Result<(), IntentError> {
        self.flip(
            request_id,
            RequestSide::Purchase,
            &[OnChainState::FundsLocked, OnChainState::ResultSubmitted],
            RequestedAction::SetRefundRequested,
            |request, now| {
                if request.times.external_dispute_unlock_time < now {
                    return Err(
                        "the dispute window has already closed".to_owned()
                    );
                }
                Ok(())
            },
        )
        .await
    }

    /// Buyer cancels a previously requested refund.
    pub async fn cancel_refund(
        &self,
        request_id: RequestId,
    ) -> Result<(), IntentError> {
        self.flip(
            request_id,
            RequestSide::Purchase,
            &[OnChainState::RefundRequested, OnChainState::Disputed],
            RequestedAction::UnSetRefundRequested,
            |_, _| Ok(()),
        )
        .await
    }

    /// Seller submits the result hash.
    pub async fn submit_result(
        &self,
        request_id: RequestId,
        result_hash: String,
    ) -> Result<(), IntentError> {
        if result_hash.is_empty() {
            return Err(IntentError::Invalid(
                "result hash must not be empty".to_owned(),
            ));
        }
        let hash = result_hash.clone();
        self.flip(
            request_id,
            RequestSide::Payment,
            &[OnChainState::FundsLocked, OnChainState::RefundRequested],
            RequestedAction::SubmitResultRequested,
            move |request, now| {
                if request.times.submit_result_time < now {
                    return Err(
                        "the result submission window has elapsed".to_owned()
                    );
                }
                Ok(())
            },
        )
        .await?;

        // Attach the hash the handler will embed in the datum.
        self.store
            .run_serializable(move |data| {
                data.update_request(request_id, TimestampMs::now(), |r| {
                    r.next_action.result_hash = Some(hash.clone());
                })
            })
            .await?;
        Ok(())
    }

    /// Seller authorizes the buyer's refund.
    pub async fn authorize_refund(
        &self,
        request_id: RequestId,
    ) -> Result<(), IntentError> {
        self.flip(
            request_id,
            RequestSide::Payment,
            &[OnChainState::RefundRequested, OnChainState::Disputed],
            RequestedAction::AuthorizeRefundRequested,
            |_, _| Ok(()),
        )
        .await
    }

    /// Operator clears a parked request; it re-enters the pipeline as
    /// waiting, and the monitor re-derives its real next action.
    pub async fn clear_error(
        &self,
        request_id: RequestId,
    ) -> Result<(), IntentError> {
        self.store
            .run_serializable(move |data| {
                let request = data.get_request(request_id)?;
                if !request.next_action.is_parked() {
                    return Err(StoreError::Invalid(
                        "request is not parked".to_owned(),
                    ));
                }
                data.update_request(request_id, TimestampMs::now(), |r| {
                    r.next_action = NextAction::new(
                        RequestedAction::WaitingForExternalAction,
                    );
                })
            })
            .await?;
        self.monitor_nudge.nudge();
        info!(%request_id, "Cleared error; request re-entered the pipeline");
        Ok(())
    }

    /// Buyer withdraws a purchase that has not locked funds yet.
    pub async fn cancel_request(
        &self,
        request_id: RequestId,
    ) -> Result<(), IntentError> {
        self.store
            .run_serializable(move |data| {
                let request = data.get_request(request_id)?.clone();
                if request.side != RequestSide::Purchase {
                    return Err(StoreError::Invalid(
                        "only purchases can be cancelled".to_owned(),
                    ));
                }
                if request.next_action.requested_action
                    != RequestedAction::FundsLockingRequested
                    || request.on_chain_state.is_some()
                {
                    return Err(StoreError::Invalid(
                        "purchase has already locked funds".to_owned(),
                    ));
                }
                data.update_request(request_id, TimestampMs::now(), |r| {
                    r.next_action = NextAction::new(RequestedAction::None);
                })?;
                if let Some(wallet_id) = request.smart_contract_wallet_id {
                    locker::release_if_settled(data, wallet_id)?;
                }
                Ok(())
            })
            .await?;
        info!(%request_id, "Cancelled purchase before lock");
        Ok(())
    }

    /// Shared body of the four state-flip intents.
    async fn flip(
        &self,
        request_id: RequestId,
        side: RequestSide,
        allowed_states: &'static [OnChainState],
        action: RequestedAction,
        extra_check: impl FnOnce(&EscrowRequest, TimestampMs) -> Result<(), String>
        + Send
        + 'static,
    ) -> Result<(), IntentError> {
        let result = self
            .store
            .run_serializable(move |data| {
                let now = TimestampMs::now();
                let request = match data.get_request(request_id) {
                    Ok(r) => r.clone(),
                    Err(_) => return Ok(Err(IntentError::NotFound(request_id))),
                };
                if request.side != side {
                    return Ok(Err(IntentError::WrongSide(
                        request_id,
                        request.side,
                    )));
                }
                if request.next_action.is_parked() {
                    return Ok(Err(IntentError::Parked(request_id)));
                }
                let state_ok = request
                    .on_chain_state
                    .is_some_and(|s| allowed_states.contains(&s));
                if !state_ok {
                    return Ok(Err(IntentError::InvalidState(
                        request_id,
                        format!(
                            "on-chain state is {:?}, needs one of \
                             {allowed_states:?}",
                            request.on_chain_state,
                        ),
                    )));
                }
                if let Err(msg) = extra_check(&request, now) {
                    return Ok(Err(IntentError::InvalidState(
                        request_id, msg,
                    )));
                }

                data.update_request(request_id, now, |r| {
                    r.next_action = NextAction::new(action);
                })?;
                Ok(Ok(()))
            })
            .await?;
        result
    }
}

fn mint_identifier(rng: &mut impl Crng) -> BlockchainIdentifier {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    BlockchainIdentifier::new(format!("bi-{}", escrow_hex::encode(&bytes)))
        .expect("35 ASCII chars is a valid identifier")
}

fn validate_times(
    times: &RequestTimes,
    now: TimestampMs,
) -> Result<(), String> {
    times.validate().map_err(|e| e.to_string())?;
    if times.pay_by_time <= now {
        return Err("pay-by time must be in the future".to_owned());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn new_request(
    side: RequestSide,
    payment_source_id: PaymentSourceId,
    blockchain_identifier: BlockchainIdentifier,
    times: RequestTimes,
    funds: Funds,
    collateral_return_lovelace: Amount,
    input_hash: String,
    metadata: Option<String>,
    now: TimestampMs,
) -> EscrowRequest {
    EscrowRequest {
        id: RequestId(0),
        side,
        payment_source_id,
        blockchain_identifier,
        input_hash,
        result_hash: None,
        metadata,
        times,
        seller_cooldown_time: TimestampMs::MIN,
        buyer_cooldown_time: TimestampMs::MIN,
        funds,
        collateral_return_lovelace,
        total_buyer_fees: Amount::ZERO,
        total_seller_fees: Amount::ZERO,
        smart_contract_wallet_id: None,
        seller_wallet_id: None,
        buyer_wallet_id: None,
        current_transaction_id: None,
        transaction_history: Vec::new(),
        next_action: NextAction::new(RequestedAction::None),
        on_chain_state: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod test {
    use escrow_core::rng::SysRng;

    use super::*;

    #[test]
    fn minted_identifiers_are_valid_and_distinct() {
        let mut rng = SysRng::new();
        let a = mint_identifier(&mut rng);
        let b = mint_identifier(&mut rng);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("bi-"));
        assert_eq!(a.as_str().len(), 3 + 32);
    }
}
