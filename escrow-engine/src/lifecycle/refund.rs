//! Handlers: request a refund, cancel a requested refund, and authorize a
//! refund.
//!
//! The first two are buyer-side datum flips over the same escrow UTXO; the
//! third is the seller-side resolution of a refund, which consumes the
//! escrow UTXO and returns the locked value to the buyer.

use anyhow::anyhow;
use escrow_core::{
    action::RequestErrorType,
    model::Party,
    state::OnChainState,
};
use escrow_chain::{
    codec::Redeemer,
    txbuild::{self, InteractParams, WithdrawParams},
    wallet,
};

use crate::selector::Batch;

use super::{
    HandlerError, LifecycleEngine, PreparedTx, refund_transition,
};

/// Buyer requests a refund: `FundsLocked -> RefundRequested` or
/// `ResultSubmitted -> Disputed`.
pub(super) async fn prepare_set(
    engine: &LifecycleEngine,
    batch: &Batch,
) -> Result<PreparedTx, HandlerError> {
    prepare_flip(engine, batch, true).await
}

/// Buyer cancels a requested refund: `RefundRequested -> FundsLocked` or
/// `Disputed -> ResultSubmitted`.
pub(super) async fn prepare_unset(
    engine: &LifecycleEngine,
    batch: &Batch,
) -> Result<PreparedTx, HandlerError> {
    prepare_flip(engine, batch, false).await
}

async fn prepare_flip(
    engine: &LifecycleEngine,
    batch: &Batch,
    set: bool,
) -> Result<PreparedTx, HandlerError> {
    let (buyer_vkey, seller_vkey) = engine.party_vkeys(batch).await?;
    let allowed: &[OnChainState] = if set {
        &[OnChainState::FundsLocked, OnChainState::ResultSubmitted]
    } else {
        &[OnChainState::RefundRequested, OnChainState::Disputed]
    };
    let (source_utxo, datum) = engine
        .find_escrow_utxo(batch, buyer_vkey, seller_vkey, allowed)
        .await?;

    let new_state = refund_transition(datum.state, set).ok_or_else(|| {
        HandlerError::Park(
            RequestErrorType::InvalidState,
            anyhow!("datum state {:?} does not admit this flip", datum.state),
        )
    })?;

    let mut new_datum = datum;
    new_datum.state = new_state;
    new_datum.cooldowns = engine.next_cooldowns(batch, Party::Buyer);

    let (wallet_utxos, collateral_utxo) =
        engine.wallet_and_collateral_utxos(batch).await?;
    let window = engine.window(batch);
    let redeemer = if set {
        Redeemer::RequestRefund
    } else {
        Redeemer::CancelRefund
    };

    let body = txbuild::build_with_estimated_budget(
        engine.chain.as_ref(),
        |budget| {
            txbuild::interact(InteractParams {
                redeemer,
                source_utxo: &source_utxo,
                collateral_utxo: &collateral_utxo,
                wallet_utxos: &wallet_utxos,
                new_datum: new_datum.to_plutus(),
                script_address: &batch.source.contract_address,
                change_address: &batch.wallet.address,
                required_signer: batch.wallet.vkey,
                window,
                budget,
            })
        },
    )
    .await?;

    let signed =
        wallet::sign_tx(&engine.config.seal_key, &batch.wallet, body)?;
    Ok(PreparedTx {
        signed,
        cooldown_party: Some(Party::Buyer),
        record_result_hash: None,
    })
}

/// Seller authorizes the refund: the escrow UTXO is consumed and the full
/// locked value returns to the buyer's wallet. Terminal on confirmation.
pub(super) async fn prepare_authorize(
    engine: &LifecycleEngine,
    batch: &Batch,
) -> Result<PreparedTx, HandlerError> {
    let (buyer_vkey, seller_vkey) = engine.party_vkeys(batch).await?;
    let (source_utxo, _datum) = engine
        .find_escrow_utxo(batch, buyer_vkey, seller_vkey, &[
            OnChainState::RefundRequested,
            OnChainState::Disputed,
        ])
        .await?;

    let buyer_wallet_id = batch.request.buyer_wallet_id.ok_or_else(|| {
        HandlerError::Park(
            RequestErrorType::InvalidState,
            anyhow!("payment request has no buyer wallet attached"),
        )
    })?;
    let buyer_address = engine
        .store
        .run_serializable(move |data| {
            Ok(data.get_wallet_base(buyer_wallet_id)?.address.clone())
        })
        .await?;

    let (wallet_utxos, collateral_utxo) =
        engine.wallet_and_collateral_utxos(batch).await?;
    let window = engine.window(batch);
    let refunded_value = source_utxo.value.clone();

    let body = txbuild::build_with_estimated_budget(
        engine.chain.as_ref(),
        |budget| {
            txbuild::withdraw(WithdrawParams {
                redeemer: Redeemer::AuthorizeRefund,
                source_utxo: &source_utxo,
                collateral_utxo: &collateral_utxo,
                wallet_utxos: &wallet_utxos,
                collection: (buyer_address.clone(), refunded_value.clone()),
                service_fee: None,
                escrow_collateral_return: None,
                change_address: &batch.wallet.address,
                required_signer: batch.wallet.vkey,
                window,
                budget,
            })
        },
    )
    .await?;

    let signed =
        wallet::sign_tx(&engine.config.seal_key, &batch.wallet, body)?;
    Ok(PreparedTx {
        signed,
        cooldown_party: None,
        record_result_hash: None,
    })
}
