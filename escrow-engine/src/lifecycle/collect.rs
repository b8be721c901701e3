//! Handlers: timeout-driven withdrawals.
//!
//! - Withdraw (payment side): past `unlock_time` with an undisputed result,
//!   the seller collects the funds minus the service fee, and the buyer's
//!   collateral goes back to the buyer.
//! - Withdraw refund (purchase side): past `external_dispute_unlock_time`
//!   with an unresolved refund request, the buyer collects the full locked
//!   value back.

use anyhow::anyhow;
use escrow_core::{
    action::RequestErrorType,
    amount::{Amount, AssetAmount, Funds},
    state::OnChainState,
};
use escrow_chain::{
    codec::Redeemer,
    txbuild::{self, WithdrawParams},
    wallet,
};

use crate::selector::Batch;

use super::{HandlerError, LifecycleEngine, PreparedTx};

/// Seller collects a completed escrow.
pub(super) async fn prepare_withdraw(
    engine: &LifecycleEngine,
    batch: &Batch,
) -> Result<PreparedTx, HandlerError> {
    let request = &batch.request;
    let (buyer_vkey, seller_vkey) = engine.party_vkeys(batch).await?;
    let (source_utxo, _datum) = engine
        .find_escrow_utxo(batch, buyer_vkey, seller_vkey, &[
            OnChainState::ResultSubmitted,
        ])
        .await?;

    // The service fee applies to the requested funds' native coin; the
    // buyer's collateral never contributes to the fee base.
    let fee_amount = request
        .funds
        .total_lovelace()
        .permille(batch.source.fee_rate_permille)
        .map_err(|e| {
            HandlerError::Park(RequestErrorType::Unknown, e.into())
        })?;

    let buyer_wallet_id = request.buyer_wallet_id.ok_or_else(|| {
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

    let collection_address = engine.collection_address(batch).await?;
    let collateral_return = request.collateral_return_lovelace;
    let collection_value = subtract_lovelace(
        source_utxo.value.clone(),
        fee_amount
            .checked_add(collateral_return)
            .map_err(|e| {
                HandlerError::Park(RequestErrorType::Unknown, e.into())
            })?,
    )?;

    let service_fee = (fee_amount > Amount::ZERO).then(|| {
        (
            batch.source.fee_receiver_address.clone(),
            Funds(vec![AssetAmount::lovelace(fee_amount)]),
        )
    });
    let escrow_collateral_return = (collateral_return > Amount::ZERO)
        .then(|| (buyer_address, collateral_return));

    let (wallet_utxos, collateral_utxo) =
        engine.wallet_and_collateral_utxos(batch).await?;
    let window = engine.window(batch);

    let body = txbuild::build_with_estimated_budget(
        engine.chain.as_ref(),
        |budget| {
            txbuild::withdraw(WithdrawParams {
                redeemer: Redeemer::CollectCompleted,
                source_utxo: &source_utxo,
                collateral_utxo: &collateral_utxo,
                wallet_utxos: &wallet_utxos,
                collection: (
                    collection_address.clone(),
                    collection_value.clone(),
                ),
                service_fee: service_fee.clone(),
                escrow_collateral_return: escrow_collateral_return.clone(),
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

/// Buyer collects an unresolved refund.
pub(super) async fn prepare_withdraw_refund(
    engine: &LifecycleEngine,
    batch: &Batch,
) -> Result<PreparedTx, HandlerError> {
    let (buyer_vkey, seller_vkey) = engine.party_vkeys(batch).await?;
    let (source_utxo, _datum) = engine
        .find_escrow_utxo(batch, buyer_vkey, seller_vkey, &[
            OnChainState::RefundRequested,
        ])
        .await?;

    let collection_address = engine.collection_address(batch).await?;
    let refunded_value = source_utxo.value.clone();

    let (wallet_utxos, collateral_utxo) =
        engine.wallet_and_collateral_utxos(batch).await?;
    let window = engine.window(batch);

    let body = txbuild::build_with_estimated_budget(
        engine.chain.as_ref(),
        |budget| {
            txbuild::withdraw(WithdrawParams {
                redeemer: Redeemer::CollectRefund,
                source_utxo: &source_utxo,
                collateral_utxo: &collateral_utxo,
                wallet_utxos: &wallet_utxos,
                collection: (
                    collection_address.clone(),
                    refunded_value.clone(),
                ),
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

/// Remove `amount` of native coin from the lovelace entry of `funds`.
fn subtract_lovelace(
    mut funds: Funds,
    amount: Amount,
) -> Result<Funds, HandlerError> {
    if amount == Amount::ZERO {
        return Ok(funds);
    }
    let entry = funds
        .0
        .iter_mut()
        .find(|aa| aa.unit.is_lovelace())
        .ok_or_else(|| {
            HandlerError::Park(
                RequestErrorType::InsufficientFunds,
                anyhow!("escrow value has no native coin to deduct from"),
            )
        })?;
    entry.amount = entry.amount.checked_sub(amount).map_err(|_| {
        HandlerError::Park(
            RequestErrorType::InsufficientFunds,
            anyhow!("escrow value cannot cover fee and collateral return"),
        )
    })?;
    Ok(funds)
}
