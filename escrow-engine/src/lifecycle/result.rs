//! Handler: the seller records the result hash on-chain.
//!
//! Payment side. `FundsLocked -> ResultSubmitted`, or `RefundRequested ->
//! Disputed` when the buyer already asked for a refund.

use anyhow::anyhow;
use escrow_core::{
    action::RequestErrorType,
    model::Party,
    state::OnChainState,
    time::TimestampMs,
};
use escrow_chain::{
    codec::{DatumState, Redeemer},
    txbuild::{self, InteractParams},
    wallet,
};

use crate::selector::Batch;

use super::{HandlerError, LifecycleEngine, PreparedTx};

pub(super) async fn prepare(
    engine: &LifecycleEngine,
    batch: &Batch,
) -> Result<PreparedTx, HandlerError> {
    let request = &batch.request;

    let result_hash =
        request.next_action.result_hash.clone().ok_or_else(|| {
            HandlerError::Park(
                RequestErrorType::InvalidState,
                anyhow!("submit-result requested without a result hash"),
            )
        })?;

    if TimestampMs::now() >= request.times.submit_result_time {
        return Err(HandlerError::Park(
            RequestErrorType::InvalidState,
            anyhow!("the result submission window has elapsed"),
        ));
    }

    let (buyer_vkey, seller_vkey) = engine.party_vkeys(batch).await?;
    let (source_utxo, datum) = engine
        .find_escrow_utxo(batch, buyer_vkey, seller_vkey, &[
            OnChainState::FundsLocked,
            OnChainState::RefundRequested,
        ])
        .await?;

    let new_state = match datum.state {
        DatumState::FundsLocked => DatumState::ResultSubmitted,
        DatumState::RefundRequested => DatumState::Disputed,
        other => {
            return Err(HandlerError::Park(
                RequestErrorType::InvalidState,
                anyhow!("datum state {other:?} does not admit a result"),
            ));
        }
    };

    let mut new_datum = datum;
    new_datum.state = new_state;
    new_datum.result_hash = result_hash.clone();
    new_datum.cooldowns = engine.next_cooldowns(batch, Party::Seller);

    let (wallet_utxos, collateral_utxo) =
        engine.wallet_and_collateral_utxos(batch).await?;
    let window = engine.window(batch);

    let body = txbuild::build_with_estimated_budget(
        engine.chain.as_ref(),
        |budget| {
            txbuild::interact(InteractParams {
                redeemer: Redeemer::SubmitResult,
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
        cooldown_party: Some(Party::Seller),
        record_result_hash: Some(result_hash),
    })
}
