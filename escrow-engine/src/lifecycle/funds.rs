//! Handler: lock the buyer's funds into a fresh escrow UTXO.
//!
//! Purchase side only. This is the one transition with no script input:
//! the purchasing wallet spends its own UTXOs into a script output carrying
//! the initial `FundsLocked` datum, the full paid funds, and the buyer's
//! collateral.

use anyhow::anyhow;
use escrow_core::{
    action::RequestErrorType,
    amount::{Amount, AssetAmount, Funds},
    model::Party,
    time::TimestampMs,
};
use escrow_chain::{
    codec::{DatumState, EscrowDatum},
    txbuild::{self, LockParams},
    wallet,
};

use crate::selector::Batch;

use super::{HandlerError, LifecycleEngine, PreparedTx};

pub(super) async fn prepare(
    engine: &LifecycleEngine,
    batch: &Batch,
) -> Result<PreparedTx, HandlerError> {
    let request = &batch.request;
    let now = TimestampMs::now();

    if now >= request.times.pay_by_time {
        return Err(HandlerError::Park(
            RequestErrorType::InvalidState,
            anyhow!("pay-by time has already elapsed"),
        ));
    }
    if request.funds.is_empty() {
        return Err(HandlerError::Park(
            RequestErrorType::InvalidState,
            anyhow!("purchase has no funds to lock"),
        ));
    }

    let (buyer_vkey, seller_vkey) = engine.party_vkeys(batch).await?;

    let datum = EscrowDatum {
        buyer_vkey,
        seller_vkey,
        blockchain_identifier: request.blockchain_identifier.clone(),
        input_hash: request.input_hash.clone(),
        result_hash: String::new(),
        pay_by_time: request.times.pay_by_time,
        submit_result_time: request.times.submit_result_time,
        unlock_time: request.times.unlock_time,
        external_dispute_unlock_time: request
            .times
            .external_dispute_unlock_time,
        collateral_return_lovelace: request.collateral_return_lovelace,
        state: DatumState::FundsLocked,
        cooldowns: engine.next_cooldowns(batch, Party::Buyer),
    };

    let wallet_utxos = engine.chain.fetch_utxos(&batch.wallet.address).await?;
    let locked_value = add_lovelace(
        request.funds.clone(),
        request.collateral_return_lovelace,
    )?;

    let body = txbuild::lock(LockParams {
        wallet_utxos: &wallet_utxos,
        locked_value,
        datum: datum.to_plutus(),
        script_address: &batch.source.contract_address,
        change_address: &batch.wallet.address,
        required_signer: batch.wallet.vkey,
        window: engine.window(batch),
    })?;

    let signed =
        wallet::sign_tx(&engine.config.seal_key, &batch.wallet, body)?;
    Ok(PreparedTx {
        signed,
        cooldown_party: Some(Party::Buyer),
        record_result_hash: None,
    })
}

/// The value locked at the script: the paid funds plus the buyer's
/// collateral, merged into the lovelace entry.
fn add_lovelace(
    mut funds: Funds,
    extra: Amount,
) -> Result<Funds, HandlerError> {
    if extra == Amount::ZERO {
        return Ok(funds);
    }
    match funds.0.iter_mut().find(|aa| aa.unit.is_lovelace()) {
        Some(entry) => {
            entry.amount = entry.amount.checked_add(extra).map_err(|e| {
                HandlerError::Park(RequestErrorType::Unknown, e.into())
            })?;
        }
        None => funds.0.push(AssetAmount::lovelace(extra)),
    }
    Ok(funds)
}

#[cfg(test)]
mod test {
    use escrow_core::amount::AssetId;

    use super::*;

    #[test]
    fn lovelace_merges_into_existing_entry() {
        let funds = Funds(vec![
            AssetAmount::lovelace(Amount::try_from_i64(5_000_000).unwrap()),
            AssetAmount {
                unit: AssetId::new("cafe.token".to_owned()),
                amount: Amount::try_from_i64(3).unwrap(),
            },
        ]);
        let out =
            add_lovelace(funds, Amount::try_from_i64(2_000_000).unwrap())
                .unwrap();
        assert_eq!(out.total_lovelace().to_i64(), 7_000_000);
        assert_eq!(out.0.len(), 2);
    }

    #[test]
    fn lovelace_entry_is_created_when_missing() {
        let funds = Funds(vec![AssetAmount {
            unit: AssetId::new("cafe.token".to_owned()),
            amount: Amount::try_from_i64(3).unwrap(),
        }]);
        let out =
            add_lovelace(funds, Amount::try_from_i64(2_000_000).unwrap())
                .unwrap();
        assert_eq!(out.total_lovelace().to_i64(), 2_000_000);
    }
}
