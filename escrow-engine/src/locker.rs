//! Exclusive hot-wallet leases.
//!
//! A wallet is leased by setting `locked_at` inside a serializable store
//! transaction; attaching the pending transaction id happens in the same
//! transaction that creates the transaction record. The lease is persisted
//! state, so it survives process restarts; the [`reap`] job recovers leases
//! whose transaction will never complete.

use std::time::Duration;

use escrow_core::{
    action::{NextAction, RequestErrorType},
    ids::WalletId,
    state::TxStatus,
    time::TimestampMs,
};
use tracing::{info, warn};

use crate::store::{StoreData, StoreError};

/// Lease a wallet. Fails with [`StoreError::WalletBusy`] unless the wallet
/// is unleased, has no pending transaction, and is not deleted.
pub fn acquire(
    data: &mut StoreData,
    wallet_id: WalletId,
    now: TimestampMs,
) -> Result<(), StoreError> {
    let wallet = data.get_hot_wallet_mut(wallet_id)?;
    if !wallet.is_available() {
        return Err(StoreError::WalletBusy(wallet_id));
    }
    wallet.locked_at = Some(now);
    Ok(())
}

/// Release a wallet lease unconditionally, detaching any pending
/// transaction. Use [`release_if_settled`] unless the caller has itself
/// settled the blocking transaction in the same store transaction.
pub fn release(
    data: &mut StoreData,
    wallet_id: WalletId,
) -> Result<(), StoreError> {
    let wallet = data.get_hot_wallet_mut(wallet_id)?;
    wallet.locked_at = None;
    wallet.pending_transaction_id = None;
    Ok(())
}

/// Release a wallet lease iff its pending transaction is `Confirmed` or
/// `Failed` (or there is none).
pub fn release_if_settled(
    data: &mut StoreData,
    wallet_id: WalletId,
) -> Result<bool, StoreError> {
    let wallet = data.get_hot_wallet(wallet_id)?;
    let settled = match wallet.pending_transaction_id {
        None => true,
        Some(tx_id) =>
            data.get_transaction(tx_id)?.status.releases_lease(),
    };
    if settled {
        release(data, wallet_id)?;
    }
    Ok(settled)
}

/// Summary of one reaper pass.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct ReapOutcome {
    /// Leases released because the blocking transaction already failed.
    pub released: usize,
    /// Requests parked because their transaction has been pending past the
    /// stuck threshold without ever reaching the chain.
    pub escalated: usize,
}

/// Recover wallet leases that will never settle on their own:
///
/// - a lease older than `max_lease_age` whose transaction is `Failed` is
///   released;
/// - a lease whose transaction is still `Pending` past `tx_stuck` and whose
///   transaction never received a hash (the submit never happened) is
///   escalated: the owning request parks with `TxDropped` and the lease is
///   released. Pending transactions *with* a hash are the chain monitor's
///   responsibility.
pub fn reap(
    data: &mut StoreData,
    now: TimestampMs,
    max_lease_age: Duration,
    tx_stuck: Duration,
) -> Result<ReapOutcome, StoreError> {
    let mut outcome = ReapOutcome::default();

    let leased: Vec<(WalletId, TimestampMs)> = data
        .hot_wallets
        .values()
        .filter_map(|w| w.locked_at.map(|at| (w.id, at)))
        .collect();

    for (wallet_id, locked_at) in leased {
        let Some(tx_id) = data.get_hot_wallet(wallet_id)?.pending_transaction_id
        else {
            // Leased with no transaction attached: a crash between the
            // selector's lease and the handler's store transaction. Old
            // enough leases are simply released.
            if now.duration_since(locked_at) > max_lease_age {
                warn!(%wallet_id, "releasing stale lease with no transaction");
                release(data, wallet_id)?;
                outcome.released += 1;
            }
            continue;
        };

        let tx = data.get_transaction(tx_id)?.clone();
        match tx.status {
            TxStatus::Failed
                if now.duration_since(locked_at) > max_lease_age =>
            {
                info!(%wallet_id, tx_id = %tx_id, "releasing failed-tx lease");
                release(data, wallet_id)?;
                outcome.released += 1;
            }
            TxStatus::Pending
                if tx.tx_hash.is_none()
                    && now.duration_since(tx.created_at) > tx_stuck =>
            {
                warn!(
                    %wallet_id,
                    tx_id = %tx_id,
                    "escalating never-submitted pending transaction"
                );
                escalate_owner(data, tx_id, now)?;
                let source = owning_source(data, wallet_id)?;
                data.update_transaction(tx_id, source, now, |tx| {
                    tx.status = TxStatus::Failed;
                })?;
                release(data, wallet_id)?;
                outcome.escalated += 1;
            }
            _ => (),
        }
    }

    Ok(outcome)
}

fn owning_source(
    data: &StoreData,
    wallet_id: WalletId,
) -> Result<escrow_core::ids::PaymentSourceId, StoreError> {
    Ok(data.get_hot_wallet(wallet_id)?.payment_source_id)
}

/// Park the request whose current transaction is `tx_id`.
fn escalate_owner(
    data: &mut StoreData,
    tx_id: escrow_core::ids::TransactionId,
    now: TimestampMs,
) -> Result<(), StoreError> {
    let owner = data
        .requests
        .values()
        .find(|r| r.current_transaction_id == Some(tx_id))
        .map(|r| r.id);
    if let Some(request_id) = owner {
        data.update_request(request_id, now, |request| {
            request.next_action = NextAction::parked(
                RequestErrorType::TxDropped,
                "transaction was never submitted to the chain".to_owned(),
            );
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use escrow_core::{
        ids::{Address, PaymentSourceId, TransactionId, Vkey},
        model::{HotWallet, TransactionRecord},
        state::WalletKind,
    };

    use super::*;

    fn wallet() -> HotWallet {
        HotWallet {
            id: WalletId(0),
            payment_source_id: PaymentSourceId(1),
            kind: WalletKind::Purchasing,
            address: Address::new("addr_test1w".to_owned()).unwrap(),
            vkey: Vkey::new([1; 28]),
            sealed_seed: vec![0; 60],
            locked_at: None,
            pending_transaction_id: None,
            deleted_at: None,
        }
    }

    fn now_plus(ms: i64) -> TimestampMs {
        TimestampMs::try_from_ms(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn acquire_is_exclusive() {
        let mut data = StoreData::default();
        let id = data.insert_hot_wallet(wallet()).unwrap();

        acquire(&mut data, id, now_plus(0)).unwrap();
        // Scenario (d): the second worker's acquire fails.
        assert!(matches!(
            acquire(&mut data, id, now_plus(1)),
            Err(StoreError::WalletBusy(_))
        ));

        release(&mut data, id).unwrap();
        acquire(&mut data, id, now_plus(2)).unwrap();
    }

    #[test]
    fn release_if_settled_respects_pending() {
        let mut data = StoreData::default();
        let wallet_id = data.insert_hot_wallet(wallet()).unwrap();
        acquire(&mut data, wallet_id, now_plus(0)).unwrap();

        let tx_id = data.insert_transaction(TransactionRecord {
            id: TransactionId(0),
            tx_hash: None,
            status: TxStatus::Pending,
            blocks_wallet_id: Some(wallet_id),
            created_at: now_plus(0),
            updated_at: now_plus(0),
        });
        data.get_hot_wallet_mut(wallet_id).unwrap().pending_transaction_id =
            Some(tx_id);

        assert!(!release_if_settled(&mut data, wallet_id).unwrap());
        assert!(data.get_hot_wallet(wallet_id).unwrap().is_leased());

        data.update_transaction(tx_id, PaymentSourceId(1), now_plus(1), |tx| {
            tx.status = TxStatus::Confirmed;
        })
        .unwrap();
        assert!(release_if_settled(&mut data, wallet_id).unwrap());
        assert!(data.get_hot_wallet(wallet_id).unwrap().is_available());
    }

    #[test]
    fn reap_releases_failed_and_escalates_unsubmitted() {
        let mut data = StoreData::default();
        let max_lease_age = Duration::from_secs(600);
        let tx_stuck = Duration::from_secs(1_800);

        // Wallet A: failed transaction, old lease. Should release.
        let wallet_a = data.insert_hot_wallet(wallet()).unwrap();
        acquire(&mut data, wallet_a, now_plus(0)).unwrap();
        let tx_a = data.insert_transaction(TransactionRecord {
            id: TransactionId(0),
            tx_hash: None,
            status: TxStatus::Failed,
            blocks_wallet_id: Some(wallet_a),
            created_at: now_plus(0),
            updated_at: now_plus(0),
        });
        data.get_hot_wallet_mut(wallet_a).unwrap().pending_transaction_id =
            Some(tx_a);

        // Wallet B: pending unsubmitted transaction, old. Should escalate.
        let wallet_b = data.insert_hot_wallet(wallet()).unwrap();
        acquire(&mut data, wallet_b, now_plus(0)).unwrap();
        let tx_b = data.insert_transaction(TransactionRecord {
            id: TransactionId(0),
            tx_hash: None,
            status: TxStatus::Pending,
            blocks_wallet_id: Some(wallet_b),
            created_at: now_plus(0),
            updated_at: now_plus(0),
        });
        data.get_hot_wallet_mut(wallet_b).unwrap().pending_transaction_id =
            Some(tx_b);

        let later = now_plus(2 * 1_800 * 1_000);
        let outcome =
            reap(&mut data, later, max_lease_age, tx_stuck).unwrap();
        assert_eq!(outcome, ReapOutcome {
            released: 1,
            escalated: 1
        });
        assert!(data.get_hot_wallet(wallet_a).unwrap().is_available());
        assert!(data.get_hot_wallet(wallet_b).unwrap().is_available());
        assert_eq!(
            data.get_transaction(tx_b).unwrap().status,
            TxStatus::Failed
        );
    }
}
