//! End-to-end lifecycle scenarios driven through the real engine, an
//! in-memory store, and the in-process mock ledger: lock, result
//! submission, refunds, disputes, withdrawals, stuck transactions, and
//! datum tampering.

use std::{sync::Arc, time::Duration};

use escrow_core::{
    action::{RequestedAction, RequestErrorType},
    amount::{Amount, AssetAmount, Funds},
    ids::{Address, RequestId, WalletId},
    model::{EscrowRequest, HotWallet, PaymentSource, RequestTimes},
    state::{OnChainState, RequestSide, TxStatus, WalletKind},
    time::TimestampMs,
};
use escrow_chain::{
    client::{ChainClient, ChainError, OutPoint, Utxo},
    codec::{CooldownTimes, DatumState, EscrowDatum},
    txbuild::TOTAL_COLLATERAL,
};
use escrow_engine::{
    intents::{CreatePayment, CreatePurchase, Intents},
    lifecycle::{EngineConfig, LifecycleEngine},
    monitor::{ChainMonitor, MonitorNudge},
    store::MemoryStore,
    testing::{MockChain, fixtures},
};

const INPUT_HASH: &str = "4242424242424242424242424242424242424242424242424242424242424242";
const RESULT_HASH: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

struct Harness {
    store: MemoryStore,
    chain: Arc<MockChain>,
    engine: LifecycleEngine,
    monitor: ChainMonitor,
    intents: Intents,
    source: PaymentSource,
    purchasing: HotWallet,
    selling: HotWallet,
    collection: HotWallet,
}

async fn harness(tx_stuck: Duration) -> Harness {
    escrow_logger::init_for_testing();
    let store = MemoryStore::new();
    let chain = Arc::new(MockChain::new());

    let (source, purchasing, selling, collection) = store
        .run_serializable(|data| {
            let source_id =
                data.insert_payment_source(fixtures::source_template())?;
            let purchasing_id = data.insert_hot_wallet(fixtures::hot_wallet(
                source_id,
                WalletKind::Purchasing,
                7,
            ))?;
            let selling_id = data.insert_hot_wallet(fixtures::hot_wallet(
                source_id,
                WalletKind::Selling,
                9,
            ))?;
            let collection_id = data.insert_hot_wallet(
                fixtures::hot_wallet(source_id, WalletKind::Collection, 11),
            )?;
            Ok((
                data.get_payment_source(source_id)?.clone(),
                data.get_hot_wallet(purchasing_id)?.clone(),
                data.get_hot_wallet(selling_id)?.clone(),
                data.get_hot_wallet(collection_id)?.clone(),
            ))
        })
        .await
        .unwrap();

    // Fund both signing wallets: one fee UTXO and one collateral UTXO.
    chain.seed_wallet_utxo(0x21, 0, &purchasing.address, 50_000_000);
    chain.seed_wallet_utxo(0x22, 0, &purchasing.address, 5_000_000);
    chain.seed_wallet_utxo(0x23, 0, &selling.address, 50_000_000);
    chain.seed_wallet_utxo(0x24, 0, &selling.address, 5_000_000);

    let engine = LifecycleEngine::new(
        store.clone(),
        chain.clone(),
        EngineConfig {
            seal_key: fixtures::seal_key(),
            cooldown_pad: Duration::from_secs(20 * 60),
            time_buffer: Duration::from_secs(180),
            max_batch_size: 50,
        },
    );
    let monitor = ChainMonitor::new(store.clone(), chain.clone(), tx_stuck);
    let intents = Intents::new(store.clone(), MonitorNudge::new());

    Harness {
        store,
        chain,
        engine,
        monitor,
        intents,
        source,
        purchasing,
        selling,
        collection,
    }
}

impl Harness {
    async fn request(&self, id: RequestId) -> EscrowRequest {
        self.store
            .run_serializable(move |data| Ok(data.get_request(id)?.clone()))
            .await
            .unwrap()
    }

    async fn wallet(&self, id: WalletId) -> HotWallet {
        self.store
            .run_serializable(move |data| Ok(data.get_hot_wallet(id)?.clone()))
            .await
            .unwrap()
    }

    /// Pretend the party cooldowns have elapsed.
    async fn clear_cooldowns(&self, id: RequestId) {
        self.store
            .run_serializable(move |data| {
                data.update_request(id, TimestampMs::now(), |r| {
                    r.buyer_cooldown_time = TimestampMs::MIN;
                    r.seller_cooldown_time = TimestampMs::MIN;
                })
            })
            .await
            .unwrap();
    }

    async fn lovelace_at(&self, address: &Address) -> i64 {
        self.chain
            .fetch_utxos(address)
            .await
            .unwrap()
            .iter()
            .map(|u| u.lovelace().to_i64())
            .sum()
    }

    /// Drive a payment/purchase pair to `FundsLocked` via the real lock
    /// handler. Returns `(payment_id, purchase_id)`.
    async fn to_funds_locked(&self) -> (RequestId, RequestId) {
        let (payment_id, identifier) = self
            .intents
            .create_payment(CreatePayment {
                payment_source_id: self.source.id,
                times: fixtures::future_times(),
                requested_funds: Funds(vec![AssetAmount::lovelace(
                    Amount::try_from_i64(5_000_000).unwrap(),
                )]),
                collateral_return_lovelace: Amount::try_from_i64(2_000_000)
                    .unwrap(),
                input_hash: INPUT_HASH.to_owned(),
                metadata: None,
                buyer_vkey: self.purchasing.vkey,
                buyer_address: self.purchasing.address.clone(),
            })
            .await
            .unwrap();

        let purchase_id = self
            .intents
            .create_purchase(CreatePurchase {
                payment_source_id: self.source.id,
                blockchain_identifier: identifier,
                times: self.request(payment_id).await.times,
                paid_funds: Funds(vec![AssetAmount::lovelace(
                    Amount::try_from_i64(5_000_000).unwrap(),
                )]),
                collateral_return_lovelace: Amount::try_from_i64(2_000_000)
                    .unwrap(),
                input_hash: INPUT_HASH.to_owned(),
                metadata: None,
                seller_vkey: self.selling.vkey,
                seller_address: self.selling.address.clone(),
            })
            .await
            .unwrap();

        self.engine
            .tick(RequestedAction::FundsLockingRequested)
            .await
            .unwrap();
        let confirmed = self.chain.confirm_all();
        assert_eq!(confirmed.len(), 1, "exactly one lock tx submitted");
        self.monitor.tick().await.unwrap();

        (payment_id, purchase_id)
    }

    /// Continue from `FundsLocked` through a confirmed result submission.
    async fn to_result_submitted(&self) -> (RequestId, RequestId) {
        let (payment_id, purchase_id) = self.to_funds_locked().await;
        self.intents
            .submit_result(payment_id, RESULT_HASH.to_owned())
            .await
            .unwrap();
        self.clear_cooldowns(payment_id).await;
        self.engine
            .tick(RequestedAction::SubmitResultRequested)
            .await
            .unwrap();
        assert_eq!(self.chain.confirm_all().len(), 1);
        self.monitor.tick().await.unwrap();
        (payment_id, purchase_id)
    }
}

// --- Scenario (a): happy path through result submission --- //

#[tokio::test]
async fn happy_path_locks_and_submits_result() {
    let h = harness(Duration::from_secs(1_800)).await;
    let (payment_id, purchase_id) = h.to_funds_locked().await;

    let q = h.request(purchase_id).await;
    assert_eq!(q.on_chain_state, Some(OnChainState::FundsLocked));
    assert_eq!(
        q.next_action.requested_action,
        RequestedAction::WaitingForExternalAction
    );
    // Confirmation released the purchasing wallet's lease.
    assert!(h.wallet(h.purchasing.id).await.is_available());
    // The buyer's cooldown was stamped; the seller's stayed clear.
    assert!(q.buyer_cooldown_time > TimestampMs::MIN);
    assert_eq!(q.seller_cooldown_time, TimestampMs::MIN);

    // The payment side observed the lock purely from the chain.
    let p = h.request(payment_id).await;
    assert_eq!(p.on_chain_state, Some(OnChainState::FundsLocked));

    h.intents
        .submit_result(payment_id, RESULT_HASH.to_owned())
        .await
        .unwrap();
    h.clear_cooldowns(payment_id).await;
    h.engine
        .tick(RequestedAction::SubmitResultRequested)
        .await
        .unwrap();
    assert_eq!(h.chain.confirm_all().len(), 1);
    h.monitor.tick().await.unwrap();

    let p = h.request(payment_id).await;
    assert_eq!(p.on_chain_state, Some(OnChainState::ResultSubmitted));
    assert_eq!(p.result_hash.as_deref(), Some(RESULT_HASH));
    assert!(h.wallet(h.selling.id).await.is_available());

    let q = h.request(purchase_id).await;
    assert_eq!(q.on_chain_state, Some(OnChainState::ResultSubmitted));
}

// --- Scenario (a) ending: withdrawal after the unlock time --- //

fn past_times(now: TimestampMs, edu_offset_secs: i64) -> RequestTimes {
    let hour = 3_600_000i64;
    let base = now.to_i64();
    RequestTimes {
        pay_by_time: TimestampMs::try_from_ms(base - 4 * hour).unwrap(),
        submit_result_time: TimestampMs::try_from_ms(base - 3 * hour)
            .unwrap(),
        unlock_time: TimestampMs::try_from_ms(base - 2 * hour).unwrap(),
        external_dispute_unlock_time: TimestampMs::try_from_ms(
            base + edu_offset_secs * 1_000,
        )
        .unwrap(),
    }
}

/// Seed a request whose escrow UTXO already sits on-chain in `state`.
async fn seed_onchain_request(
    h: &Harness,
    side: RequestSide,
    identifier: &str,
    times: RequestTimes,
    state: DatumState,
    result_hash: &str,
    action: RequestedAction,
) -> RequestId {
    let source_id = h.source.id;
    let buyer_vkey = h.purchasing.vkey;
    let seller_vkey = h.selling.vkey;
    let purchasing_base =
        fixtures::wallet_base(source_id, WalletKind::Purchasing, 7);
    let selling_base =
        fixtures::wallet_base(source_id, WalletKind::Selling, 9);

    let mut request = fixtures::request_template(side, identifier);
    request.payment_source_id = source_id;
    request.times = times;
    request.on_chain_state = Some(state.to_on_chain_state());
    request.result_hash =
        (!result_hash.is_empty()).then(|| result_hash.to_owned());
    request.next_action =
        escrow_core::action::NextAction::new(action);

    let request_id = h
        .store
        .run_serializable(move |data| {
            let buyer_id = data.upsert_wallet_base(purchasing_base.clone())?;
            let seller_id = data.upsert_wallet_base(selling_base.clone())?;
            let mut request = request.clone();
            request.buyer_wallet_id = Some(buyer_id);
            request.seller_wallet_id = Some(seller_id);
            data.insert_request(request)
        })
        .await
        .unwrap();

    let request = h.request(request_id).await;
    let datum = EscrowDatum {
        buyer_vkey,
        seller_vkey,
        blockchain_identifier: request.blockchain_identifier.clone(),
        input_hash: request.input_hash.clone(),
        result_hash: result_hash.to_owned(),
        pay_by_time: request.times.pay_by_time,
        submit_result_time: request.times.submit_result_time,
        unlock_time: request.times.unlock_time,
        external_dispute_unlock_time: request
            .times
            .external_dispute_unlock_time,
        collateral_return_lovelace: request.collateral_return_lovelace,
        state,
        cooldowns: CooldownTimes {
            seller: TimestampMs::MIN,
            buyer: TimestampMs::MIN,
        },
    };
    h.chain.seed_utxo(Utxo {
        outpoint: OutPoint {
            tx_hash: escrow_core::ids::TxHash::new([0xEE; 32]),
            index: 0,
        },
        address: h.source.contract_address.clone(),
        value: Funds(vec![AssetAmount::lovelace(
            Amount::try_from_i64(7_000_000).unwrap(),
        )]),
        datum: Some(datum.to_plutus()),
    });
    request_id
}

#[tokio::test]
async fn withdrawal_pays_collection_fee_and_collateral() {
    let h = harness(Duration::from_secs(1_800)).await;
    let now = TimestampMs::now();
    let payment_id = seed_onchain_request(
        &h,
        RequestSide::Payment,
        "bi-withdraw",
        past_times(now, 2 * 3_600),
        DatumState::ResultSubmitted,
        RESULT_HASH,
        RequestedAction::WithdrawRequested,
    )
    .await;

    h.engine
        .tick(RequestedAction::WithdrawRequested)
        .await
        .unwrap();
    assert_eq!(h.chain.confirm_all().len(), 1);
    h.monitor.tick().await.unwrap();

    let p = h.request(payment_id).await;
    assert_eq!(p.on_chain_state, Some(OnChainState::Withdrawn));
    assert_eq!(p.next_action.requested_action, RequestedAction::None);
    assert!(h.wallet(h.selling.id).await.is_available());

    // 7_000_000 locked = 5_000_000 funds + 2_000_000 collateral.
    // Fee: 50 permille of the funds = 250_000.
    assert_eq!(
        h.lovelace_at(&h.collection.address).await,
        5_000_000 - 250_000
    );
    assert_eq!(h.lovelace_at(&h.source.fee_receiver_address).await, 250_000);
    // The buyer's collateral came back to the buyer's address.
    let buyer_utxos =
        h.chain.fetch_utxos(&h.purchasing.address).await.unwrap();
    assert!(
        buyer_utxos.iter().any(|u| u.lovelace().to_i64() == 2_000_000),
        "collateral return output missing"
    );
}

// --- Scenario (b): refund path --- //

#[tokio::test]
async fn refund_requested_then_withdrawn_by_timeout() {
    let h = harness(Duration::from_secs(1_800)).await;
    let (payment_id, purchase_id) = h.to_funds_locked().await;

    h.intents.request_refund(purchase_id).await.unwrap();
    h.clear_cooldowns(purchase_id).await;
    h.engine
        .tick(RequestedAction::SetRefundRequested)
        .await
        .unwrap();
    assert_eq!(h.chain.confirm_all().len(), 1);
    h.monitor.tick().await.unwrap();

    let q = h.request(purchase_id).await;
    assert_eq!(q.on_chain_state, Some(OnChainState::RefundRequested));
    let p = h.request(payment_id).await;
    assert_eq!(p.on_chain_state, Some(OnChainState::RefundRequested));

    // Seller does nothing; a separate fixture covers the timeout
    // withdrawal below.
}

#[tokio::test]
async fn refund_withdrawal_after_dispute_window() {
    let h = harness(Duration::from_secs(1_800)).await;
    let now = TimestampMs::now();
    let purchase_id = seed_onchain_request(
        &h,
        RequestSide::Purchase,
        "bi-refund-wd",
        past_times(now, -3_600),
        DatumState::RefundRequested,
        "",
        RequestedAction::WithdrawRefundRequested,
    )
    .await;

    h.engine
        .tick(RequestedAction::WithdrawRefundRequested)
        .await
        .unwrap();
    assert_eq!(h.chain.confirm_all().len(), 1);
    h.monitor.tick().await.unwrap();

    let q = h.request(purchase_id).await;
    assert_eq!(q.on_chain_state, Some(OnChainState::RefundWithdrawn));
    // The full locked value returned to the collection address.
    assert_eq!(h.lovelace_at(&h.collection.address).await, 7_000_000);
}

// --- Scenario (c): dispute path --- //

#[tokio::test]
async fn dispute_blocks_refund_until_cancelled() {
    let h = harness(Duration::from_secs(1_800)).await;
    let (payment_id, purchase_id) = h.to_result_submitted().await;

    // Buyer disputes the submitted result.
    h.intents.request_refund(purchase_id).await.unwrap();
    h.clear_cooldowns(purchase_id).await;
    h.engine
        .tick(RequestedAction::SetRefundRequested)
        .await
        .unwrap();
    assert_eq!(h.chain.confirm_all().len(), 1);
    h.monitor.tick().await.unwrap();

    let q = h.request(purchase_id).await;
    assert_eq!(q.on_chain_state, Some(OnChainState::Disputed));
    let p = h.request(payment_id).await;
    assert_eq!(p.on_chain_state, Some(OnChainState::Disputed));

    // A disputed escrow is not collectible as a refund: the withdraw-refund
    // tick must not submit anything.
    h.clear_cooldowns(purchase_id).await;
    h.engine
        .tick(RequestedAction::WithdrawRefundRequested)
        .await
        .unwrap();
    assert!(h.chain.mempool_hashes().is_empty());

    // The buyer backs down; the dispute resolves to the submitted result.
    h.intents.cancel_refund(purchase_id).await.unwrap();
    h.clear_cooldowns(purchase_id).await;
    h.engine
        .tick(RequestedAction::UnSetRefundRequested)
        .await
        .unwrap();
    assert_eq!(h.chain.confirm_all().len(), 1);
    h.monitor.tick().await.unwrap();

    let q = h.request(purchase_id).await;
    assert_eq!(q.on_chain_state, Some(OnChainState::ResultSubmitted));
}

// --- Seller authorizes a refund --- //

#[tokio::test]
async fn authorize_refund_returns_funds_to_buyer() {
    let h = harness(Duration::from_secs(1_800)).await;
    let (payment_id, purchase_id) = h.to_funds_locked().await;

    h.intents.request_refund(purchase_id).await.unwrap();
    h.clear_cooldowns(purchase_id).await;
    h.engine
        .tick(RequestedAction::SetRefundRequested)
        .await
        .unwrap();
    assert_eq!(h.chain.confirm_all().len(), 1);
    h.monitor.tick().await.unwrap();

    let buyer_before = h.lovelace_at(&h.purchasing.address).await;
    h.intents.authorize_refund(payment_id).await.unwrap();
    h.clear_cooldowns(payment_id).await;
    h.engine
        .tick(RequestedAction::AuthorizeRefundRequested)
        .await
        .unwrap();
    assert_eq!(h.chain.confirm_all().len(), 1);
    h.monitor.tick().await.unwrap();

    let p = h.request(payment_id).await;
    assert_eq!(p.on_chain_state, Some(OnChainState::RefundWithdrawn));
    assert_eq!(p.next_action.requested_action, RequestedAction::None);
    // The full locked value (funds + collateral) went back to the buyer.
    assert_eq!(
        h.lovelace_at(&h.purchasing.address).await,
        buyer_before + 7_000_000
    );
}

// --- Scenario (d) is covered at the selector layer; see
// `selector::test::selects_and_leases`. --- //

// --- Scenario (e): stuck transaction --- //

#[tokio::test]
async fn stuck_transaction_parks_request_and_frees_wallet() {
    let h = harness(Duration::ZERO).await;
    let (_payment_id, purchase_id) = {
        // Build the pair but do NOT confirm the lock tx.
        let (payment_id, identifier) = h
            .intents
            .create_payment(CreatePayment {
                payment_source_id: h.source.id,
                times: fixtures::future_times(),
                requested_funds: Funds(vec![AssetAmount::lovelace(
                    Amount::try_from_i64(5_000_000).unwrap(),
                )]),
                collateral_return_lovelace: Amount::try_from_i64(2_000_000)
                    .unwrap(),
                input_hash: INPUT_HASH.to_owned(),
                metadata: None,
                buyer_vkey: h.purchasing.vkey,
                buyer_address: h.purchasing.address.clone(),
            })
            .await
            .unwrap();
        let purchase_id = h
            .intents
            .create_purchase(CreatePurchase {
                payment_source_id: h.source.id,
                blockchain_identifier: identifier,
                times: h.request(payment_id).await.times,
                paid_funds: Funds(vec![AssetAmount::lovelace(
                    Amount::try_from_i64(5_000_000).unwrap(),
                )]),
                collateral_return_lovelace: Amount::try_from_i64(2_000_000)
                    .unwrap(),
                input_hash: INPUT_HASH.to_owned(),
                metadata: None,
                seller_vkey: h.selling.vkey,
                seller_address: h.selling.address.clone(),
            })
            .await
            .unwrap();
        h.engine
            .tick(RequestedAction::FundsLockingRequested)
            .await
            .unwrap();
        (payment_id, purchase_id)
    };
    assert_eq!(h.chain.mempool_hashes().len(), 1);

    // The tx sits unconfirmed past the (zero) stuck threshold.
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.monitor.tick().await.unwrap();

    let q = h.request(purchase_id).await;
    assert_eq!(
        q.next_action.error_type,
        Some(RequestErrorType::TxDropped)
    );
    assert_eq!(
        q.next_action.requested_action,
        RequestedAction::WaitingForManualAction
    );
    assert!(h.wallet(h.purchasing.id).await.is_available());

    let tx = h
        .store
        .run_serializable(move |data| {
            let request = data.get_request(purchase_id)?;
            Ok(data
                .get_transaction(request.current_transaction_id.unwrap())?
                .clone())
        })
        .await
        .unwrap();
    assert_eq!(tx.status, TxStatus::Failed);

    // Scenario follow-up: the operator clears the error and the request
    // re-enters the pipeline.
    h.intents.clear_error(purchase_id).await.unwrap();
    let q = h.request(purchase_id).await;
    assert!(q.next_action.error_type.is_none());
}

// --- Scenario (f): datum tamper --- //

#[tokio::test]
async fn undecodable_datum_is_ignored() {
    let h = harness(Duration::from_secs(1_800)).await;
    let (_payment_id, purchase_id) = h.to_funds_locked().await;

    // An attacker parks a UTXO at the script address whose datum has ten
    // fields instead of eleven.
    let bogus = escrow_chain::plutus::PlutusData::constr(
        0,
        (0..10)
            .map(escrow_chain::plutus::PlutusData::Int)
            .collect(),
    );
    h.chain.seed_utxo(Utxo {
        outpoint: OutPoint {
            tx_hash: escrow_core::ids::TxHash::new([0xAB; 32]),
            index: 0,
        },
        address: h.source.contract_address.clone(),
        value: Funds(vec![AssetAmount::lovelace(
            Amount::try_from_i64(1_000_000).unwrap(),
        )]),
        datum: Some(bogus),
    });

    let before = h.request(purchase_id).await;
    h.monitor.tick().await.unwrap();
    let after = h.request(purchase_id).await;

    assert_eq!(before.on_chain_state, after.on_chain_state);
    assert_eq!(
        before.next_action.requested_action,
        after.next_action.requested_action
    );
}

// --- Failure path: the ledger rejects the submission --- //

#[tokio::test]
async fn rejected_submission_parks_the_request() {
    let h = harness(Duration::from_secs(1_800)).await;
    let (_payment_id, identifier) = h
        .intents
        .create_payment(CreatePayment {
            payment_source_id: h.source.id,
            times: fixtures::future_times(),
            requested_funds: Funds(vec![AssetAmount::lovelace(
                Amount::try_from_i64(5_000_000).unwrap(),
            )]),
            collateral_return_lovelace: Amount::try_from_i64(2_000_000)
                .unwrap(),
            input_hash: INPUT_HASH.to_owned(),
            metadata: None,
            buyer_vkey: h.purchasing.vkey,
            buyer_address: h.purchasing.address.clone(),
        })
        .await
        .unwrap();
    let purchase_id = h
        .intents
        .create_purchase(CreatePurchase {
            payment_source_id: h.source.id,
            blockchain_identifier: identifier,
            times: fixtures::future_times(),
            paid_funds: Funds(vec![AssetAmount::lovelace(
                Amount::try_from_i64(5_000_000).unwrap(),
            )]),
            collateral_return_lovelace: Amount::try_from_i64(2_000_000)
                .unwrap(),
            input_hash: INPUT_HASH.to_owned(),
            metadata: None,
            seller_vkey: h.selling.vkey,
            seller_address: h.selling.address.clone(),
        })
        .await
        .unwrap();

    h.chain
        .fail_submissions(|| ChainError::Invalid("rejected".to_owned()));
    h.engine
        .tick(RequestedAction::FundsLockingRequested)
        .await
        .unwrap();

    let q = h.request(purchase_id).await;
    assert!(q.next_action.is_parked());
    assert!(h.wallet(h.purchasing.id).await.is_available());
    // Parked requests are invisible: another tick submits nothing.
    h.engine
        .tick(RequestedAction::FundsLockingRequested)
        .await
        .unwrap();
    assert!(h.chain.mempool_hashes().is_empty());
}

// --- Cancelling a purchase before it locks funds --- //

#[tokio::test]
async fn cancel_before_lock_needs_no_chain_action() {
    let h = harness(Duration::from_secs(1_800)).await;
    let (_payment_id, identifier) = h
        .intents
        .create_payment(CreatePayment {
            payment_source_id: h.source.id,
            times: fixtures::future_times(),
            requested_funds: Funds(vec![AssetAmount::lovelace(
                Amount::try_from_i64(5_000_000).unwrap(),
            )]),
            collateral_return_lovelace: Amount::try_from_i64(2_000_000)
                .unwrap(),
            input_hash: INPUT_HASH.to_owned(),
            metadata: None,
            buyer_vkey: h.purchasing.vkey,
            buyer_address: h.purchasing.address.clone(),
        })
        .await
        .unwrap();
    let purchase_id = h
        .intents
        .create_purchase(CreatePurchase {
            payment_source_id: h.source.id,
            blockchain_identifier: identifier,
            times: fixtures::future_times(),
            paid_funds: Funds(vec![AssetAmount::lovelace(
                Amount::try_from_i64(5_000_000).unwrap(),
            )]),
            collateral_return_lovelace: Amount::try_from_i64(2_000_000)
                .unwrap(),
            input_hash: INPUT_HASH.to_owned(),
            metadata: None,
            seller_vkey: h.selling.vkey,
            seller_address: h.selling.address.clone(),
        })
        .await
        .unwrap();

    h.intents.cancel_request(purchase_id).await.unwrap();
    let q = h.request(purchase_id).await;
    assert_eq!(q.next_action.requested_action, RequestedAction::None);

    // Nothing left for the lock handler to pick up.
    h.engine
        .tick(RequestedAction::FundsLockingRequested)
        .await
        .unwrap();
    assert!(h.chain.mempool_hashes().is_empty());

    // Once locking has started, cancellation is refused.
    assert!(h.intents.cancel_request(purchase_id).await.is_err());
}

// --- The collateral sits locked with the funds (invariant 3) --- //

#[tokio::test]
async fn locked_value_covers_funds_and_collateral() {
    let h = harness(Duration::from_secs(1_800)).await;
    let (_payment_id, purchase_id) = h.to_funds_locked().await;

    let q = h.request(purchase_id).await;
    let script_utxos = h
        .chain
        .fetch_utxos(&h.source.contract_address)
        .await
        .unwrap();
    assert_eq!(script_utxos.len(), 1);
    assert_eq!(
        script_utxos[0].lovelace().to_i64(),
        q.funds.total_lovelace().to_i64()
            + q.collateral_return_lovelace.to_i64()
    );
    assert!(script_utxos[0].lovelace() >= TOTAL_COLLATERAL);
}
