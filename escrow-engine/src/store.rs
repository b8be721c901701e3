//! Serializable persistence of requests, wallets, transactions, and payment
//! sources.
//!
//! [`MemoryStore`] is the process-local implementation: a single writer
//! mutex makes every transaction trivially serializable, transactions run
//! against a copy of the data and swap it in on commit (so a failed
//! transaction rolls back completely), and lock acquisition past `max_wait`
//! surfaces as [`StoreError::Conflict`]. Callers must not retry a
//! `Conflict` within the same scheduler tick.
//!
//! State-change events are buffered inside the transaction and published to
//! the observer bus only after commit, so observers never see a rolled-back
//! change.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use escrow_core::{
    action::RequestedAction,
    ids::{PaymentSourceId, RequestId, TransactionId, WalletId},
    model::{
        EscrowRequest, HotWallet, PaymentSource, TransactionRecord, WalletBase,
    },
    state::{RequestSide, TxStatus, WalletKind},
    time::TimestampMs,
};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::events::{StateEvent, StateEventBus};

/// Default bound on waiting for the store lock.
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);
/// Default bound on a transaction body's execution time.
const DEFAULT_TXN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not serialize with concurrent transactions in time.
    #[error("store transaction conflicted; do not retry within this tick")]
    Conflict,
    /// The transaction body exceeded its time budget.
    #[error("store transaction timed out")]
    Timeout,
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The wallet is leased or has a pending transaction attached.
    #[error("wallet {0} is busy")]
    WalletBusy(WalletId),
    /// An entity failed validation on write.
    #[error("invalid entity: {0}")]
    Invalid(String),
}

/// The full persisted state. [`MemoryStore::run_serializable`] hands a
/// mutable reference to a private copy of this to each transaction body.
#[derive(Clone, Default)]
pub struct StoreData {
    pub(crate) payment_sources: BTreeMap<PaymentSourceId, PaymentSource>,
    pub(crate) hot_wallets: BTreeMap<WalletId, HotWallet>,
    pub(crate) wallet_bases: BTreeMap<WalletId, WalletBase>,
    pub(crate) transactions: BTreeMap<TransactionId, TransactionRecord>,
    pub(crate) requests: BTreeMap<RequestId, EscrowRequest>,
    next_id: u64,
    /// Events buffered until commit.
    pending_events: Vec<StateEvent>,
}

impl StoreData {
    fn mint_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // --- Payment sources --- //

    pub fn insert_payment_source(
        &mut self,
        mut source: PaymentSource,
    ) -> Result<PaymentSourceId, StoreError> {
        source.validate().map_err(|e| StoreError::Invalid(e.to_string()))?;
        let duplicate = self.payment_sources.values().any(|existing| {
            existing.deleted_at.is_none()
                && existing.network == source.network
                && existing.contract_address == source.contract_address
        });
        if duplicate {
            return Err(StoreError::UniqueViolation(format!(
                "payment source ({}, {}) already exists",
                source.network, source.contract_address,
            )));
        }
        let id = PaymentSourceId(self.mint_id());
        source.id = id;
        self.payment_sources.insert(id, source);
        Ok(id)
    }

    pub fn get_payment_source(
        &self,
        id: PaymentSourceId,
    ) -> Result<&PaymentSource, StoreError> {
        self.payment_sources
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payment source {id}")))
    }

    /// Non-deleted, non-syncing, non-disabled sources.
    pub fn find_payment_sources_active(
        &self,
        now: TimestampMs,
    ) -> Vec<PaymentSource> {
        self.payment_sources
            .values()
            .filter(|source| source.is_active(now))
            .cloned()
            .collect()
    }

    // --- Hot wallets --- //

    pub fn insert_hot_wallet(
        &mut self,
        mut wallet: HotWallet,
    ) -> Result<WalletId, StoreError> {
        let id = WalletId(self.mint_id());
        wallet.id = id;
        self.hot_wallets.insert(id, wallet);
        Ok(id)
    }

    pub fn get_hot_wallet(
        &self,
        id: WalletId,
    ) -> Result<&HotWallet, StoreError> {
        self.hot_wallets
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("hot wallet {id}")))
    }

    pub(crate) fn get_hot_wallet_mut(
        &mut self,
        id: WalletId,
    ) -> Result<&mut HotWallet, StoreError> {
        self.hot_wallets
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("hot wallet {id}")))
    }

    /// Unleased, undeleted wallets of `kind` for `source`.
    pub fn available_hot_wallets(
        &self,
        source: PaymentSourceId,
        kind: WalletKind,
    ) -> Vec<HotWallet> {
        self.hot_wallets
            .values()
            .filter(|w| {
                w.payment_source_id == source
                    && w.kind == kind
                    && w.is_available()
            })
            .cloned()
            .collect()
    }

    /// The first wallet of `kind` for `source`, leased or not. Used to find
    /// the collection address.
    pub fn any_hot_wallet_of_kind(
        &self,
        source: PaymentSourceId,
        kind: WalletKind,
    ) -> Result<HotWallet, StoreError> {
        self.hot_wallets
            .values()
            .find(|w| {
                w.payment_source_id == source
                    && w.kind == kind
                    && w.deleted_at.is_none()
            })
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("{kind:?} wallet for {source}"))
            })
    }

    // --- Counterparty wallet descriptors --- //

    /// Insert-or-get by the compound unique key
    /// `(payment_source_id, vkey, address, kind)`.
    pub fn upsert_wallet_base(
        &mut self,
        base: WalletBase,
    ) -> Result<WalletId, StoreError> {
        if let Some(existing) = self.wallet_bases.values().find(|b| {
            b.payment_source_id == base.payment_source_id
                && b.vkey == base.vkey
                && b.address == base.address
                && b.kind == base.kind
        }) {
            return Ok(existing.id);
        }
        let id = WalletId(self.mint_id());
        self.wallet_bases.insert(id, WalletBase { id, ..base });
        Ok(id)
    }

    pub fn get_wallet_base(
        &self,
        id: WalletId,
    ) -> Result<&WalletBase, StoreError> {
        self.wallet_bases
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("wallet base {id}")))
    }

    // --- Transactions --- //

    pub fn insert_transaction(
        &mut self,
        mut transaction: TransactionRecord,
    ) -> TransactionId {
        let id = TransactionId(self.mint_id());
        transaction.id = id;
        self.transactions.insert(id, transaction);
        id
    }

    pub fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<&TransactionRecord, StoreError> {
        self.transactions
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {id}")))
    }

    /// Apply `f` to a transaction record, emitting a status-change event if
    /// the status changed. `source` attributes the event.
    pub fn update_transaction(
        &mut self,
        id: TransactionId,
        source: PaymentSourceId,
        now: TimestampMs,
        f: impl FnOnce(&mut TransactionRecord),
    ) -> Result<(), StoreError> {
        let transaction = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {id}")))?;
        let old_status = transaction.status;
        f(transaction);
        transaction.updated_at = now;

        let new_status = transaction.status;
        if old_status != new_status {
            if let Some(event) = StateEvent::transaction_status(
                id, source, old_status, new_status, now,
            ) {
                self.pending_events.push(event);
            }
        }
        Ok(())
    }

    // --- Requests --- //

    pub fn insert_request(
        &mut self,
        mut request: EscrowRequest,
    ) -> Result<RequestId, StoreError> {
        request.validate().map_err(|e| StoreError::Invalid(e.to_string()))?;
        let duplicate = self.requests.values().any(|existing| {
            existing.blockchain_identifier == request.blockchain_identifier
                && existing.side == request.side
        });
        if duplicate {
            return Err(StoreError::UniqueViolation(format!(
                "{:?} request for identifier {} already exists",
                request.side, request.blockchain_identifier,
            )));
        }
        let id = RequestId(self.mint_id());
        request.id = id;
        self.requests.insert(id, request);
        Ok(id)
    }

    pub fn get_request(
        &self,
        id: RequestId,
    ) -> Result<&EscrowRequest, StoreError> {
        self.requests
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("request {id}")))
    }

    /// Apply `f` to a request, emitting state-change events for any change
    /// of `requested_action` or `on_chain_state`.
    pub fn update_request(
        &mut self,
        id: RequestId,
        now: TimestampMs,
        f: impl FnOnce(&mut EscrowRequest),
    ) -> Result<(), StoreError> {
        let request = self
            .requests
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("request {id}")))?;
        let old_action = request.next_action.requested_action;
        let old_state = request.on_chain_state;
        f(request);
        request.updated_at = now;

        let side = request.side;
        let source = request.payment_source_id;
        let new_action = request.next_action.requested_action;
        let new_state = request.on_chain_state;

        if old_action != new_action {
            self.pending_events.push(StateEvent::request_action_changed(
                side, id, source, old_action, new_action, now,
            ));
        }
        if old_state != new_state {
            if let Some(new_state) = new_state {
                self.pending_events.push(StateEvent::request_state_changed(
                    side, id, source, old_state, new_state, now,
                ));
            }
        }
        Ok(())
    }

    /// Requests of `source` whose current transaction is pending and has
    /// been handed to the chain (tx hash known).
    pub fn requests_with_pending_tx(
        &self,
        source: PaymentSourceId,
    ) -> Vec<EscrowRequest> {
        self.requests
            .values()
            .filter(|r| r.payment_source_id == source)
            .filter(|r| {
                r.current_transaction_id
                    .and_then(|tx_id| self.transactions.get(&tx_id))
                    .is_some_and(|tx| {
                        tx.status == TxStatus::Pending && tx.tx_hash.is_some()
                    })
            })
            .cloned()
            .collect()
    }

    /// Requests of `source` that sit in `WaitingForExternalAction` with a
    /// non-terminal (or not yet observed) on-chain state. These are the
    /// requests whose state can change under us via counterparty
    /// transactions.
    pub fn requests_awaiting_external(
        &self,
        source: PaymentSourceId,
    ) -> Vec<EscrowRequest> {
        self.requests
            .values()
            .filter(|r| r.payment_source_id == source)
            .filter(|r| !r.next_action.is_parked())
            .filter(|r| {
                r.next_action.requested_action
                    == RequestedAction::WaitingForExternalAction
            })
            .filter(|r| !r.on_chain_state.is_some_and(|s| s.is_terminal()))
            .cloned()
            .collect()
    }
}

/// Handle to the process-local store. Clone freely; all clones share the
/// same underlying data and observer bus.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreData>>,
    bus: StateEventBus,
    max_wait: Duration,
    txn_timeout: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreData::default())),
            bus: StateEventBus::new(),
            max_wait: DEFAULT_MAX_WAIT,
            txn_timeout: DEFAULT_TXN_TIMEOUT,
        }
    }

    /// The observer bus fed by committed transactions.
    pub fn events(&self) -> &StateEventBus {
        &self.bus
    }

    /// Run `f` as one serializable transaction.
    ///
    /// `f` operates on a private copy of the data; on `Ok` the copy is
    /// swapped in and buffered events are published, on `Err` every write is
    /// discarded. Waiting on concurrent transactions past `max_wait` fails
    /// with [`StoreError::Conflict`]; a body running past the transaction
    /// timeout is rolled back with [`StoreError::Timeout`].
    pub async fn run_serializable<T>(
        &self,
        f: impl FnOnce(&mut StoreData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.run_serializable_with(self.max_wait, self.txn_timeout, f)
            .await
    }

    /// [`run_serializable`](Self::run_serializable) with explicit bounds.
    pub async fn run_serializable_with<T>(
        &self,
        max_wait: Duration,
        txn_timeout: Duration,
        f: impl FnOnce(&mut StoreData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard =
            match tokio::time::timeout(max_wait, self.inner.lock()).await {
                Ok(guard) => guard,
                Err(_elapsed) => return Err(StoreError::Conflict),
            };

        let mut copy = guard.clone();
        let started = Instant::now();
        let out = f(&mut copy)?;
        if started.elapsed() > txn_timeout {
            return Err(StoreError::Timeout);
        }

        let events = std::mem::take(&mut copy.pending_events);
        *guard = copy;
        drop(guard);

        for event in events {
            self.bus.publish(event);
        }
        Ok(out)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use escrow_core::{
        action::NextAction,
        amount::{Amount, AssetAmount, Funds},
        ids::{Address, BlockchainIdentifier},
        model::{RequestTimes, TransactionRecord},
        network::Network,
    };

    use super::*;
    use crate::events::EventKind;

    pub(crate) fn test_source() -> PaymentSource {
        PaymentSource {
            id: PaymentSourceId(0),
            network: Network::Test,
            contract_address: Address::new("script_test1abc".to_owned())
                .unwrap(),
            cooldown_ms: 600_000,
            fee_rate_permille: 50,
            fee_receiver_address: Address::new("addr_test1fee".to_owned())
                .unwrap(),
            admin_addresses: [
                Address::new("addr_test1adm1".to_owned()).unwrap(),
                Address::new("addr_test1adm2".to_owned()).unwrap(),
                Address::new("addr_test1adm3".to_owned()).unwrap(),
            ],
            rpc_api_key: "test-key".to_owned(),
            sync_in_progress: false,
            disable_payment_at: None,
            deleted_at: None,
        }
    }

    fn test_request(identifier: &str, side: RequestSide) -> EscrowRequest {
        let t0 = 1_700_000_000_000i64;
        EscrowRequest {
            id: RequestId(0),
            side,
            payment_source_id: PaymentSourceId(1),
            blockchain_identifier: BlockchainIdentifier::new(
                identifier.to_owned(),
            )
            .unwrap(),
            input_hash: "ab".repeat(32),
            result_hash: None,
            metadata: None,
            times: RequestTimes {
                pay_by_time: TimestampMs::try_from_ms(t0).unwrap(),
                submit_result_time: TimestampMs::try_from_ms(t0 + 1_800_000)
                    .unwrap(),
                unlock_time: TimestampMs::try_from_ms(t0 + 7_200_000).unwrap(),
                external_dispute_unlock_time: TimestampMs::try_from_ms(
                    t0 + 14_400_000,
                )
                .unwrap(),
            },
            seller_cooldown_time: TimestampMs::MIN,
            buyer_cooldown_time: TimestampMs::MIN,
            funds: Funds(vec![AssetAmount::lovelace(
                Amount::try_from_i64(5_000_000).unwrap(),
            )]),
            collateral_return_lovelace: Amount::try_from_i64(2_000_000)
                .unwrap(),
            total_buyer_fees: Amount::ZERO,
            total_seller_fees: Amount::ZERO,
            smart_contract_wallet_id: None,
            seller_wallet_id: None,
            buyer_wallet_id: None,
            current_transaction_id: None,
            transaction_history: Vec::new(),
            next_action: NextAction::new(
                RequestedAction::WaitingForExternalAction,
            ),
            on_chain_state: None,
            created_at: TimestampMs::try_from_ms(t0).unwrap(),
            updated_at: TimestampMs::try_from_ms(t0).unwrap(),
        }
    }

    #[tokio::test]
    async fn rollback_on_error() {
        let store = MemoryStore::new();
        let result = store
            .run_serializable(|data| {
                data.insert_payment_source(test_source())?;
                Err::<(), _>(StoreError::Invalid("boom".to_owned()))
            })
            .await;
        assert!(result.is_err());

        let sources = store
            .run_serializable(|data| {
                Ok(data.find_payment_sources_active(TimestampMs::now()))
            })
            .await
            .unwrap();
        assert!(sources.is_empty());
    }

    #[tokio::test]
    async fn unique_violations_surface() {
        let store = MemoryStore::new();
        store
            .run_serializable(|data| data.insert_payment_source(test_source()))
            .await
            .unwrap();
        let dup = store
            .run_serializable(|data| data.insert_payment_source(test_source()))
            .await;
        assert!(matches!(dup, Err(StoreError::UniqueViolation(_))));
    }

    #[tokio::test]
    async fn request_unique_per_side() {
        let store = MemoryStore::new();
        store
            .run_serializable(|data| {
                data.insert_request(test_request("bi-001", RequestSide::Payment))
            })
            .await
            .unwrap();
        // Same identifier on the other side is fine.
        store
            .run_serializable(|data| {
                data.insert_request(test_request(
                    "bi-001",
                    RequestSide::Purchase,
                ))
            })
            .await
            .unwrap();
        // Same identifier on the same side is not.
        let dup = store
            .run_serializable(|data| {
                data.insert_request(test_request("bi-001", RequestSide::Payment))
            })
            .await;
        assert!(matches!(dup, Err(StoreError::UniqueViolation(_))));
    }

    #[tokio::test]
    async fn events_publish_only_on_commit() {
        let store = MemoryStore::new();
        let (request_id, source_id) = store
            .run_serializable(|data| {
                let source_id = data.insert_payment_source(test_source())?;
                let mut request = test_request("bi-ev", RequestSide::Payment);
                request.payment_source_id = source_id;
                let request_id = data.insert_request(request)?;
                Ok((request_id, source_id))
            })
            .await
            .unwrap();

        let mut rx = store.events().subscribe();

        // A rolled-back change publishes nothing.
        let now = TimestampMs::now();
        let _ = store
            .run_serializable(|data| {
                data.update_request(request_id, now, |r| {
                    r.next_action =
                        NextAction::new(RequestedAction::SubmitResultRequested);
                })?;
                Err::<(), _>(StoreError::Invalid("rollback".to_owned()))
            })
            .await;

        // A committed change publishes exactly one action-change event.
        store
            .run_serializable(|data| {
                data.update_request(request_id, now, |r| {
                    r.next_action =
                        NextAction::new(RequestedAction::SubmitResultRequested);
                })
            })
            .await
            .unwrap();

        let event = rx.next().await.unwrap();
        assert_eq!(event.kind, EventKind::PaymentStateChanged);
        assert_eq!(event.payment_source_id, source_id);
        assert_eq!(event.old_state, Some("waiting_for_external_action"));
        assert_eq!(event.new_state, "submit_result_requested");
    }

    #[tokio::test]
    async fn transaction_status_events() {
        let store = MemoryStore::new();
        let now = TimestampMs::now();
        let (tx_id, source_id) = store
            .run_serializable(|data| {
                let source_id = data.insert_payment_source(test_source())?;
                let tx_id = data.insert_transaction(TransactionRecord {
                    id: TransactionId(0),
                    tx_hash: None,
                    status: TxStatus::Pending,
                    blocks_wallet_id: None,
                    created_at: now,
                    updated_at: now,
                });
                Ok((tx_id, source_id))
            })
            .await
            .unwrap();

        let mut rx = store.events().subscribe();
        store
            .run_serializable(|data| {
                data.update_transaction(tx_id, source_id, now, |tx| {
                    tx.status = TxStatus::Confirmed;
                })
            })
            .await
            .unwrap();

        let event = rx.next().await.unwrap();
        assert_eq!(event.kind, EventKind::TransactionConfirmed);
        assert_eq!(event.new_state, "confirmed");
    }
}
