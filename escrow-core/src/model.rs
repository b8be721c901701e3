//! The persisted entity model.
//!
//! Entities reference each other by opaque id only; the engine resolves
//! references inside a single serializable store transaction and never holds
//! cross-entity pointers outside one.

use anyhow::ensure;
use serde::{Deserialize, Serialize};

use crate::{
    action::NextAction,
    amount::{Amount, Funds},
    constants::MIN_TIME_GAP,
    ids::{
        Address, BlockchainIdentifier, PaymentSourceId, RequestId,
        TransactionId, TxHash, Vkey, WalletId,
    },
    network::Network,
    state::{OnChainState, RequestSide, TxStatus, WalletKind},
    time::TimestampMs,
};

/// A configured escrow contract instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PaymentSource {
    pub id: PaymentSourceId,
    pub network: Network,
    /// The script address all of this source's escrow UTXOs live at.
    /// Derived from the compiled validator; unique with `network` among
    /// non-deleted sources.
    pub contract_address: Address,
    /// Base cooldown applied after each party action, in milliseconds.
    pub cooldown_ms: u64,
    /// Service fee taken from withdrawn funds, in permille (0..=1000).
    pub fee_rate_permille: u16,
    pub fee_receiver_address: Address,
    pub admin_addresses: [Address; 3],
    /// API key for the chain indexer backing this source.
    pub rpc_api_key: String,
    /// Set while an initial UTXO backfill is running; the source is skipped
    /// by all jobs until it clears.
    pub sync_in_progress: bool,
    pub disable_payment_at: Option<TimestampMs>,
    pub deleted_at: Option<TimestampMs>,
}

impl PaymentSource {
    /// Whether jobs should operate on this source at `now`.
    pub fn is_active(&self, now: TimestampMs) -> bool {
        self.deleted_at.is_none()
            && !self.sync_in_progress
            && self.disable_payment_at.is_none_or(|at| now < at)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.fee_rate_permille <= 1000,
            "fee_rate_permille must be <= 1000, got {}",
            self.fee_rate_permille,
        );
        Ok(())
    }
}

/// A service-custodied signing wallet.
///
/// Invariant: the wallet is *leased* iff `locked_at` is set; while leased, at
/// most one `pending_transaction_id` is attached, and both fields change
/// atomically inside one serializable store transaction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HotWallet {
    pub id: WalletId,
    pub payment_source_id: PaymentSourceId,
    pub kind: WalletKind,
    pub address: Address,
    pub vkey: Vkey,
    /// The wallet's 32-byte signing seed, sealed under the process
    /// encryption key (see [`crate::seal`]).
    pub sealed_seed: Vec<u8>,
    pub locked_at: Option<TimestampMs>,
    pub pending_transaction_id: Option<TransactionId>,
    pub deleted_at: Option<TimestampMs>,
}

impl HotWallet {
    #[inline]
    pub fn is_leased(&self) -> bool {
        self.locked_at.is_some()
    }

    /// Whether the wallet can be leased right now.
    pub fn is_available(&self) -> bool {
        self.locked_at.is_none()
            && self.pending_transaction_id.is_none()
            && self.deleted_at.is_none()
    }
}

/// A counterparty wallet descriptor (seller or buyer; not custodied).
/// Compound-unique on `(payment_source_id, vkey, address, kind)`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WalletBase {
    pub id: WalletId,
    pub payment_source_id: PaymentSourceId,
    pub address: Address,
    pub vkey: Vkey,
    pub kind: WalletKind,
}

/// Record of a submitted (or about-to-be-submitted) chain transaction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    /// `None` until the transaction has actually been handed to the chain.
    pub tx_hash: Option<TxHash>,
    pub status: TxStatus,
    /// The hot wallet whose lease this transaction blocks, if any.
    pub blocks_wallet_id: Option<WalletId>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

/// The party acting on a request. Cooldowns are tracked per-party.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Buyer,
    Seller,
}

impl Party {
    pub fn counterparty(self) -> Self {
        match self {
            Self::Buyer => Self::Seller,
            Self::Seller => Self::Buyer,
        }
    }
}

/// The four escrow deadlines, strictly increasing with a gap of at least
/// [`MIN_TIME_GAP`] between each consecutive pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestTimes {
    /// Funds must be locked by this time.
    pub pay_by_time: TimestampMs,
    /// The seller must submit a result by this time.
    pub submit_result_time: TimestampMs,
    /// After this time an undisputed result may be withdrawn by the seller.
    pub unlock_time: TimestampMs,
    /// After this time an unresolved refund request may be withdrawn by the
    /// buyer.
    pub external_dispute_unlock_time: TimestampMs,
}

impl RequestTimes {
    pub fn validate(&self) -> anyhow::Result<()> {
        let pairs = [
            ("pay_by_time", self.pay_by_time, self.submit_result_time),
            ("submit_result_time", self.submit_result_time, self.unlock_time),
            (
                "unlock_time",
                self.unlock_time,
                self.external_dispute_unlock_time,
            ),
        ];
        for (name, earlier, later) in pairs {
            ensure!(
                earlier.saturating_add(MIN_TIME_GAP) <= later,
                "{name} must precede the next deadline by at least \
                 {MIN_TIME_GAP:?}",
            );
        }
        Ok(())
    }
}

/// A payment (seller-side) or purchase (buyer-side) request: the central
/// entity the lifecycle engine drives through the escrow state machine.
///
/// The two sides are symmetrical and share this record type, discriminated by
/// `side`. A payment and its matching purchase share a
/// `blockchain_identifier` but are otherwise independent records, typically
/// living in different deployments.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EscrowRequest {
    pub id: RequestId,
    pub side: RequestSide,
    pub payment_source_id: PaymentSourceId,
    pub blockchain_identifier: BlockchainIdentifier,
    /// Hash of the agreed inputs, embedded in the datum.
    pub input_hash: String,
    /// Hash of the produced output, set once a result is submitted.
    pub result_hash: Option<String>,
    pub metadata: Option<String>,
    pub times: RequestTimes,
    /// Absolute instant after which the seller may act again. 0 = never
    /// acted.
    pub seller_cooldown_time: TimestampMs,
    /// Absolute instant after which the buyer may act again. 0 = never
    /// acted.
    pub buyer_cooldown_time: TimestampMs,
    /// `paid_funds` on the purchase side, `requested_funds` on the payment
    /// side.
    pub funds: Funds,
    /// Collateral returned to the buyer wallet on withdrawal.
    pub collateral_return_lovelace: Amount,
    /// Network fees accumulated by the buyer side across all transactions.
    pub total_buyer_fees: Amount,
    /// Network fees accumulated by the seller side across all transactions.
    pub total_seller_fees: Amount,
    /// The leased hot wallet driving this request's transactions.
    pub smart_contract_wallet_id: Option<WalletId>,
    /// Counterparty descriptor ids ([`WalletBase`]).
    pub seller_wallet_id: Option<WalletId>,
    pub buyer_wallet_id: Option<WalletId>,
    pub current_transaction_id: Option<TransactionId>,
    /// Superseded transactions, oldest first.
    pub transaction_history: Vec<TransactionId>,
    pub next_action: NextAction,
    /// `None` until the first confirmation is observed.
    pub on_chain_state: Option<OnChainState>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl EscrowRequest {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.times.validate()
    }

    pub fn cooldown_of(&self, party: Party) -> TimestampMs {
        match party {
            Party::Buyer => self.buyer_cooldown_time,
            Party::Seller => self.seller_cooldown_time,
        }
    }

    pub fn set_cooldown(&mut self, party: Party, at: TimestampMs) {
        match party {
            Party::Buyer => self.buyer_cooldown_time = at,
            Party::Seller => self.seller_cooldown_time = at,
        }
    }

    /// The party whose signature drives this request's transactions.
    pub fn own_party(&self) -> Party {
        match self.side {
            RequestSide::Payment => Party::Seller,
            RequestSide::Purchase => Party::Buyer,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn times(gaps_mins: [i64; 3]) -> RequestTimes {
        let t0 = 1_700_000_000_000i64;
        let t1 = t0 + gaps_mins[0] * 60_000;
        let t2 = t1 + gaps_mins[1] * 60_000;
        let t3 = t2 + gaps_mins[2] * 60_000;
        RequestTimes {
            pay_by_time: TimestampMs::try_from_ms(t0).unwrap(),
            submit_result_time: TimestampMs::try_from_ms(t1).unwrap(),
            unlock_time: TimestampMs::try_from_ms(t2).unwrap(),
            external_dispute_unlock_time: TimestampMs::try_from_ms(t3)
                .unwrap(),
        }
    }

    #[test]
    fn times_validation() {
        assert!(times([30, 90, 120]).validate().is_ok());
        assert!(times([5, 5, 5]).validate().is_ok());
        // A gap below five minutes is rejected.
        assert!(times([4, 90, 120]).validate().is_err());
        assert!(times([30, 0, 120]).validate().is_err());
    }

    #[test]
    fn party_counterparty() {
        assert_eq!(Party::Buyer.counterparty(), Party::Seller);
        assert_eq!(Party::Seller.counterparty(), Party::Buyer);
    }
}
