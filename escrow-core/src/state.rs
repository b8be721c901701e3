use serde::{Deserialize, Serialize};

/// The escrow contract state of a request as last observed on-chain.
///
/// The first four variants correspond one-to-one with the datum's tagged
/// `state` constructor. The `*Withdrawn` variants are inferred by the chain
/// monitor when the escrow UTXO has been consumed; they have no datum
/// representation because the UTXO no longer exists.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[derive(strum::IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary, strum::VariantArray)
)]
pub enum OnChainState {
    /// The buyer's funds sit at the script address; the seller has not
    /// submitted a result.
    FundsLocked,
    /// The seller submitted a result hash; the buyer may dispute until
    /// `unlock_time`.
    ResultSubmitted,
    /// The buyer requested a refund before any result was submitted.
    RefundRequested,
    /// A result was submitted *and* a refund was requested; requires either a
    /// cancel, an authorization, or the external dispute timeout.
    Disputed,
    /// Terminal: the seller collected the funds.
    Withdrawn,
    /// Terminal: the buyer collected the refund.
    RefundWithdrawn,
    /// Terminal: an admin-authorized refund resolved the dispute.
    DisputedWithdrawn,
}

impl OnChainState {
    /// Whether this state has no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Withdrawn | Self::RefundWithdrawn | Self::DisputedWithdrawn
        )
    }
}

/// Status of a [`TransactionRecord`](crate::model::TransactionRecord).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[derive(strum::IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary, strum::VariantArray)
)]
pub enum TxStatus {
    /// Created locally; submitted or about to be submitted.
    Pending,
    /// Observed in a confirmed block.
    Confirmed,
    /// Rejected by the ledger, or dropped without confirmation.
    Failed,
}

impl TxStatus {
    /// Whether a wallet lease blocked on this transaction may be released.
    pub fn releases_lease(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

/// The role a hot wallet plays for its payment source.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary, strum::VariantArray)
)]
pub enum WalletKind {
    /// Signs seller-side interactions (submit result, authorize refund,
    /// collect completed).
    Selling,
    /// Signs buyer-side interactions (lock funds, request/cancel refund,
    /// collect refund).
    Purchasing,
    /// Receives withdrawn funds; never signs escrow interactions.
    Collection,
}

/// Which side of the escrow a request record represents.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary, strum::VariantArray)
)]
pub enum RequestSide {
    /// Seller side: we are owed the locked funds once a result is accepted.
    Payment,
    /// Buyer side: we locked the funds and may reclaim them via refund.
    Purchase,
}

impl RequestSide {
    /// The hot-wallet kind that signs for this side.
    pub fn wallet_kind(self) -> WalletKind {
        match self {
            Self::Payment => WalletKind::Selling,
            Self::Purchase => WalletKind::Purchasing,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::test_utils::roundtrip;

    use super::*;

    #[test]
    fn state_json_backwards_compat() {
        let expected_ser = r#"["funds_locked","result_submitted","refund_requested","disputed","withdrawn","refund_withdrawn","disputed_withdrawn"]"#;
        roundtrip::json_unit_enum_backwards_compat::<OnChainState>(
            expected_ser,
        );

        let expected_ser = r#"["pending","confirmed","failed"]"#;
        roundtrip::json_unit_enum_backwards_compat::<TxStatus>(expected_ser);

        let expected_ser = r#"["selling","purchasing","collection"]"#;
        roundtrip::json_unit_enum_backwards_compat::<WalletKind>(expected_ser);
    }

    #[test]
    fn terminal_states() {
        assert!(!OnChainState::FundsLocked.is_terminal());
        assert!(!OnChainState::Disputed.is_terminal());
        assert!(OnChainState::Withdrawn.is_terminal());
        assert!(OnChainState::RefundWithdrawn.is_terminal());
        assert!(OnChainState::DisputedWithdrawn.is_terminal());
    }
}
