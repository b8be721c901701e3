use serde::{Deserialize, Serialize};

/// The engine's intent for a request: which lifecycle handler (if any) should
/// pick it up next.
///
/// `*Requested` states are queues the selector drains; `*Initiated` states
/// mark a transaction in flight, owned by the chain monitor until it
/// confirms or fails.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[derive(strum::IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary, strum::VariantArray)
)]
pub enum RequestedAction {
    /// Nothing to do; the request is inert (e.g. cancelled before lock).
    None,
    /// Buyer side: lock the purchase funds into a fresh escrow UTXO.
    FundsLockingRequested,
    FundsLockingInitiated,
    /// The ball is in the counterparty's court; only the chain monitor or an
    /// external intent moves the request onward.
    WaitingForExternalAction,
    /// Parked for a human operator; see `NextAction::error_type`.
    WaitingForManualAction,
    /// Buyer side: transition the escrow to RefundRequested / Disputed.
    SetRefundRequested,
    SetRefundInitiated,
    /// Buyer side: cancel a previously requested refund.
    UnSetRefundRequested,
    UnSetRefundInitiated,
    /// Seller side: authorize the buyer's refund, returning the funds.
    AuthorizeRefundRequested,
    AuthorizeRefundInitiated,
    /// Seller side: record the result hash on-chain.
    SubmitResultRequested,
    SubmitResultInitiated,
    /// Seller side: collect the funds after `unlock_time`.
    WithdrawRequested,
    WithdrawInitiated,
    /// Buyer side: collect the refund after `external_dispute_unlock_time`.
    WithdrawRefundRequested,
    WithdrawRefundInitiated,
}

impl RequestedAction {
    /// The in-flight counterpart of a `*Requested` action, if it has one.
    pub fn initiated(self) -> Option<Self> {
        match self {
            Self::FundsLockingRequested => Some(Self::FundsLockingInitiated),
            Self::SetRefundRequested => Some(Self::SetRefundInitiated),
            Self::UnSetRefundRequested => Some(Self::UnSetRefundInitiated),
            Self::AuthorizeRefundRequested =>
                Some(Self::AuthorizeRefundInitiated),
            Self::SubmitResultRequested => Some(Self::SubmitResultInitiated),
            Self::WithdrawRequested => Some(Self::WithdrawInitiated),
            Self::WithdrawRefundRequested =>
                Some(Self::WithdrawRefundInitiated),
            _ => None,
        }
    }

    /// Whether a transaction for this request is currently in flight.
    pub fn is_initiated(self) -> bool {
        matches!(
            self,
            Self::FundsLockingInitiated
                | Self::SetRefundInitiated
                | Self::UnSetRefundInitiated
                | Self::AuthorizeRefundInitiated
                | Self::SubmitResultInitiated
                | Self::WithdrawInitiated
                | Self::WithdrawRefundInitiated
        )
    }
}

/// Why a request was parked for manual intervention. While set, the selector
/// never returns the request; an operator clears it via the admin surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary, strum::VariantArray)
)]
pub enum RequestErrorType {
    /// No wallet UTXO large enough to fund the transaction, or the locked
    /// value fell short.
    InsufficientFunds,
    /// The submitted transaction never appeared on-chain within the stuck
    /// threshold.
    TxDropped,
    /// The decoded on-chain datum did not match the request's fields.
    DatumMismatch,
    /// The escrow UTXO for this request could not be found.
    UtxoNotFound,
    /// The on-chain state does not admit the attempted transition.
    InvalidState,
    /// The ledger's dry-run evaluation of the transaction failed.
    ScriptEvaluationFailed,
    /// Anything else; see `error_note` for the formatted cause.
    Unknown,
}

/// The engine's intent record attached to every request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NextAction {
    pub requested_action: RequestedAction,
    /// The result hash an intent asked us to submit, carried until the
    /// submit-result handler embeds it in the datum.
    pub result_hash: Option<String>,
    pub error_type: Option<RequestErrorType>,
    pub error_note: Option<String>,
}

impl NextAction {
    pub fn new(requested_action: RequestedAction) -> Self {
        Self {
            requested_action,
            result_hash: None,
            error_type: None,
            error_note: None,
        }
    }

    /// A parked next action. The request becomes invisible to the selector
    /// until the error is cleared externally.
    pub fn parked(error_type: RequestErrorType, error_note: String) -> Self {
        Self {
            requested_action: RequestedAction::WaitingForManualAction,
            result_hash: None,
            error_type: Some(error_type),
            error_note: Some(error_note),
        }
    }

    #[inline]
    pub fn is_parked(&self) -> bool {
        self.error_type.is_some()
    }
}
