//! State-change events published to observers.
//!
//! Every persisted change of a request's `requested_action` or
//! `on_chain_state`, and every transaction status change, produces one
//! [`StateEvent`] on the [`StateEventBus`] *after* the owning store
//! transaction commits, so observers never see a rolled-back change.
//! Delivery is fire-and-forget from the engine's point of view and
//! at-least-once per live subscriber; webhook retry bookkeeping is the
//! subscriber's own concern.

use escrow_core::{
    action::RequestedAction,
    ids::{PaymentSourceId, RequestId, TransactionId},
    state::{OnChainState, RequestSide, TxStatus},
    time::TimestampMs,
};
use tokio::sync::broadcast;
use tracing::warn;

/// How many events a slow subscriber may fall behind before it starts
/// losing them.
const EVENT_BUFFER: usize = 256;

/// What kind of state changed. The wire names are the public event names.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventKind {
    PaymentStateChanged,
    PurchaseStateChanged,
    TransactionConfirmed,
    TransactionFailed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PaymentStateChanged => "payment.state_changed",
            Self::PurchaseStateChanged => "purchase.state_changed",
            Self::TransactionConfirmed => "transaction.confirmed",
            Self::TransactionFailed => "transaction.failed",
        }
    }

    pub fn for_request_side(side: RequestSide) -> Self {
        match side {
            RequestSide::Payment => Self::PaymentStateChanged,
            RequestSide::Purchase => Self::PurchaseStateChanged,
        }
    }
}

/// One observed state change.
#[derive(Clone, Debug)]
pub struct StateEvent {
    pub kind: EventKind,
    /// Display form of the entity id (`req_7`, `txn_3`, ..).
    pub entity_id: String,
    pub payment_source_id: PaymentSourceId,
    pub old_state: Option<&'static str>,
    pub new_state: &'static str,
    pub timestamp: TimestampMs,
}

impl StateEvent {
    /// A request's `requested_action` changed.
    pub(crate) fn request_action_changed(
        side: RequestSide,
        request_id: RequestId,
        payment_source_id: PaymentSourceId,
        old: RequestedAction,
        new: RequestedAction,
        timestamp: TimestampMs,
    ) -> Self {
        Self {
            kind: EventKind::for_request_side(side),
            entity_id: request_id.to_string(),
            payment_source_id,
            old_state: Some(old.into()),
            new_state: new.into(),
            timestamp,
        }
    }

    /// A request's `on_chain_state` changed. `old` is `None` for the first
    /// observed confirmation.
    pub(crate) fn request_state_changed(
        side: RequestSide,
        request_id: RequestId,
        payment_source_id: PaymentSourceId,
        old: Option<OnChainState>,
        new: OnChainState,
        timestamp: TimestampMs,
    ) -> Self {
        Self {
            kind: EventKind::for_request_side(side),
            entity_id: request_id.to_string(),
            payment_source_id,
            old_state: old.map(Into::into),
            new_state: new.into(),
            timestamp,
        }
    }

    /// A transaction settled. Returns `None` while the new status is still
    /// `Pending`; only settlement is observable.
    pub(crate) fn transaction_status(
        transaction_id: TransactionId,
        payment_source_id: PaymentSourceId,
        old: TxStatus,
        new: TxStatus,
        timestamp: TimestampMs,
    ) -> Option<Self> {
        let kind = match new {
            TxStatus::Confirmed => EventKind::TransactionConfirmed,
            TxStatus::Failed => EventKind::TransactionFailed,
            TxStatus::Pending => return None,
        };
        Some(Self {
            kind,
            entity_id: transaction_id.to_string(),
            payment_source_id,
            old_state: Some(old.into()),
            new_state: new.into(),
            timestamp,
        })
    }
}

/// The observer bus. The store holds one and publishes committed events;
/// webhook and metric sinks subscribe. Cloning yields another handle onto
/// the same bus.
#[derive(Clone)]
pub struct StateEventBus {
    tx: broadcast::Sender<StateEvent>,
}

impl StateEventBus {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(EVENT_BUFFER).0,
        }
    }

    /// Publish one event. A no-op when nobody is subscribed, which is the
    /// common case for deployments without observers attached.
    pub fn publish(&self, event: StateEvent) {
        let _ = self.tx.send(event);
    }

    /// Start receiving events published after this point.
    pub fn subscribe(&self) -> StateEventRx {
        StateEventRx {
            rx: self.tx.subscribe(),
        }
    }
}

/// An owned subscription to the [`StateEventBus`].
pub struct StateEventRx {
    rx: broadcast::Receiver<StateEvent>,
}

impl StateEventRx {
    /// The next event, or `None` once the bus (and with it the store) has
    /// been dropped. A subscriber that lags behind the buffer loses the
    /// overwritten events and continues with the oldest retained one.
    pub async fn next(&mut self) -> Option<StateEvent> {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Closed) => return None,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Event subscriber lagged; lost {missed} event(s)");
                }
            }
        }
    }
}
