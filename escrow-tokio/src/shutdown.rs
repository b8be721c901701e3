use std::sync::Arc;

use tokio::sync::watch;

/// The process-wide shutdown latch.
///
/// Every job task holds a clone and selects on [`recv`]; the signal handler
/// (or a task failure) calls [`send`] exactly once, though repeated sends
/// are harmless. A handle cloned *after* the latch flipped still observes
/// the signal, which matters for tasks spawned late in startup.
///
/// Implemented over a [`watch`] channel holding a single `bool`. Each
/// handle owns both halves, so the channel can never close underneath a
/// waiter, and [`recv`] reduces to waiting for the value to become `true`.
///
/// [`send`]: Shutdown::send
/// [`recv`]: Shutdown::recv
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Flip the latch, waking every task blocked in [`recv`](Self::recv).
    pub fn send(&self) {
        self.tx.send_replace(true);
    }

    /// Wait until the latch flips. Completes immediately if it already has.
    pub async fn recv(&mut self) {
        // `self` holds a sender half, so the channel cannot be closed and
        // `wait_for` cannot fail.
        let _ = self.rx.wait_for(|flipped| *flipped).await;
    }

    /// Whether the latch has flipped, without waiting.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod test {
    use tokio_test::{assert_pending, assert_ready};

    use super::*;

    #[test]
    fn repeated_sends_are_harmless() {
        let shutdown = Shutdown::new();
        shutdown.send();
        shutdown.send();
        assert!(shutdown.try_recv());
    }

    #[test]
    fn recv_wakes_on_send() {
        let shutdown = Shutdown::new();
        let mut waiter = shutdown.clone();

        let mut recv = tokio_test::task::spawn(waiter.recv());
        assert_pending!(recv.poll());

        shutdown.send();
        assert!(recv.is_woken());
        assert_ready!(recv.poll());
    }

    #[test]
    fn late_clones_observe_the_signal() {
        let shutdown = Shutdown::new();
        shutdown.send();

        // Cloned after the flip; must still see it, repeatedly.
        let mut late = shutdown.clone();
        assert!(late.try_recv());
        let mut recv = tokio_test::task::spawn(late.recv());
        assert_ready!(recv.poll());
        drop(recv);
        let mut recv_again = tokio_test::task::spawn(late.recv());
        assert_ready!(recv_again.poll());
    }
}
