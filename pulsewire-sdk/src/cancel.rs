//! One-shot cancellation shared by background tasks and subscriptions.

use tokio::sync::watch;

/// Create a linked canceller and signal.
///
/// The signal fires when [`Canceller::cancel`] is called or when the
/// canceller is dropped, so tying a canceller to a connection's lifetime is
/// enough to release everything waiting on it.
pub fn cancel_pair() -> (Canceller, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (Canceller { tx }, CancelSignal { rx })
}

/// The owning side of a cancellation pair.
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Another signal tied to this canceller.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// The observing side of a cancellation pair. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once cancelled. Returns immediately if already cancelled.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Canceller dropped.
                return;
            }
        }
    }
}
