//! Explicit teardown for the background tasks of a [`RabbitClient`](crate::RabbitClient).
//!
//! Every supervisor and relay loop receives a [`ShutdownSignal`] when it is spawned.
//! The signal fires when [`Shutdown::trigger`] is called or when the [`Shutdown`] itself is
//! dropped, which is how a closed notification caused by our own teardown is told apart
//! from a close initiated by the broker.
use std::time::Duration;
use tokio::sync::watch;

/// The owning side of a shutdown signal.
#[derive(Debug)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

/// A cloneable handle to observe a [`Shutdown`].
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = watch::channel(false);
        (Self { sender }, ShutdownSignal { receiver })
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// `true` once shutdown has been requested or the [`Shutdown`] has been dropped.
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Resolves once shutdown has been requested.
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            // The sender is gone: nobody is left to keep us running.
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration`, waking up early on shutdown.
    ///
    /// Returns `true` if shutdown was requested.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.triggered() => true,
            _ = tokio::time::sleep(duration) => self.is_triggered(),
        }
    }
}
