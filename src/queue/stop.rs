//! Stop token for producer and consumer loops.
//!
//! Loops check the signal between iterations and while sleeping. A blocking
//! pop that is already in flight is never interrupted: the consumer notices
//! the signal once the pop returns.

use tokio::sync::watch;

/// Raises the stop signal for every [`StopSignal`] created from it.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    /// Creates a handle whose signal is not raised yet.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Returns a signal observing this handle.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Raises the signal. Raising it twice is harmless.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a [`StopHandle`].
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl StopSignal {
    /// A signal that is never raised.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Returns whether the signal has been raised (non-blocking).
    pub fn is_raised(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Completes once the signal is raised.
    ///
    /// Never completes for [`StopSignal::never`] or when the handle was
    /// dropped without raising it.
    pub async fn raised(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            if rx.wait_for(|stopped| *stopped).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}
