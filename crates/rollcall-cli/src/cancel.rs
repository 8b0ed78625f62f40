//! Cooperative cancellation shared between the signal handler and the
//! pipeline threads.
//!
//! Cancelling disconnects a channel that never carries a message, so a
//! token can sit in a `select!` next to a frame queue and wake the moment
//! the stop is requested.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Sending half, held by whoever may stop the pipeline. Dropping it also
/// cancels.
pub struct Canceller {
    tx: Mutex<Option<Sender<()>>>,
}

/// Receiving half, watched by the pipeline threads. Cheap to clone.
#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
}

pub fn cancel_pair() -> (Canceller, CancelToken) {
    let (tx, rx) = bounded(0);
    (Canceller { tx: Mutex::new(Some(tx)) }, CancelToken { rx })
}

impl Canceller {
    /// Request a stop. Idempotent.
    pub fn cancel(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for up to `duration`, waking early on cancellation.
    /// Returns true if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        matches!(self.rx.recv_timeout(duration), Err(RecvTimeoutError::Disconnected))
    }

    /// Becomes ready (disconnected) once cancelled. For `select!`.
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_cancel_reaches_every_token() {
        let (canceller, token) = cancel_pair();
        let other = token.clone();
        let cloned = token.clone();
        assert!(!token.is_cancelled());

        canceller.cancel();
        canceller.cancel();
        assert!(token.is_cancelled() && other.is_cancelled() && cloned.is_cancelled());
    }

    #[test]
    fn test_dropping_canceller_cancels() {
        let (canceller, token) = cancel_pair();
        drop(canceller);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let (canceller, token) = cancel_pair();
        let start = Instant::now();
        let sleeper = std::thread::spawn(move || token.sleep(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(50));
        canceller.cancel();
        assert!(sleeper.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_sleep_runs_out() {
        let (_canceller, token) = cancel_pair();
        assert!(!token.sleep(Duration::from_millis(30)));
    }
}
