//! Bounded hand-off queue between the acquisition thread and the matcher.
//!
//! For a live feed the newest frame matters more than a complete history, so
//! [`Producer::push_latest`] evicts the oldest entry when full. Replayed
//! sources use [`Producer::push_wait`] instead, which blocks until space
//! frees up. Dropping the [`Producer`] closes the queue.

use crate::cancel::CancelToken;
use crossbeam::channel::{bounded, select, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of [`Consumer::pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    Item(T),
    /// The producer is gone and every item has been taken.
    Closed,
    Cancelled,
}

pub struct Producer<T> {
    tx: Sender<T>,
    /// Second handle on the receiving end, used only to evict.
    evict: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

pub struct Consumer<T> {
    rx: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

/// Create a queue holding at most `capacity` items (at least one).
pub fn channel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        Producer {
            tx,
            evict: rx.clone(),
            dropped: Arc::clone(&dropped),
        },
        Consumer { rx, dropped },
    )
}

impl<T> Producer<T> {
    /// Enqueue, evicting the oldest item if full. Returns true if an item was evicted.
    pub fn push_latest(&self, mut item: T) -> bool {
        let mut evicted = false;
        loop {
            match self.tx.try_send(item) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return evicted,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    // The consumer may have taken the head in the meantime.
                    if self.evict.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        evicted = true;
                    }
                }
            }
        }
    }

    /// Enqueue, waiting for space. Returns false if cancelled first; the
    /// item is discarded.
    pub fn push_wait(&self, item: T, cancel: &CancelToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        select! {
            send(self.tx, item) -> sent => sent.is_ok(),
            recv(cancel.receiver()) -> _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }
}

impl<T> Consumer<T> {
    /// Take the oldest item, waiting until one arrives, the producer is
    /// dropped and the queue drained, or `cancel` fires.
    pub fn pop(&self, cancel: &CancelToken) -> Pop<T> {
        if cancel.is_cancelled() {
            return Pop::Cancelled;
        }
        select! {
            recv(self.rx) -> item => match item {
                Ok(item) => Pop::Item(item),
                Err(_) => Pop::Closed,
            },
            recv(cancel.receiver()) -> _ => Pop::Cancelled,
        }
    }

    /// Items evicted by [`Producer::push_latest`] so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.rx.len()
    }
}
