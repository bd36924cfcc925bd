//! Latest-value broadcast used to fan detections out to consumers.
//!
//! The bus is deliberately lossy: a slow subscriber never queues stale
//! values, it simply observes the newest one when it next reads. Publishing
//! never blocks.

use tokio::sync::watch;

/// Single-producer, multi-consumer channel carrying only the latest value.
pub struct Bus<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Bus<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Replaces the current value. Never blocks, even with no subscribers.
    pub fn publish(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    /// Non-blocking read of the most recently published value.
    pub fn latest(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Attaches a subscriber. A value published before the subscription is
    /// still delivered on the first read if it is the current one.
    pub fn subscribe(&self) -> BusReceiver<T> {
        let mut rx = self.tx.subscribe();
        rx.mark_changed();
        BusReceiver { rx }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Bus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reading side of a [`Bus`].
pub struct BusReceiver<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> BusReceiver<T> {
    /// Yields the newest unseen value, waiting if the subscriber has already
    /// observed the current one. Returns `None` once the bus is dropped and
    /// every published value has been seen.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
            // Initial empty marker: keep waiting for a real publish.
        }
    }

    /// Non-blocking peek at the current value without consuming it.
    pub fn latest(&self) -> Option<T> {
        self.rx.borrow().clone()
    }
}
