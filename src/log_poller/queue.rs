//! Queue between the poller and the consumer with high/low watermark flow control.
//!
//! The sender stops once `high` items are pending and stays stopped until the consumer has
//! drained the queue down to `low`. The hysteresis keeps a slow consumer from turning into a
//! stream of single-item wake-ups for the poller.

use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::{Context, Poll, ready},
};

use tokio::sync::{Notify, mpsc};
use tokio_stream::Stream;

#[derive(Debug)]
struct Shared {
    pending: AtomicUsize,
    paused: AtomicBool,
    high: usize,
    low: usize,
    drained: Notify,
}

/// Producing half. There is exactly one producer per queue.
#[derive(Debug)]
pub(crate) struct Sender<T> {
    tx: mpsc::UnboundedSender<T>,
    shared: Arc<Shared>,
}

/// Consuming half, usable as a [`Stream`].
#[derive(Debug)]
pub struct Receiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    shared: Arc<Shared>,
}

/// The consumer is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Closed;

/// Create a queue that pauses its sender at `high` pending items and resumes it at `low`.
///
/// Callers validate `low < high`.
pub(crate) fn channel<T>(high: usize, low: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        pending: AtomicUsize::new(0),
        paused: AtomicBool::new(false),
        high,
        low,
        drained: Notify::new(),
    });
    (Sender { tx, shared: Arc::clone(&shared) }, Receiver { rx, shared })
}

impl<T> Sender<T> {
    /// Wait until the queue accepts items again.
    pub async fn ready(&self) -> Result<(), Closed> {
        let shared = &self.shared;
        if shared.pending.load(Ordering::Acquire) >= shared.high &&
            !shared.paused.swap(true, Ordering::AcqRel)
        {
            debug!(pending = shared.high, "Queue reached high watermark, pausing poller");
        }

        while shared.paused.load(Ordering::Acquire) {
            if self.tx.is_closed() {
                return Err(Closed);
            }
            if shared.pending.load(Ordering::Acquire) <= shared.low {
                shared.paused.store(false, Ordering::Release);
                debug!(low = shared.low, "Queue drained to low watermark, resuming poller");
                break;
            }
            shared.drained.notified().await;
        }

        if self.tx.is_closed() { Err(Closed) } else { Ok(()) }
    }

    /// Enqueue `item`, waiting first if the queue is paused.
    pub async fn send(&self, item: T) -> Result<(), Closed> {
        self.ready().await?;
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(item).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(Closed);
        }
        Ok(())
    }
}

impl<T> Receiver<T> {
    /// Items waiting to be consumed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Receive the next item, or `None` once the sender is gone and the queue is empty.
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.consumed();
        }
        item
    }

    fn consumed(&self) {
        let remaining = self.shared.pending.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if remaining <= self.shared.low {
            self.shared.drained.notify_one();
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.rx.close();
        self.shared.drained.notify_one();
    }
}

impl<T> Stream for Receiver<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = ready!(self.rx.poll_recv(cx));
        if item.is_some() {
            self.consumed();
        }
        Poll::Ready(item)
    }
}
