//! Per-subscriber snapshot buffering.

use depot_core::ProgressSnapshot;
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Bounded snapshot buffer for one subscriber.
///
/// Publishing never blocks: under pressure the newest buffered
/// non-terminal snapshot is replaced by the incoming one (latest-wins),
/// so intermediate snapshots may be dropped but order and monotonicity
/// are preserved. A terminal snapshot is always enqueued.
pub(crate) struct SubscriberSlot {
    queue: Mutex<VecDeque<ProgressSnapshot>>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberSlot {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Enqueue a snapshot without blocking.
    pub(crate) fn push(&self, snapshot: ProgressSnapshot) {
        let terminal = snapshot.status.is_terminal();
        {
            let mut queue = self.queue.lock().unwrap();
            if terminal || queue.len() < self.capacity {
                queue.push_back(snapshot);
            } else if let Some(back) = queue.back_mut() {
                if back.status.is_terminal() {
                    // A terminal snapshot is already the last word; any
                    // publish after it is a bug upstream and is dropped.
                    return;
                }
                *back = snapshot;
            } else {
                queue.push_back(snapshot);
            }
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<ProgressSnapshot> {
        self.queue.lock().unwrap().pop_front()
    }
}

/// A stream of progress snapshots for one operation.
///
/// The first item is the snapshot current at subscription time; the
/// stream ends cleanly after yielding a terminal snapshot.
pub struct ProgressStream {
    inner: Pin<Box<dyn Stream<Item = ProgressSnapshot> + Send>>,
}

impl ProgressStream {
    pub(crate) fn new(slot: Arc<SubscriberSlot>) -> Self {
        let inner = async_stream::stream! {
            loop {
                match slot.pop() {
                    Some(snapshot) => {
                        let terminal = snapshot.status.is_terminal();
                        yield snapshot;
                        if terminal {
                            break;
                        }
                    }
                    None => slot.notify.notified().await,
                }
            }
        };
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl Stream for ProgressStream {
    type Item = ProgressSnapshot;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
