//! Due-queue of resolution tickets ordered by attempt time.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use crate::feed::FeedKey;
use crate::registry::ResolutionTicket;

/// Result of polling the queue at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePoll {
    Due(ResolutionTicket),
    WaitUntil(Instant),
    Empty,
}

#[derive(Debug)]
struct QueueEntry {
    due: Instant,
    stamp: u64,
    ticket: ResolutionTicket,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.stamp.cmp(&other.stamp))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    /// Stamp of the one live entry per key. Heap entries with any other
    /// stamp were replaced or cancelled and are dropped when they surface.
    live: HashMap<FeedKey, u64>,
    next_stamp: u64,
}

/// Priority queue of pending resolutions.
///
/// Holds at most one live entry per feed key. The lock is only held for
/// in-memory heap operations.
#[derive(Debug, Default)]
pub struct DueQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl DueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `ticket` at `due`, replacing any entry for the same key.
    pub fn schedule(&self, ticket: ResolutionTicket, due: Instant) {
        {
            let mut inner = self.inner.lock();
            let stamp = inner.next_stamp;
            inner.next_stamp += 1;
            inner.live.insert(ticket.public_key, stamp);
            inner.heap.push(Reverse(QueueEntry { due, stamp, ticket }));
        }
        self.notify.notify_one();
    }

    /// Drops the queued entry for `public_key`. Returns whether one existed.
    pub fn cancel(&self, public_key: &FeedKey) -> bool {
        self.inner.lock().live.remove(public_key).is_some()
    }

    /// Number of keys with a queued attempt.
    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pops the earliest entry if it is due at `now`.
    pub fn poll(&self, now: Instant) -> QueuePoll {
        let mut inner = self.inner.lock();
        loop {
            let (due, stamp, key) = match inner.heap.peek() {
                Some(Reverse(top)) => (top.due, top.stamp, top.ticket.public_key),
                None => return QueuePoll::Empty,
            };

            if inner.live.get(&key) != Some(&stamp) {
                inner.heap.pop();
                continue;
            }
            if due > now {
                return QueuePoll::WaitUntil(due);
            }

            inner.live.remove(&key);
            return match inner.heap.pop() {
                Some(Reverse(entry)) => QueuePoll::Due(entry.ticket),
                None => QueuePoll::Empty,
            };
        }
    }

    /// Waits for the next due ticket. Returns `None` once shutdown is signalled.
    pub async fn next_due(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<ResolutionTicket> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.poll(Instant::now()) {
                QueuePoll::Due(ticket) => {
                    if !self.is_empty() {
                        // Let another idle worker look at what is left.
                        self.notify.notify_one();
                    }
                    return Some(ticket);
                }
                QueuePoll::WaitUntil(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                        }
                    }
                }
                QueuePoll::Empty => {
                    tokio::select! {
                        _ = &mut notified => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                        }
                    }
                }
            }
        }
    }
}
