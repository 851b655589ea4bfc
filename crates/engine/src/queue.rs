// SPDX-FileCopyrightText: © 2025 WebMCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bounded per-subscriber output queue with asymmetric drop semantics.
//!
//! Every Cluster is pushed with a `force` flag. Non-force pushes (mid-GOP
//! Clusters) are dropped outright once the queue is full, so a slow reader
//! never makes the publisher-facing path block or grow without bound.
//! Force pushes (the header blob, keyframe Clusters) instead evict the
//! oldest pending chunk, since a subscriber that never receives a keyframe
//! can never start decoding at all.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::Notify;

/// Matches the original retransmitter's default backlog before a non-force
/// chunk is dropped rather than enqueued.
pub const DEFAULT_MAX_ENQUEUED_FRAMES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    Dropped,
    Closed,
}

struct Inner {
    queue: VecDeque<Bytes>,
    closed: bool,
}

/// A single subscriber's outbound byte queue. Shared between the channel
/// actor (producer) and the HTTP response body (consumer) via `Arc`.
pub struct SubscriberQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Non-suspending. `force` pushes always succeed, dropping the oldest
    /// queued chunk if necessary; non-force pushes fail once the queue is
    /// at capacity rather than growing it or blocking the caller.
    pub fn push(&self, chunk: Bytes, force: bool) -> PushOutcome {
        let mut inner = self.inner.lock().expect("subscriber queue mutex poisoned");
        if inner.closed {
            return PushOutcome::Closed;
        }
        if inner.queue.len() >= self.capacity {
            if force {
                inner.queue.pop_front();
            } else {
                return PushOutcome::Dropped;
            }
        }
        inner.queue.push_back(chunk);
        drop(inner);
        self.notify.notify_one();
        PushOutcome::Accepted
    }

    /// Marks the queue closed; any chunks already queued are still
    /// drained by [`Self::recv`], but no more will ever be accepted.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("subscriber queue mutex poisoned");
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Awaits and pops the next chunk. Returns `None` once closed and
    /// fully drained.
    pub async fn recv(&self) -> Option<Bytes> {
        loop {
            {
                let mut inner = self.inner.lock().expect("subscriber queue mutex poisoned");
                if let Some(chunk) = inner.queue.pop_front() {
                    return Some(chunk);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_force_push_drops_once_full() {
        let q = SubscriberQueue::new(2);
        assert_eq!(q.push(Bytes::from_static(b"a"), false), PushOutcome::Accepted);
        assert_eq!(q.push(Bytes::from_static(b"b"), false), PushOutcome::Accepted);
        assert_eq!(q.push(Bytes::from_static(b"c"), false), PushOutcome::Dropped);
    }

    #[test]
    fn force_push_evicts_the_oldest_entry() {
        let q = SubscriberQueue::new(2);
        q.push(Bytes::from_static(b"a"), false);
        q.push(Bytes::from_static(b"b"), false);
        assert_eq!(q.push(Bytes::from_static(b"c"), true), PushOutcome::Accepted);
    }

    #[tokio::test]
    async fn recv_drains_in_fifo_order_then_returns_none_after_close() {
        let q = SubscriberQueue::new(4);
        q.push(Bytes::from_static(b"a"), false);
        q.push(Bytes::from_static(b"b"), false);
        assert_eq!(q.recv().await, Some(Bytes::from_static(b"a")));
        q.close();
        assert_eq!(q.recv().await, Some(Bytes::from_static(b"b")));
        assert_eq!(q.recv().await, None);
    }

    #[test]
    fn push_after_close_is_rejected() {
        let q = SubscriberQueue::new(2);
        q.close();
        assert_eq!(q.push(Bytes::from_static(b"a"), true), PushOutcome::Closed);
    }
}
