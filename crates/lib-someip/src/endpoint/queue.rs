use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use super::PrepareStopHandler;

/// Bounded send queue shared between the caller side of an endpoint and
/// its writer task. Buffers may be coalesced into trains: enqueue with
/// `flush = false` appends to an open train which is sealed by the next
/// flushing enqueue, an explicit [`SendQueue::flush`], or hitting the
/// train size limit.
pub struct SendQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    max_train_size: usize,
}

struct QueueState {
    ready: VecDeque<Bytes>,
    train: BytesMut,
    stopping: Option<PrepareStopHandler>,
    closed: bool,
}

impl SendQueue {
    pub fn new(capacity: usize, max_train_size: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                train: BytesMut::new(),
                stopping: None,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            max_train_size,
        }
    }

    /// Admits a buffer. Returns `false` when the queue is full or the
    /// endpoint is shutting down.
    pub fn enqueue(&self, data: Bytes, flush: bool) -> bool {
        let mut state = self.state.lock().expect("send queue lock");
        if state.closed || state.stopping.is_some() {
            return false;
        }
        if state.ready.len() >= self.capacity {
            return false;
        }

        if state.train.is_empty() && (flush || data.len() >= self.max_train_size) {
            state.ready.push_back(data);
        } else {
            state.train.extend_from_slice(&data);
            if flush || state.train.len() >= self.max_train_size {
                let train = state.train.split().freeze();
                state.ready.push_back(train);
            }
        }

        drop(state);
        self.notify.notify_one();
        true
    }

    /// Seals the open train, if any.
    pub fn flush(&self) {
        let mut state = self.state.lock().expect("send queue lock");
        if !state.train.is_empty() {
            let train = state.train.split().freeze();
            state.ready.push_back(train);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Next buffer for the writer task; waits until one is available or
    /// the queue is drained while stopping.
    pub async fn dequeue(&self) -> Option<Bytes> {
        loop {
            {
                let mut state = self.state.lock().expect("send queue lock");
                if let Some(data) = state.ready.pop_front() {
                    return Some(data);
                }
                if state.closed {
                    return None;
                }
                if let Some(handler) = state.stopping.take() {
                    state.closed = true;
                    drop(state);
                    handler();
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Arms the drain fence: once every queued buffer has been dequeued,
    /// `handler` fires and the queue refuses further admissions. Fires
    /// immediately when the queue is already empty.
    pub fn prepare_stop(&self, handler: PrepareStopHandler) {
        let fire_now = {
            let mut state = self.state.lock().expect("send queue lock");
            if !state.train.is_empty() {
                let train = state.train.split().freeze();
                state.ready.push_back(train);
            }
            if state.ready.is_empty() && !state.closed {
                state.closed = true;
                true
            } else if state.closed {
                // Already stopped; complete the caller right away.
                true
            } else {
                state.stopping = Some(handler);
                return;
            }
        };
        if fire_now {
            handler();
        }
        self.notify.notify_one();
    }

    /// Drops all queued data and wakes the writer so it can observe the
    /// closed state.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("send queue lock");
        state.ready.clear();
        state.train.clear();
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Reopens a queue that was closed by a connection loss, keeping any
    /// retained buffers.
    pub fn reopen(&self) {
        let mut state = self.state.lock().expect("send queue lock");
        state.closed = false;
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("send queue lock").ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn admission_and_order() {
        let queue = SendQueue::new(2, 1024);
        assert!(queue.enqueue(Bytes::from_static(b"a"), true));
        assert!(queue.enqueue(Bytes::from_static(b"b"), true));
        assert!(!queue.enqueue(Bytes::from_static(b"c"), true));

        assert_eq!(queue.dequeue().await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(queue.dequeue().await.unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn coalesces_until_flush() {
        let queue = SendQueue::new(8, 1024);
        assert!(queue.enqueue(Bytes::from_static(b"aa"), false));
        assert!(queue.enqueue(Bytes::from_static(b"bb"), false));
        assert_eq!(queue.len(), 0);

        queue.flush();
        assert_eq!(queue.dequeue().await.unwrap(), Bytes::from_static(b"aabb"));
    }

    #[tokio::test]
    async fn prepare_stop_fires_after_drain() {
        let queue = Arc::new(SendQueue::new(8, 1024));
        let fired = Arc::new(AtomicBool::new(false));

        queue.enqueue(Bytes::from_static(b"x"), true);
        let fired2 = fired.clone();
        queue.prepare_stop(Box::new(move || {
            fired2.store(true, Ordering::SeqCst);
        }));
        assert!(!fired.load(Ordering::SeqCst));

        // queue rejects new work while stopping
        assert!(!queue.enqueue(Bytes::from_static(b"y"), true));

        assert_eq!(queue.dequeue().await.unwrap(), Bytes::from_static(b"x"));
        assert_eq!(queue.dequeue().await, None);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn prepare_stop_fires_immediately_when_idle() {
        let queue = SendQueue::new(8, 1024);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        queue.prepare_stop(Box::new(move || {
            fired2.store(true, Ordering::SeqCst);
        }));
        assert!(fired.load(Ordering::SeqCst));
    }
}
