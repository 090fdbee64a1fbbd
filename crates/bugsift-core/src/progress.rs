//! Progress delivery and cooperative cancellation for the ingest pass.
//!
//! The channel is bounded and lossy on the sender side: when the consumer
//! falls behind, the oldest pending event is dropped so the ingest thread
//! never blocks on reporting.

use crate::types::ParseProgress;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag. Cloning shares the flag; the ingest pass
/// observes it between line batches and unwinds cleanly.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

struct Shared {
    queue: Mutex<ChannelState>,
    available: Condvar,
    capacity: usize,
}

struct ChannelState {
    events: VecDeque<ParseProgress>,
    senders: usize,
}

/// Create a bounded progress channel with the given capacity.
pub fn channel(capacity: usize) -> (ProgressSender, ProgressReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(ChannelState {
            events: VecDeque::with_capacity(capacity),
            senders: 1,
        }),
        available: Condvar::new(),
        capacity: capacity.max(1),
    });
    (
        ProgressSender {
            shared: Arc::clone(&shared),
        },
        ProgressReceiver { shared },
    )
}

pub struct ProgressSender {
    shared: Arc<Shared>,
}

impl ProgressSender {
    /// Enqueue an event without blocking. Drops the oldest pending event
    /// when the queue is full.
    pub fn send(&self, event: ParseProgress) {
        let mut state = self.shared.queue.lock();
        if state.events.len() >= self.shared.capacity {
            state.events.pop_front();
        }
        state.events.push_back(event);
        drop(state);
        self.shared.available.notify_one();
    }
}

impl Clone for ProgressSender {
    fn clone(&self) -> Self {
        self.shared.queue.lock().senders += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for ProgressSender {
    fn drop(&mut self) {
        let mut state = self.shared.queue.lock();
        state.senders -= 1;
        if state.senders == 0 {
            drop(state);
            self.shared.available.notify_all();
        }
    }
}

pub struct ProgressReceiver {
    shared: Arc<Shared>,
}

impl ProgressReceiver {
    /// Block until an event arrives. Returns `None` once every sender is
    /// gone and the queue is drained.
    pub fn recv(&self) -> Option<ParseProgress> {
        let mut state = self.shared.queue.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.senders == 0 {
                return None;
            }
            self.shared.available.wait(&mut state);
        }
    }

    /// Non-blocking poll.
    pub fn try_recv(&self) -> Option<ParseProgress> {
        self.shared.queue.lock().events.pop_front()
    }
}

impl Iterator for ProgressReceiver {
    type Item = ParseProgress;

    fn next(&mut self) -> Option<ParseProgress> {
        self.recv()
    }
}
