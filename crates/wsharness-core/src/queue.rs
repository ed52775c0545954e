//! Inbound message queue.
//!
//! A monitor over a deque of decoded messages: one producer (the reader loop)
//! appends in arrival order, any number of consumers remove messages either
//! from the front or by predicate, waiting up to a deadline for one to arrive.
//!
//! # Thread Safety
//!
//! The deque sits behind a `std::sync::Mutex` that is never held across an
//! await point, so appends from the reader never wait on a consumer. Removal
//! happens under the same lock as the scan that selected the message, which is
//! what guarantees that a message goes to exactly one consumer.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct Queued {
    seq: u64,
    value: Value,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Queued>,
    next_seq: u64,
    closed: bool,
}

/// Arrival-ordered store of inbound messages.
#[derive(Debug, Default)]
pub struct MessageQueue {
    state: Mutex<QueueState>,
    arrived: Notify,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panicking predicate cannot leave the deque half-modified.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message and wake every waiting consumer.
    ///
    /// Returns `false`, dropping the message, once the queue has been closed.
    pub fn push(&self, value: Value) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            trace!("Queued inbound message #{}", seq);
            state.messages.push_back(Queued { seq, value });
        }
        self.arrived.notify_waiters();
        true
    }

    /// Stop accepting messages. Messages already queued stay retrievable.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the oldest message, waiting up to `timeout` for one to arrive.
    pub async fn pop_front(&self, timeout: Duration) -> Option<Value> {
        self.find_first_matching(timeout, |_| true).await
    }

    /// Remove the oldest message satisfying `predicate`, waiting up to
    /// `timeout` for one to arrive.
    ///
    /// Messages that do not match are left in place, in order. The predicate
    /// is re-evaluated over the whole queue after every arrival.
    pub async fn find_first_matching<P>(&self, timeout: Duration, mut predicate: P) -> Option<Value>
    where
        P: FnMut(&Value) -> bool,
    {
        // `None` when the timeout is too large to represent; wait indefinitely.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            // Register for the next arrival before scanning, so a push that
            // lands between the scan and the wait is not missed.
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if let Some(value) = self.take_first(&mut predicate) {
                return Some(value);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                        return None;
                    }
                }
                None => arrived.await,
            }
        }
    }

    /// Scan and remove without waiting.
    pub fn try_take<P>(&self, mut predicate: P) -> Option<Value>
    where
        P: FnMut(&Value) -> bool,
    {
        self.take_first(&mut predicate)
    }

    fn take_first<P>(&self, predicate: &mut P) -> Option<Value>
    where
        P: FnMut(&Value) -> bool,
    {
        let mut state = self.lock();
        let index = state.messages.iter().position(|m| predicate(&m.value))?;
        let taken = state.messages.remove(index)?;
        trace!("Delivered inbound message #{}", taken.seq);
        Some(taken.value)
    }
}
