//! FIFO queue of acquirers parked while the pool is saturated

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::connection::ConnectionId;

/// What a parked acquirer can be woken with
pub(crate) enum Delivery<C> {
    /// A released connection, already registered as active for the waiter
    Connection { id: ConnectionId, conn: Arc<C> },
    /// A creation slot reserved for the waiter
    Capacity,
    /// The pool shut down
    Closed,
}

pub(crate) struct Waiter<C> {
    id: u64,
    pub enqueued_at: Instant,
    tx: oneshot::Sender<Delivery<C>>,
}

/// Pending acquirers, oldest first
pub(crate) struct WaitQueue<C> {
    waiters: VecDeque<Waiter<C>>,
    next_id: u64,
}

impl<C> WaitQueue<C> {
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Park a new acquirer at the back of the queue
    pub fn push(&mut self, now: Instant) -> (u64, oneshot::Receiver<Delivery<C>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.waiters.push_back(Waiter {
            id,
            enqueued_at: now,
            tx,
        });
        (id, rx)
    }

    /// Remove a waiter that gave up
    ///
    /// Returns `None` when the waiter was already served.
    pub fn remove(&mut self, id: u64) -> Option<Waiter<C>> {
        // Timed out waiters tend to sit near the front.
        let pos = self.waiters.iter().position(|w| w.id == id)?;
        self.waiters.remove(pos)
    }

    /// Wake the oldest waiter still listening
    ///
    /// `make` builds a fresh delivery for every attempt; deliveries refused
    /// by waiters whose receiver is gone are dropped. Returns the enqueue
    /// instant of the served waiter, or `None` if nobody was listening.
    pub fn deliver<M>(&mut self, mut make: M) -> Option<Instant>
    where
        M: FnMut() -> Delivery<C>,
    {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.send(make()).is_ok() {
                return Some(waiter.enqueued_at);
            }
        }
        None
    }

    /// Signal every waiter that the pool closed
    pub fn close_all(&mut self) -> Vec<Instant> {
        self.waiters
            .drain(..)
            .map(|waiter| {
                let _ = waiter.tx.send(Delivery::Closed);
                waiter.enqueued_at
            })
            .collect()
    }
}
