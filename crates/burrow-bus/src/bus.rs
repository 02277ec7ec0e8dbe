//! Unbounded message inbox shared by every BURROW actor.
//!
//! A `Bus<T>` is the only way to reach an actor: producers call [`Bus::send`],
//! which enqueues and returns immediately, and the single consuming actor
//! drains the inbox from its worker loop. Delivery is in per-sender send
//! order; messages are never reordered and never dropped while the owning
//! actor is alive.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::time::{Duration, Instant};

/// Thread-safe, unbounded, order-preserving message inbox.
///
/// Cloning a bus produces another handle onto the same channel; by
/// convention exactly one actor consumes while any number of producers
/// send. Because every handle holds both halves of the channel, sends
/// cannot fail and a bus never observes disconnection.
///
/// # Examples
///
/// ```
/// use burrow_bus::Bus;
///
/// let bus = Bus::new();
/// bus.send(7u32);
/// assert_eq!(bus.recv(), 7);
/// ```
pub struct Bus<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Bus<T> {
    /// Create a new empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Enqueue a message for the owning actor.
    ///
    /// Never blocks and never drops: the queue is unbounded and every
    /// handle keeps the channel alive.
    pub fn send(&self, msg: T) {
        // Cannot disconnect: every handle holds both halves of the channel.
        let _ = self.tx.send(msg);
    }

    /// Block until the next message arrives.
    #[must_use]
    pub fn recv(&self) -> T {
        self.rx
            .recv()
            .unwrap_or_else(|_| unreachable!("bus channel disconnected"))
    }

    /// Block until the next message arrives or `timeout` elapses.
    ///
    /// Returns `None` on timeout.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                unreachable!("bus channel disconnected")
            }
        }
    }

    /// Block until the next message arrives or `deadline` passes.
    ///
    /// Returns `None` once the deadline has passed.
    #[must_use]
    pub fn recv_deadline(&self, deadline: Instant) -> Option<T> {
        let now = Instant::now();
        if deadline <= now {
            return self.try_recv();
        }
        self.recv_timeout(deadline - now)
    }

    /// Take the next message if one is already queued.
    #[must_use]
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Number of messages currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the inbox is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

// Manual impl: `T` does not need to be `Clone` for the handle to be.
impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Default for Bus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Bus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus").field("queued", &self.len()).finish()
    }
}
