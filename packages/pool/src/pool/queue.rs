// packages/pool/src/pool/queue.rs
//! Available-environment queue
//!
//! A bounded MPMC channel of environment ids. Producers (release, warm-up,
//! replacement) and consumers (acquire) synchronize through the channel
//! alone; the pool lock is never needed to enqueue or dequeue.
//!
//! Ids are hints, not ownership: a consumer must confirm under the pool
//! lock that the record is still `Available` before using it.

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Outcome of a blocking pop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopOutcome {
    Item(String),
    TimedOut,
    Cancelled,
}

/// Bounded FIFO of available environment ids
pub struct AvailableQueue {
    sender: Sender<String>,
    receiver: Receiver<String>,
    capacity: usize,

    /// Push counter
    push_count: AtomicU64,

    /// Pop counter
    pop_count: AtomicU64,

    /// Rejected pushes (queue full)
    drop_count: AtomicU64,
}

impl AvailableQueue {
    /// Create a queue holding at most `capacity` ids
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking; hands the id back when the queue is full
    pub fn push(&self, id: String) -> Result<(), String> {
        match self.sender.try_send(id) {
            Ok(()) => {
                self.push_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                Err(err.into_inner())
            }
        }
    }

    /// Dequeue without blocking
    pub fn try_pop(&self) -> Option<String> {
        match self.receiver.try_recv() {
            Ok(id) => {
                self.pop_count.fetch_add(1, Ordering::Relaxed);
                Some(id)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block until an id arrives, `deadline` passes or `cancel` fires
    ///
    /// `cancel` fires when a message arrives or its sender is dropped. A
    /// `None` deadline waits for an id or `cancel` only.
    pub fn pop_until(&self, deadline: Option<Instant>, cancel: &Receiver<()>) -> PopOutcome {
        let Some(deadline) = deadline else {
            return select! {
                recv(self.receiver) -> msg => self.received(msg.ok()),
                recv(cancel) -> _ => PopOutcome::Cancelled,
            };
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return match self.try_pop() {
                Some(id) => PopOutcome::Item(id),
                None => PopOutcome::TimedOut,
            };
        }

        select! {
            recv(self.receiver) -> msg => self.received(msg.ok()),
            recv(cancel) -> _ => PopOutcome::Cancelled,
            default(remaining) => PopOutcome::TimedOut,
        }
    }

    fn received(&self, id: Option<String>) -> PopOutcome {
        match id {
            Some(id) => {
                self.pop_count.fetch_add(1, Ordering::Relaxed);
                PopOutcome::Item(id)
            }
            None => PopOutcome::Cancelled,
        }
    }

    /// Take one specific id out of the queue, keeping the others
    ///
    /// Returns whether the id was found. Other ids are re-enqueued in their
    /// original order.
    pub fn remove(&self, id: &str) -> bool {
        let mut found = false;
        let drained: Vec<String> = self.receiver.try_iter().collect();

        for queued in drained {
            if !found && queued == id {
                found = true;
                continue;
            }
            // Capacity cannot be exceeded: we only put back what we took
            if self.sender.try_send(queued).is_err() {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
            }
        }

        if found {
            self.pop_count.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Remove and return every queued id
    pub fn drain(&self) -> Vec<String> {
        let drained: Vec<String> = self.receiver.try_iter().collect();
        self.pop_count
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    /// Whether `id` is currently queued
    pub fn contains(&self, id: &str) -> bool {
        let drained: Vec<String> = self.receiver.try_iter().collect();
        let found = drained.iter().any(|queued| queued == id);
        for queued in drained {
            let _ = self.sender.try_send(queued);
        }
        found
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.len(),
            capacity: self.capacity,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Total ids pushed
    pub push_count: u64,

    /// Total ids popped or removed
    pub pop_count: u64,

    /// Total pushes rejected because the queue was full
    pub drop_count: u64,

    /// Current queue size
    pub current_size: usize,

    /// Queue capacity
    pub capacity: usize,
}

impl QueueStats {
    /// Calculate fill percentage
    pub fn fill_percentage(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }
}
