//! Resume-time ordered dispatch queue.
//!
//! A capacity-guarded min-heap keyed by `(resume_at, insertion_seq)`. The
//! sequence component makes the tie-break on equal resume times deterministic
//! and FIFO within a single process.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::error;

use crate::record::TaskRecord;

/// Errors raised when admitting work to the scheduler.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The scheduler is at capacity.
    #[error("scheduler is at capacity")]
    Full,
    /// The scheduler has been shut down.
    #[error("scheduler has been shut down")]
    Shutdown,
}

struct Entry {
    resume_at: DateTime<Utc>,
    seq: u64,
    record: Arc<TaskRecord>,
}

impl Entry {
    const fn key(&self) -> (DateTime<Utc>, u64) {
        (self.resume_at, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the std max-heap pops the earliest resume time first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Entry>,
    seq: u64,
    shutdown: bool,
}

/// FIFO-by-resume-time scheduler feeding the worker pool.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    capacity: usize,
}

impl Scheduler {
    /// Create a scheduler; `capacity` 0 means unbounded.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            capacity,
        }
    }

    /// Admit a task for dispatch no earlier than `resume_at`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Full`] at capacity and
    /// [`SchedulerError::Shutdown`] after shutdown.
    pub fn queue(
        &self,
        record: Arc<TaskRecord>,
        resume_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.lock_state();
        if state.shutdown {
            return Err(SchedulerError::Shutdown);
        }
        if self.capacity > 0 && state.heap.len() >= self.capacity {
            return Err(SchedulerError::Full);
        }
        state.seq += 1;
        let seq = state.seq;
        state.heap.push(Entry {
            resume_at,
            seq,
            record,
        });
        Ok(())
    }

    /// Pop the next runnable task, if any is due.
    ///
    /// A task whose resume time lies in the future stays in the heap; this
    /// is the suspension mechanism.
    #[must_use]
    pub fn request(&self) -> Option<Arc<TaskRecord>> {
        let mut state = self.lock_state();
        if state.shutdown {
            return None;
        }
        let due = state
            .heap
            .peek()
            .is_some_and(|entry| entry.resume_at <= Utc::now());
        if due {
            state.heap.pop().map(|entry| entry.record)
        } else {
            None
        }
    }

    /// Stop admitting work; idempotent.
    pub fn shutdown(&self) {
        self.lock_state().shutdown = true;
    }

    /// Whether the scheduler has been shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.lock_state().shutdown
    }

    /// Number of tasks waiting in the heap.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_state().heap.len()
    }

    /// Whether the heap is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_state().heap.is_empty()
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("scheduler mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}
