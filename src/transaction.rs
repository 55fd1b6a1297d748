//! Coarse-grained transactions built on top of the pool's reentrant mutex.
//!
//! `begin()` immediately acquires a crate-wide reentrant mutex under a
//! transaction-specific owner id and holds it until `commit`/`rollback`,
//! which is what gives the "second transaction's `begin()` blocks until the
//! first commits" behavior: distinct transactions are distinct owners, so
//! they queue FIFO on the same underlying [`ReentrantMutex`] that the worker
//! pool's internals also use for short-lived critical sections.
//!
//! Monotonic transaction ids are assigned the same way `CorrelationId`-style
//! identifiers are handed out elsewhere in this codebase: an `AtomicU64`
//! counter, no reuse, no wraparound handling needed at any realistic scale.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::command::{Command, Reply};
use crate::error::OctopusError;
use crate::mutex::{OwnerId, ReentrantMutex};
use crate::pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(u64);

/// Hands out monotonically increasing [`TransactionId`]s and owns the
/// reentrant mutex that gives transactions their serialized, all-or-nothing
/// execution window.
pub struct TransactionManager {
    pool: Arc<WorkerPool>,
    next_id: AtomicU64,
    gate: Arc<ReentrantMutex<()>>,
}

impl TransactionManager {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        TransactionManager { pool, next_id: AtomicU64::new(0), gate: Arc::new(ReentrantMutex::new(())) }
    }

    /// Starts a new transaction, blocking until no other transaction holds
    /// the gate.
    pub async fn begin(&self) -> Transaction {
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let owner = OwnerId::from_raw(id.0);
        // Held across every operation the transaction performs; released
        // only by commit() or rollback(). The guard itself carries no data
        // worth keeping (it derefs to `()`), so it is dropped immediately —
        // the hold is tracked inside the mutex, not by the guard's lifetime.
        self.gate.lock(owner).await;
        Transaction {
            id,
            owner,
            pool: self.pool.clone(),
            gate: self.gate.clone(),
            operations: Vec::new(),
            finished: false,
        }
    }
}

struct PendingOp {
    command: Command,
    priority: i64,
}

/// A sequence of operations executed against the pool under one held
/// transaction gate. Operations queue locally via [`Transaction::add_operation`]
/// and run in order on [`Transaction::commit`]; [`Transaction::rollback`]
/// discards them and releases the gate without running anything.
pub struct Transaction {
    id: TransactionId,
    owner: OwnerId,
    pool: Arc<WorkerPool>,
    gate: Arc<ReentrantMutex<()>>,
    operations: Vec<PendingOp>,
    finished: bool,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Queues `command` to run when this transaction commits.
    pub fn add_operation(&mut self, command: Command, priority: i64) -> Result<(), OctopusError> {
        if self.finished {
            return Err(OctopusError::AlreadyCommitted);
        }
        self.operations.push(PendingOp { command, priority });
        Ok(())
    }

    /// Runs every queued operation in order, then releases the transaction
    /// gate. Returns each operation's reply in submission order; a failure
    /// partway through still releases the gate before returning the error.
    pub async fn commit(mut self) -> Result<Vec<Reply>, OctopusError> {
        if self.finished {
            return Err(OctopusError::AlreadyCommitted);
        }
        self.finished = true;
        let ops = std::mem::take(&mut self.operations);
        let mut replies = Vec::with_capacity(ops.len());
        let mut failure = None;
        for op in ops {
            match self.pool.dispatch(op.command, op.priority, Duration::ZERO).await {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.release_gate();
        match failure {
            Some(e) => Err(e),
            None => Ok(replies),
        }
    }

    /// Discards every queued operation without running them and releases
    /// the transaction gate.
    pub fn rollback(mut self) -> Result<(), OctopusError> {
        if self.finished {
            return Err(OctopusError::AlreadyCommitted);
        }
        self.finished = true;
        self.operations.clear();
        self.release_gate();
        Ok(())
    }

    fn release_gate(&self) {
        let _ = self.gate.unlock(self.owner);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // A transaction dropped without an explicit commit/rollback (e.g.
        // the caller bailed out with `?`) must not leave the gate held
        // forever; treat it the same as an implicit rollback.
        if !self.finished {
            self.finished = true;
            self.release_gate();
        }
    }
}
