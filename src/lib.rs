//! # OctopusDB
//!
//! An in-process, in-memory key-value store that dispatches single-key
//! commands across a fixed pool of worker execution contexts, each a
//! private `HashMap` with no cross-context locking.
//!
//! ## Architecture
//!
//! ```text
//! Octopus (facade)
//!     │  .set() / .get() / .incr() / ...
//!     ▼
//! WorkerPool.dispatch(command, priority, delay)
//!     │  command.key() hashed to one worker id (see pool::route_to_worker)
//!     ▼
//! that worker idle? ──► OccHandler: Idle -> Busy ──► ExecutionContext.execute()
//!     │                                                               │
//!     └─ busy ──► that worker's own TaskQueue.enqueue() (min-heap,    │
//!                 deduped by command)                                 │
//!                          supervisor drains that worker's queue      │
//!                          once it frees up ───────────────────────► ▼
//!                                                            Reply delivered via
//!                                                            a private oneshot, or
//!                                                            (if queued) a
//!                                                            digest-keyed one
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One key, one context** — `command.key()` is hashed to exactly one
//!    worker id for the life of the process, so every command for a given
//!    key contends for the same worker and no cross-context synchronization
//!    is needed for a single key's state.
//! 2. **Contexts never share state** — each [`ExecutionContext`] owns its
//!    store exclusively; there is no shared map behind a lock.
//! 3. **OCC guards metadata, not data** — worker lifecycle transitions
//!    (`Idle` → `Busy` → `Idle`) are version-checked so a racing supervisor
//!    and dispatcher can never both believe they own the same context.
//! 4. **The task queue is structurally deduplicating** — resubmitting an
//!    identical command is a no-op while the original is still queued,
//!    regardless of what priority or delay either call used; identity for
//!    dedup is the command alone.
//! 5. **A crashed context is replaced under the same id** — callers never
//!    see worker identity churn, only an occasional retry.
//!
//! ## What This Is Not
//!
//! OctopusDB is **not**:
//! - A persistent or replicated store — everything lives in process memory.
//! - A general pub/sub system — [`Octopus::on_operation`] is a flat
//!   after-the-fact listener list, not an event bus with subscriptions.
//! - A distributed transaction coordinator — [`Transaction`] serializes
//!   access within one process via a single gate, nothing more.
//!
//! ## Example
//!
//! ```ignore
//! use octopusdb::Octopus;
//!
//! #[tokio::main]
//! async fn main() {
//!     let db = Octopus::instance(None);
//!     db.set("greeting", "hello").await.unwrap();
//!     assert_eq!(db.get("greeting").await.unwrap(), Some("hello".to_string()));
//!
//!     let mut txn = db.begin_transaction().await;
//!     txn.add_operation(octopusdb::Command::Incr { key: "counter".into() }, 0).unwrap();
//!     txn.commit().await.unwrap();
//! }
//! ```

mod command;
mod config;
mod context;
mod error;
mod facade;
mod heap;
mod mutex;
mod occ;
mod pool;
mod queue;
mod transaction;

pub use command::{Command, Reply, TaskDigest, Value};
pub use config::Config;
pub use context::ExecutionContext;
pub use error::OctopusError;
pub use facade::Octopus;
pub use mutex::{OwnerId, ReentrantGuard, ReentrantMutex};
pub use occ::{OccHandler, WorkerId, WorkerMetadata, WorkerState};
pub use pool::WorkerPool;
pub use queue::{Task, TaskQueue};
pub use transaction::{Transaction, TransactionId, TransactionManager};
