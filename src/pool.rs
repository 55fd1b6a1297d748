//! The worker pool: dispatches single-key commands across a fixed set of
//! execution contexts, each running in its own task.
//!
//! A command's key is routed to exactly one worker id by hashing
//! (`route_to_worker`), so every command for a given key always contends for
//! the same [`crate::context::ExecutionContext`] — that worker's own
//! [`TaskQueue`] holds whatever can't run immediately. Claiming a worker is
//! a version-checked `Idle -> Busy` transition via [`OccHandler`]; no
//! separate "which ids are free" index is needed since a routed dispatch
//! only ever asks about the one id it was hashed to. A crashed context (its
//! inbox channel found closed) is replaced in place under the same id,
//! mirroring `dispatch.rs`'s `AssertUnwindSafe(...).catch_unwind()` approach
//! to keeping one failure from taking down the whole pool.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::command::{Command, Reply, TaskDigest};
use crate::context::ExecutionContext;
use crate::error::OctopusError;
use crate::occ::{OccHandler, WorkerId, WorkerMetadata, WorkerState};
use crate::queue::TaskQueue;

/// Bound on retries when an `Idle -> Busy` OCC transition loses a race.
const MAX_CLAIM_RETRIES: u32 = 3;

/// Per-worker inbox depth; a worker handles one command at a time, so a
/// small buffer is enough to let a handoff be sent without waiting for the
/// worker to finish draining its previous message.
const WORKER_INBOX_CAPACITY: usize = 4;

enum WorkerMessage {
    Run {
        digest: TaskDigest,
        command: Command,
        busy_version: u64,
        /// Present only for a command that claimed its worker directly
        /// (bypassing the queue); the reply goes straight back to that one
        /// caller instead of through the digest-keyed `pending` table, which
        /// exists for queue-level dedup fan-out and nothing else.
        reply: Option<oneshot::Sender<Result<Reply, OctopusError>>>,
    },
    Shutdown,
}

struct Completion {
    worker: WorkerId,
    digest: TaskDigest,
    busy_version: u64,
    result: Result<Reply, OctopusError>,
}

struct WorkerHandle {
    tx: mpsc::Sender<WorkerMessage>,
    join: JoinHandle<()>,
}

struct PoolInner {
    occ: OccHandler,
    worker_count: u32,
    workers: DashMap<WorkerId, WorkerHandle>,
    /// One queue per worker, indexed by worker id. A command's queued
    /// fallback lives on its routed worker's own queue, never a shared one.
    queues: Vec<TaskQueue>,
    pending: DashMap<TaskDigest, Vec<oneshot::Sender<Result<Reply, OctopusError>>>>,
    completions_tx: mpsc::Sender<Completion>,
    shutting_down: AtomicBool,
}

/// A fixed-size pool of execution contexts, each single-threaded and
/// exclusively owned by its worker task.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    supervisor: JoinHandle<()>,
}

impl WorkerPool {
    pub fn new(worker_count: u32) -> Self {
        Self::with_capacity(worker_count, None)
    }

    /// Like [`WorkerPool::new`], but bounds each worker's own task queue at
    /// `queue_capacity` entries (`None` leaves it unbounded).
    pub fn with_capacity(worker_count: u32, queue_capacity: Option<usize>) -> Self {
        let (completions_tx, completions_rx) = mpsc::channel(worker_count.max(1) as usize * 4);
        let occ = OccHandler::new();
        let workers = DashMap::new();
        for id in 0..worker_count {
            occ.insert(WorkerMetadata::new(id));
            let (tx, inbox) = mpsc::channel(WORKER_INBOX_CAPACITY);
            let join = spawn_worker(id, inbox, completions_tx.clone());
            workers.insert(id, WorkerHandle { tx, join });
        }
        let queues = (0..worker_count).map(|_| TaskQueue::with_capacity(queue_capacity)).collect();

        let inner = Arc::new(PoolInner {
            occ,
            worker_count,
            workers,
            queues,
            pending: DashMap::new(),
            completions_tx,
            shutting_down: AtomicBool::new(false),
        });

        let supervisor = tokio::spawn(run_supervisor(inner.clone(), completions_rx));
        WorkerPool { inner, supervisor }
    }

    /// Dispatches `command` for execution, returning its reply once an
    /// execution context has run it.
    ///
    /// `command.key()` is hashed to the one worker id that ever handles that
    /// key (see [`route_to_worker`]). If that worker is idle and `delay` is
    /// zero, the command runs on it immediately; otherwise it is placed on
    /// that worker's own task queue at `priority`, and the returned future
    /// resolves once the supervisor hands it over after the worker frees up.
    pub async fn dispatch(&self, command: Command, priority: i64, delay: Duration) -> Result<Reply, OctopusError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(OctopusError::ShuttingDown);
        }

        let worker_id = route_to_worker(command.key(), self.inner.worker_count);
        let digest = TaskDigest::of(&command);

        if delay == Duration::ZERO {
            if let Some(busy_version) = claim_worker(&self.inner, worker_id).await {
                let (tx, rx) = oneshot::channel();
                send_run(&self.inner, worker_id, busy_version, digest, command, Some(tx)).await;
                return rx.await.unwrap_or(Err(OctopusError::Cancelled));
            }
        }

        let (tx, rx) = oneshot::channel();
        self.inner.pending.entry(digest.clone()).or_default().push(tx);
        self.inner.queues[worker_id as usize].enqueue(command, priority, delay).await?;
        rx.await.unwrap_or(Err(OctopusError::Cancelled))
    }

    /// The number of worker contexts in the pool.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Forcibly aborts a worker's task without running its shutdown path,
    /// simulating a crash so the pool's replacement logic can be exercised.
    pub fn simulate_worker_crash(&self, id: WorkerId) {
        if let Some(handle) = self.inner.workers.get(&id) {
            handle.join.abort();
        }
    }

    /// Stops accepting new work, signals every worker to stop, and waits for
    /// them to finish their current command (if any) before returning.
    pub async fn shutdown(self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let worker_ids: Vec<WorkerId> = self.inner.workers.iter().map(|e| *e.key()).collect();
        for id in &worker_ids {
            if let Some(handle) = self.inner.workers.get(id) {
                let _ = handle.tx.send(WorkerMessage::Shutdown).await;
            }
        }
        for id in worker_ids {
            if let Some((_, handle)) = self.inner.workers.remove(&id) {
                let _ = handle.join.await;
            }
        }
        self.supervisor.abort();
    }
}

/// Hashes `key` to a worker id in `0..worker_count`. Deterministic for the
/// life of the process: the same key always maps to the same id, which is
/// what gives every command for that key exclusive access to one
/// [`crate::context::ExecutionContext`] with no cross-context locking.
fn route_to_worker(key: &str, worker_count: u32) -> WorkerId {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % worker_count as u64) as WorkerId
}

/// Attempts the version-checked `Idle -> Busy` transition for `worker_id`
/// specifically — never "any idle worker", since routing already decided
/// which one this command belongs to.
async fn claim_worker(inner: &Arc<PoolInner>, worker_id: WorkerId) -> Option<u64> {
    for attempt in 0..MAX_CLAIM_RETRIES {
        let current = inner.occ.get(worker_id)?;
        if current.state != WorkerState::Idle {
            return None;
        }
        match inner.occ.perform(worker_id, current.version, |m| {
            m.state = WorkerState::Busy;
            Ok(())
        }) {
            Ok(()) => return Some(current.version + 1),
            Err(OctopusError::Conflict(..)) if attempt + 1 < MAX_CLAIM_RETRIES => continue,
            Err(_) => return None,
        }
    }
    None
}

async fn send_run(
    inner: &Arc<PoolInner>,
    worker_id: WorkerId,
    mut busy_version: u64,
    digest: TaskDigest,
    command: Command,
    mut reply: Option<oneshot::Sender<Result<Reply, OctopusError>>>,
) {
    loop {
        let msg = WorkerMessage::Run { digest: digest.clone(), command: command.clone(), busy_version, reply: reply.take() };
        let outcome = match inner.workers.get(&worker_id) {
            Some(handle) => handle.tx.send(msg).await,
            None => Err(mpsc::error::SendError(msg)),
        };
        match outcome {
            Ok(()) => return,
            Err(mpsc::error::SendError(WorkerMessage::Run { reply: returned_reply, .. })) => {
                reply = returned_reply;
                tracing::warn!(worker_id, "worker inbox closed; replacing crashed worker");
                busy_version = replace_worker(inner, worker_id).await;
            }
            Err(mpsc::error::SendError(WorkerMessage::Shutdown)) => unreachable!("we only ever send Run here"),
        }
    }
}

async fn replace_worker(inner: &Arc<PoolInner>, id: WorkerId) -> u64 {
    let (tx, inbox) = mpsc::channel(WORKER_INBOX_CAPACITY);
    let join = spawn_worker(id, inbox, inner.completions_tx.clone());
    inner.workers.insert(id, WorkerHandle { tx, join });
    inner.occ.insert(WorkerMetadata::new(id));
    inner
        .occ
        .perform(id, 0, |m| {
            m.state = WorkerState::Busy;
            Ok(())
        })
        .expect("freshly inserted worker record is at version 0");
    1
}

fn spawn_worker(id: WorkerId, mut inbox: mpsc::Receiver<WorkerMessage>, completions: mpsc::Sender<Completion>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ctx = ExecutionContext::new();
        loop {
            // Race the inbox against the soonest outstanding TTL deadline so
            // a key nobody reads is still collected eagerly, bounded by its
            // own expiry rather than by the next unrelated command.
            let msg = match ctx.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        msg = inbox.recv() => msg,
                        _ = tokio::time::sleep_until(deadline) => {
                            ctx.sweep_expired();
                            continue;
                        }
                    }
                }
                None => inbox.recv().await,
            };
            let Some(msg) = msg else { break };
            match msg {
                WorkerMessage::Run { digest, command, busy_version, reply } => {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| ctx.execute(&command)))
                        .unwrap_or_else(|panic| Err(OctopusError::OperationFailed(anyhow::anyhow!(panic_message(&panic)))));
                    if let Some(reply_tx) = reply {
                        let _ = reply_tx.send(clone_result(&result));
                    }
                    if completions.send(Completion { worker: id, digest, busy_version, result }).await.is_err() {
                        break;
                    }
                }
                WorkerMessage::Shutdown => break,
            }
        }
    })
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "execution context panicked".to_string()
    }
}

async fn run_supervisor(inner: Arc<PoolInner>, mut completions_rx: mpsc::Receiver<Completion>) {
    while let Some(completion) = completions_rx.recv().await {
        let _ = inner.occ.perform(completion.worker, completion.busy_version, |m| {
            m.state = WorkerState::Idle;
            Ok(())
        });

        // Only ever populated by the queue path (see `dispatch`); a command
        // that claimed its worker directly already got its answer through
        // its own private reply channel and never registered here.
        if let Some((_, senders)) = inner.pending.remove(&completion.digest) {
            for tx in senders {
                let _ = tx.send(clone_result(&completion.result));
            }
        }

        drain_worker_queue(&inner, completion.worker).await;
    }
}

/// Hands the routed worker its next queued task, if it has one ready.
async fn drain_worker_queue(inner: &Arc<PoolInner>, worker_id: WorkerId) {
    let Some(task) = inner.queues[worker_id as usize].try_dequeue().await else { return };
    match claim_worker(inner, worker_id).await {
        Some(busy_version) => {
            send_run(inner, worker_id, busy_version, task.digest().clone(), task.command.clone(), None).await;
        }
        None => {
            inner.queues[worker_id as usize].requeue(task).await;
        }
    }
}

fn clone_result(result: &Result<Reply, OctopusError>) -> Result<Reply, OctopusError> {
    match result {
        Ok(reply) => Ok(reply.clone()),
        Err(e) => Err(match e {
            OctopusError::WrongType => OctopusError::WrongType,
            OctopusError::NotInteger => OctopusError::NotInteger,
            OctopusError::NotFound(id) => OctopusError::NotFound(*id),
            OctopusError::Conflict(id, v) => OctopusError::Conflict(*id, *v),
            OctopusError::WorkerCrashed(code) => OctopusError::WorkerCrashed(*code),
            OctopusError::Cancelled => OctopusError::Cancelled,
            OctopusError::ShuttingDown => OctopusError::ShuttingDown,
            OctopusError::AlreadyCommitted => OctopusError::AlreadyCommitted,
            OctopusError::NotOwner => OctopusError::NotOwner,
            OctopusError::QueueFull(cap) => OctopusError::QueueFull(*cap),
            OctopusError::OperationFailed(err) => OctopusError::OperationFailed(anyhow::anyhow!(err.to_string())),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatch_runs_immediately_on_an_idle_worker() {
        let pool = WorkerPool::new(2);
        let reply = pool.dispatch(Command::Set { key: "k".into(), value: "v".into() }, 0, Duration::ZERO).await.unwrap();
        assert_eq!(reply, Reply::Ok);
        let reply = pool.dispatch(Command::Get { key: "k".into() }, 0, Duration::ZERO).await.unwrap();
        assert_eq!(reply, Reply::Str("v".into()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatch_queues_when_every_worker_is_busy() {
        let pool = Arc::new(WorkerPool::new(1));
        // Five distinct keys contending for the pool's single worker: four
        // of them must pass through that worker's task queue.
        let mut handles = Vec::new();
        for i in 0..5 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.dispatch(Command::Set { key: format!("k{i}"), value: "v".into() }, 0, Duration::ZERO).await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), Reply::Ok);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_key_always_lands_on_the_same_worker() {
        let pool = WorkerPool::new(8);
        let a = route_to_worker(Command::Set { key: "same-key".into(), value: "v".into() }.key(), 8);
        let b = route_to_worker(Command::Get { key: "same-key".into() }.key(), 8);
        assert_eq!(a, b);
        pool.dispatch(Command::Set { key: "same-key".into(), value: "v".into() }, 0, Duration::ZERO).await.unwrap();
        let reply = pool.dispatch(Command::Get { key: "same-key".into() }, 0, Duration::ZERO).await.unwrap();
        assert_eq!(reply, Reply::Str("v".into()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn crashed_worker_is_replaced_transparently() {
        let pool = WorkerPool::new(1);
        pool.dispatch(Command::Set { key: "k".into(), value: "v".into() }, 0, Duration::ZERO).await.unwrap();
        pool.simulate_worker_crash(0);
        // Give the abort a moment to land before the next dispatch.
        tokio::task::yield_now().await;
        let reply = pool.dispatch(Command::Get { key: "k".into() }, 0, Duration::ZERO).await.unwrap();
        // Replacement worker starts with a fresh, empty store.
        assert_eq!(reply, Reply::Nil);
        assert_eq!(pool.worker_count(), 1);
    }
}
