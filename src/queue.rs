//! The advanced task queue: a priority- and delay-aware min-heap with
//! structural deduplication, guarded by a [`ReentrantMutex`] and exposing a
//! non-polling blocking dequeue.
//!
//! Grounded on `engine.rs`'s `InflightTracker::wait_zero`: the core idiom is
//! to register interest on a [`tokio::sync::Notify`] *before* re-checking
//! the condition, so a notification fired between the check and the
//! registration is never lost. `dequeue` applies the same idiom, racing the
//! notification against a `sleep_until` the next task's ready time so a
//! delayed task is picked up exactly when it becomes ready rather than on
//! the next unrelated wakeup.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::command::{Command, TaskDigest};
use crate::error::OctopusError;
use crate::heap::MinHeap;
use crate::mutex::{OwnerId, ReentrantMutex};

/// A queued unit of work: a command paired with its priority and the
/// monotonic instant at which it becomes eligible to run.
#[derive(Debug, Clone)]
pub struct Task {
    pub command: Command,
    pub priority: i64,
    pub ready_at: Instant,
    seq: u64,
    digest: TaskDigest,
}

impl Task {
    fn key(&self) -> (Instant, i64, u64) {
        (self.ready_at, self.priority, self.seq)
    }

    pub fn digest(&self) -> &TaskDigest {
        &self.digest
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for Task {}
impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Task {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

struct TaskQueueInner {
    heap: MinHeap<Task>,
    digests: HashSet<TaskDigest>,
    next_seq: u64,
}

/// The mutable state guarded by the queue's reentrant mutex. Wrapped in
/// `RefCell` because `ReentrantGuard` only exposes `&TaskQueueState`: a
/// reentrant mutex cannot soundly hand out `&mut T`.
struct TaskQueueState {
    inner: RefCell<TaskQueueInner>,
}

pub struct TaskQueue {
    state: ReentrantMutex<TaskQueueState>,
    notify: Notify,
    next_owner: AtomicU64,
    capacity: Option<usize>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Like [`TaskQueue::new`], but rejects an enqueue of a new (non-dedup)
    /// task once the heap already holds `capacity` entries. `None` leaves it
    /// unbounded.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        TaskQueue {
            state: ReentrantMutex::new(TaskQueueState {
                inner: RefCell::new(TaskQueueInner { heap: MinHeap::new(), digests: HashSet::new(), next_seq: 0 }),
            }),
            notify: Notify::new(),
            next_owner: AtomicU64::new(0),
            capacity,
        }
    }

    fn fresh_owner(&self) -> OwnerId {
        OwnerId::from_raw(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    /// Enqueues `command` to run no earlier than `delay` from now, at
    /// `priority` (lower runs first). If a structurally identical command is
    /// already queued, this call is a silent no-op regardless of `priority`
    /// or `delay` — identity for dedup is the command alone.
    ///
    /// Fails with [`OctopusError::QueueFull`] if this would be a genuinely
    /// new task and the queue is already at its configured capacity.
    pub async fn enqueue(&self, command: Command, priority: i64, delay: Duration) -> Result<(), OctopusError> {
        let owner = self.fresh_owner();
        let guard = self.state.lock(owner).await;
        let ready_at = Instant::now() + delay;
        let digest = TaskDigest::of(&command);

        let became_head = {
            let mut inner = guard.inner.borrow_mut();
            if inner.digests.contains(&digest) {
                drop(inner);
                self.state.unlock(owner).expect("we just locked this owner");
                return Ok(());
            }
            if let Some(capacity) = self.capacity {
                if inner.heap.len() >= capacity {
                    drop(inner);
                    self.state.unlock(owner).expect("we just locked this owner");
                    return Err(OctopusError::QueueFull(capacity));
                }
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.digests.insert(digest.clone());
            inner.heap.push(Task { command, priority, ready_at, seq, digest });
            inner.heap.peek().map(|t| t.seq) == Some(seq)
        };
        drop(guard);
        self.state.unlock(owner).expect("we just locked this owner");
        if became_head {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Waits until the earliest-ready task is due, then removes and returns
    /// it. Never polls: it sleeps until the known ready time or wakes
    /// immediately when a new task is enqueued that might change the head.
    pub async fn dequeue(&self) -> Task {
        loop {
            // Register for a wakeup before inspecting the heap so a
            // concurrent enqueue can never be missed between the two.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let owner = self.fresh_owner();
            let guard = self.state.lock(owner).await;
            let next_ready_at = {
                let inner = guard.inner.borrow();
                inner.heap.peek().map(|t| t.ready_at)
            };
            if let Some(ready_at) = next_ready_at {
                if ready_at <= Instant::now() {
                    let task = {
                        let mut inner = guard.inner.borrow_mut();
                        let task = inner.heap.pop().expect("peeked Some above");
                        inner.digests.remove(&task.digest);
                        task
                    };
                    drop(guard);
                    self.state.unlock(owner).expect("we just locked this owner");
                    return task;
                }
            }
            drop(guard);
            self.state.unlock(owner).expect("we just locked this owner");

            match next_ready_at {
                Some(ready_at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(ready_at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Non-blocking variant: returns `None` immediately if nothing is ready.
    pub async fn try_dequeue(&self) -> Option<Task> {
        let owner = self.fresh_owner();
        let guard = self.state.lock(owner).await;
        let task = {
            let ready = {
                let inner = guard.inner.borrow();
                matches!(inner.heap.peek(), Some(t) if t.ready_at <= Instant::now())
            };
            if ready {
                let mut inner = guard.inner.borrow_mut();
                let task = inner.heap.pop();
                if let Some(t) = &task {
                    inner.digests.remove(&t.digest);
                }
                task
            } else {
                None
            }
        };
        drop(guard);
        self.state.unlock(owner).expect("we just locked this owner");
        task
    }

    /// Reinserts a [`Task`] that was already popped via [`TaskQueue::try_dequeue`]
    /// but could not be handed to a worker. Preserves the task's original
    /// digest rather than recomputing one, since it already passed the
    /// dedup check on its first submission.
    pub async fn requeue(&self, task: Task) {
        let owner = self.fresh_owner();
        let guard = self.state.lock(owner).await;
        {
            let mut inner = guard.inner.borrow_mut();
            inner.digests.insert(task.digest.clone());
            inner.heap.push(task);
        }
        drop(guard);
        self.state.unlock(owner).expect("we just locked this owner");
        self.notify.notify_one();
    }

    pub async fn size(&self) -> usize {
        let owner = self.fresh_owner();
        let guard = self.state.lock(owner).await;
        let n = guard.inner.borrow().heap.len();
        drop(guard);
        self.state.unlock(owner).expect("we just locked this owner");
        n
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(key: &str) -> Command {
        Command::Get { key: key.to_string() }
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_returns_in_ready_and_priority_order() {
        let queue = TaskQueue::new();
        queue.enqueue(cmd("a"), 5, Duration::ZERO).await.unwrap();
        queue.enqueue(cmd("b"), 1, Duration::ZERO).await.unwrap();
        queue.enqueue(cmd("c"), 5, Duration::ZERO).await.unwrap();

        assert_eq!(queue.dequeue().await.command, cmd("b"));
        assert_eq!(queue.dequeue().await.command, cmd("a"));
        assert_eq!(queue.dequeue().await.command, cmd("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_waits_for_a_delayed_task_to_become_ready() {
        let queue = TaskQueue::new();
        queue.enqueue(cmd("late"), 0, Duration::from_secs(5)).await.unwrap();
        assert!(queue.try_dequeue().await.is_none());

        let dequeue = tokio::spawn(async move {
            let task = queue.dequeue().await;
            (queue, task)
        });
        tokio::time::advance(Duration::from_secs(6)).await;
        let (queue, task) = dequeue.await.unwrap();
        assert_eq!(task.command, cmd("late"));
        assert_eq!(queue.size().await, 0);
    }

    #[tokio::test]
    async fn duplicate_submission_deduplicates() {
        let queue = TaskQueue::new();
        queue.enqueue(cmd("k"), 0, Duration::ZERO).await.unwrap();
        queue.enqueue(cmd("k"), 0, Duration::ZERO).await.unwrap();
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test]
    async fn distinct_priority_is_still_deduplicated() {
        // Identity for dedup is the command alone (I1); priority and delay
        // only affect where a *fresh* task lands in the heap.
        let queue = TaskQueue::new();
        queue.enqueue(cmd("k"), 0, Duration::ZERO).await.unwrap();
        queue.enqueue(cmd("k"), 1, Duration::ZERO).await.unwrap();
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test]
    async fn enqueue_past_capacity_is_rejected() {
        let queue = TaskQueue::with_capacity(Some(1));
        queue.enqueue(cmd("a"), 0, Duration::ZERO).await.unwrap();
        let err = queue.enqueue(cmd("b"), 0, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, OctopusError::QueueFull(1)));
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test]
    async fn a_dedup_hit_does_not_count_against_capacity() {
        let queue = TaskQueue::with_capacity(Some(1));
        queue.enqueue(cmd("a"), 0, Duration::ZERO).await.unwrap();
        queue.enqueue(cmd("a"), 5, Duration::ZERO).await.unwrap();
        assert_eq!(queue.size().await, 1);
    }
}
