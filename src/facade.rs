//! The public, ergonomic entry point: `Octopus`.
//!
//! `Octopus` is a process-wide singleton reached via [`Octopus::instance`],
//! backed by a `std::sync::OnceLock` (stable std, no extra crate needed).
//! It owns one [`WorkerPool`] and one [`TransactionManager`] and exposes one
//! async method per command, translating the pool's generic
//! `Command`/`Reply` pair into the shapes callers actually want (`Option<String>`,
//! `bool`, `i64`, ...).
//!
//! `on_operation` registers a listener invoked after every dispatched
//! command with its outcome — a direct callback list rather than a generic
//! event bus, since `Octopus` has exactly one kind of thing to announce.

use std::sync::{Mutex as StdMutex, Arc, OnceLock};
use std::time::Duration;

use crate::command::{Command, Reply};
use crate::config::Config;
use crate::error::OctopusError;
use crate::pool::WorkerPool;
use crate::transaction::{Transaction, TransactionManager};

type Listener = dyn Fn(&Command, &Result<Reply, OctopusError>) + Send + Sync;

/// The in-process key-value store. Construct one directly with [`Octopus::new`]
/// for tests or multi-instance use, or reach the process-wide instance via
/// [`Octopus::instance`].
pub struct Octopus {
    pool: Arc<WorkerPool>,
    transactions: TransactionManager,
    listeners: StdMutex<Vec<Box<Listener>>>,
}

static INSTANCE: OnceLock<Arc<Octopus>> = OnceLock::new();

impl Octopus {
    pub fn new(config: Config) -> Self {
        let pool = Arc::new(WorkerPool::with_capacity(config.max_workers, config.queue_capacity));
        Octopus { transactions: TransactionManager::new(pool.clone()), pool, listeners: StdMutex::new(Vec::new()) }
    }

    /// The process-wide instance, built on first access.
    ///
    /// `max_workers` sizes the pool on the *first* call only; once the
    /// instance exists, later calls return it unchanged regardless of what
    /// is passed. `None` falls back to [`Config::from_env`] (and, failing
    /// that, [`Config::default`]).
    pub fn instance(max_workers: Option<u32>) -> Arc<Octopus> {
        INSTANCE
            .get_or_init(|| {
                let config = match max_workers {
                    Some(max_workers) => Config { max_workers, queue_capacity: None },
                    None => Config::from_env().unwrap_or_else(|err| {
                        tracing::warn!(%err, "falling back to default config");
                        Config::default()
                    }),
                };
                Arc::new(Octopus::new(config))
            })
            .clone()
    }

    /// Registers a callback invoked after every dispatched command with the
    /// command and its outcome. Listeners run synchronously on the calling
    /// task immediately after the command completes; keep them cheap.
    pub fn on_operation(&self, listener: impl Fn(&Command, &Result<Reply, OctopusError>) + Send + Sync + 'static) {
        self.listeners.lock().expect("listener list poisoned").push(Box::new(listener));
    }

    async fn run(&self, command: Command, priority: i64, delay: Duration) -> Result<Reply, OctopusError> {
        let result = self.pool.dispatch(command.clone(), priority, delay).await;
        // Listeners announce completed operations, not rejections: a
        // ShuttingDown refusal or a worker-local failure (WrongType,
        // NotInteger) never dispatched in any observable sense.
        if result.is_ok() {
            for listener in self.listeners.lock().expect("listener list poisoned").iter() {
                listener(&command, &result);
            }
        }
        result
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<(), OctopusError> {
        self.run(Command::Set { key: key.into(), value: value.into() }, 0, Duration::ZERO).await.map(|_| ())
    }

    pub async fn get(&self, key: impl Into<String>) -> Result<Option<String>, OctopusError> {
        match self.run(Command::Get { key: key.into() }, 0, Duration::ZERO).await? {
            Reply::Str(s) => Ok(Some(s)),
            Reply::Nil => Ok(None),
            _ => unreachable!("Get always replies Str or Nil"),
        }
    }

    pub async fn del(&self, key: impl Into<String>) -> Result<bool, OctopusError> {
        as_bool(self.run(Command::Del { key: key.into() }, 0, Duration::ZERO).await?)
    }

    pub async fn exists(&self, key: impl Into<String>) -> Result<bool, OctopusError> {
        as_bool(self.run(Command::Exists { key: key.into() }, 0, Duration::ZERO).await?)
    }

    pub async fn incr(&self, key: impl Into<String>) -> Result<i64, OctopusError> {
        as_int(self.run(Command::Incr { key: key.into() }, 0, Duration::ZERO).await?)
    }

    pub async fn decr(&self, key: impl Into<String>) -> Result<i64, OctopusError> {
        as_int(self.run(Command::Decr { key: key.into() }, 0, Duration::ZERO).await?)
    }

    pub async fn expire(&self, key: impl Into<String>, seconds: u64) -> Result<bool, OctopusError> {
        as_bool(self.run(Command::Expire { key: key.into(), seconds }, 0, Duration::ZERO).await?)
    }

    pub async fn ttl(&self, key: impl Into<String>) -> Result<i64, OctopusError> {
        as_int(self.run(Command::Ttl { key: key.into() }, 0, Duration::ZERO).await?)
    }

    pub async fn persist(&self, key: impl Into<String>) -> Result<bool, OctopusError> {
        as_bool(self.run(Command::Persist { key: key.into() }, 0, Duration::ZERO).await?)
    }

    pub async fn lpush(&self, key: impl Into<String>, value: impl Into<String>) -> Result<i64, OctopusError> {
        as_int(self.run(Command::LPush { key: key.into(), value: value.into() }, 0, Duration::ZERO).await?)
    }

    pub async fn rpush(&self, key: impl Into<String>, value: impl Into<String>) -> Result<i64, OctopusError> {
        as_int(self.run(Command::RPush { key: key.into(), value: value.into() }, 0, Duration::ZERO).await?)
    }

    pub async fn lpop(&self, key: impl Into<String>) -> Result<Option<String>, OctopusError> {
        as_opt_str(self.run(Command::LPop { key: key.into() }, 0, Duration::ZERO).await?)
    }

    pub async fn rpop(&self, key: impl Into<String>) -> Result<Option<String>, OctopusError> {
        as_opt_str(self.run(Command::RPop { key: key.into() }, 0, Duration::ZERO).await?)
    }

    pub async fn sadd(&self, key: impl Into<String>, value: impl Into<String>) -> Result<bool, OctopusError> {
        as_bool(self.run(Command::SAdd { key: key.into(), value: value.into() }, 0, Duration::ZERO).await?)
    }

    pub async fn srem(&self, key: impl Into<String>, value: impl Into<String>) -> Result<bool, OctopusError> {
        as_bool(self.run(Command::SRem { key: key.into(), value: value.into() }, 0, Duration::ZERO).await?)
    }

    pub async fn smembers(&self, key: impl Into<String>) -> Result<Vec<String>, OctopusError> {
        match self.run(Command::SMembers { key: key.into() }, 0, Duration::ZERO).await? {
            Reply::Array(values) => Ok(values),
            _ => unreachable!("SMembers always replies Array"),
        }
    }

    /// Dispatches `command` with an explicit priority and delay, bypassing
    /// the named convenience methods above. Useful for background
    /// maintenance work (e.g. a deferred `expire`) that should not compete
    /// with interactive traffic for an idle worker.
    pub async fn dispatch_with(&self, command: Command, priority: i64, delay: Duration) -> Result<Reply, OctopusError> {
        self.run(command, priority, delay).await
    }

    /// Begins a new transaction; blocks if another transaction currently
    /// holds the transaction gate.
    pub async fn begin_transaction(&self) -> Transaction {
        self.transactions.begin().await
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }
}

fn as_bool(reply: Reply) -> Result<bool, OctopusError> {
    match reply {
        Reply::Bool(b) => Ok(b),
        _ => unreachable!("expected a Bool reply"),
    }
}

fn as_int(reply: Reply) -> Result<i64, OctopusError> {
    match reply {
        Reply::Int(n) => Ok(n),
        _ => unreachable!("expected an Int reply"),
    }
}

fn as_opt_str(reply: Reply) -> Result<Option<String>, OctopusError> {
    match reply {
        Reply::Str(s) => Ok(Some(s)),
        Reply::Nil => Ok(None),
        _ => unreachable!("expected a Str or Nil reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn set_get_del_round_trip() {
        let octo = Octopus::new(Config { max_workers: 2, queue_capacity: None });
        octo.set("k", "v").await.unwrap();
        assert_eq!(octo.get("k").await.unwrap(), Some("v".to_string()));
        assert!(octo.del("k").await.unwrap());
        assert_eq!(octo.get("k").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn on_operation_observes_every_dispatched_command() {
        let octo = Octopus::new(Config { max_workers: 1, queue_capacity: None });
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        octo.on_operation(move |command, _result| {
            seen_clone.lock().unwrap().push(command.key().to_string());
        });
        octo.set("a", "1").await.unwrap();
        octo.incr("a").await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a", "a"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn on_operation_is_not_notified_of_a_failed_operation() {
        let octo = Octopus::new(Config { max_workers: 1, queue_capacity: None });
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        octo.on_operation(move |command, _result| {
            seen_clone.lock().unwrap().push(command.key().to_string());
        });
        // incr on a non-integer value fails with NotInteger; the listener
        // must not hear about it.
        octo.set("a", "not-a-number").await.unwrap();
        assert!(octo.incr("a").await.is_err());
        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transaction_commits_through_the_facade() {
        let octo = Octopus::new(Config { max_workers: 1, queue_capacity: None });
        let mut txn = octo.begin_transaction().await;
        txn.add_operation(Command::Set { key: "k".into(), value: "1".into() }, 0).unwrap();
        txn.add_operation(Command::Incr { key: "k".into() }, 0).unwrap();
        let replies = txn.commit().await.unwrap();
        assert_eq!(replies, vec![Reply::Ok, Reply::Int(2)]);
    }
}
