//! A single worker's private key-value store.
//!
//! Each [`ExecutionContext`] is owned exclusively by one worker task; it is
//! never shared, locked, or referenced from another context. All cross-key
//! consistency guarantees come from the fact that every command for a given
//! key always lands on the same context (see [`crate::pool::WorkerPool`]),
//! not from any synchronization inside this type.
//!
//! TTLs are tracked against [`tokio::time::Instant`], a monotonic clock that
//! is immune to wall-clock adjustments and, under `#[tokio::test(start_paused
//! = true)]`, advances only when the test explicitly asks it to — the
//! mechanism the test suite uses to exercise expiry deterministically.

use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::time::Instant;

use crate::command::{Command, Reply, Value};
use crate::error::OctopusError;

/// An execution context's private state: the keyspace and each key's
/// optional expiry deadline.
pub struct ExecutionContext {
    store: HashMap<String, Value>,
    expirations: HashMap<String, Instant>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        ExecutionContext { store: HashMap::new(), expirations: HashMap::new() }
    }

    /// Removes `key` if its TTL has passed. Called before every read or
    /// write so an expired key behaves as if it were already gone,
    /// regardless of whether anything has proactively swept it.
    fn expire_if_due(&mut self, key: &str) {
        if let Some(deadline) = self.expirations.get(key) {
            if Instant::now() >= *deadline {
                self.store.remove(key);
                self.expirations.remove(key);
            }
        }
    }

    fn clear_ttl(&mut self, key: &str) {
        self.expirations.remove(key);
    }

    /// The earliest deadline outstanding across every key with an active
    /// TTL, if any. A worker sleeps until this instant to sweep expired
    /// keys even when no command arrives to trigger the lazy check.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.expirations.values().min().copied()
    }

    /// Removes every key whose deadline has passed. The eager half of TTL
    /// expiry: keys nobody reads still get collected, bounded by their own
    /// deadline rather than by the next unrelated access.
    pub fn sweep_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self.expirations.iter().filter(|(_, deadline)| **deadline <= now).map(|(key, _)| key.clone()).collect();
        for key in expired {
            self.store.remove(&key);
            self.expirations.remove(&key);
        }
    }

    /// Applies `command` to this context's store, returning the reply or a
    /// worker-local error (wrong type, non-integer value).
    pub fn execute(&mut self, command: &Command) -> Result<Reply, OctopusError> {
        self.expire_if_due(command.key());
        match command {
            Command::Set { key, value } => {
                self.store.insert(key.clone(), Value::Str(value.clone()));
                self.clear_ttl(key);
                Ok(Reply::Ok)
            }
            Command::Get { key } => match self.store.get(key) {
                Some(Value::Str(s)) => Ok(Reply::Str(s.clone())),
                Some(_) => Err(OctopusError::WrongType),
                None => Ok(Reply::Nil),
            },
            Command::Del { key } => {
                self.clear_ttl(key);
                Ok(Reply::Bool(self.store.remove(key).is_some()))
            }
            Command::Exists { key } => Ok(Reply::Bool(self.store.contains_key(key))),
            Command::Incr { key } => self.bump(key, 1),
            Command::Decr { key } => self.bump(key, -1),
            Command::Expire { key, seconds } => {
                if self.store.contains_key(key) {
                    self.expirations.insert(key.clone(), Instant::now() + std::time::Duration::from_secs(*seconds));
                    Ok(Reply::Bool(true))
                } else {
                    Ok(Reply::Bool(false))
                }
            }
            Command::Ttl { key } => match self.expirations.get(key) {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    Ok(Reply::Int(remaining.as_secs() as i64))
                }
                None => Ok(Reply::Int(-1)),
            },
            Command::Persist { key } => {
                Ok(Reply::Bool(self.expirations.remove(key).is_some()))
            }
            Command::LPush { key, value } => self.push_list(key, value, true),
            Command::RPush { key, value } => self.push_list(key, value, false),
            Command::LPop { key } => self.pop_list(key, true),
            Command::RPop { key } => self.pop_list(key, false),
            Command::SAdd { key, value } => self.set_entry(key, |set| set.insert(value.clone())),
            Command::SRem { key, value } => self.set_entry(key, |set| set.remove(value.as_str())),
            Command::SMembers { key } => match self.store.get(key) {
                Some(Value::Set(set)) => Ok(Reply::Array(set.iter().cloned().collect())),
                Some(_) => Err(OctopusError::WrongType),
                None => Ok(Reply::Array(Vec::new())),
            },
        }
    }

    fn bump(&mut self, key: &str, delta: i64) -> Result<Reply, OctopusError> {
        let current = match self.store.get(key) {
            Some(Value::Str(s)) => s.parse::<i64>().map_err(|_| OctopusError::NotInteger)?,
            Some(_) => return Err(OctopusError::WrongType),
            None => 0,
        };
        let next = current + delta;
        self.store.insert(key.to_string(), Value::Str(next.to_string()));
        Ok(Reply::Int(next))
    }

    fn push_list(&mut self, key: &str, value: &str, front: bool) -> Result<Reply, OctopusError> {
        let entry = self.store.entry(key.to_string()).or_insert_with(|| Value::List(VecDeque::new()));
        match entry {
            Value::List(list) => {
                if front {
                    list.push_front(value.to_string());
                } else {
                    list.push_back(value.to_string());
                }
                Ok(Reply::Int(list.len() as i64))
            }
            _ => Err(OctopusError::WrongType),
        }
    }

    fn pop_list(&mut self, key: &str, front: bool) -> Result<Reply, OctopusError> {
        match self.store.get_mut(key) {
            Some(Value::List(list)) => {
                let popped = if front { list.pop_front() } else { list.pop_back() };
                if list.is_empty() {
                    self.store.remove(key);
                    self.clear_ttl(key);
                }
                Ok(popped.map(Reply::Str).unwrap_or(Reply::Nil))
            }
            Some(_) => Err(OctopusError::WrongType),
            None => Ok(Reply::Nil),
        }
    }

    fn set_entry(&mut self, key: &str, mutate: impl FnOnce(&mut BTreeSet<String>) -> bool) -> Result<Reply, OctopusError> {
        let entry = self.store.entry(key.to_string()).or_insert_with(|| Value::Set(BTreeSet::new()));
        match entry {
            Value::Set(set) => {
                let changed = mutate(set);
                if set.is_empty() {
                    self.store.remove(key);
                    self.clear_ttl(key);
                }
                Ok(Reply::Bool(changed))
            }
            _ => Err(OctopusError::WrongType),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ctx: &mut ExecutionContext, key: &str, value: &str) -> Reply {
        ctx.execute(&Command::Set { key: key.into(), value: value.into() }).unwrap()
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut ctx = ExecutionContext::new();
        set(&mut ctx, "k", "v");
        assert_eq!(ctx.execute(&Command::Get { key: "k".into() }).unwrap(), Reply::Str("v".into()));
    }

    #[test]
    fn get_on_missing_key_is_nil() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(ctx.execute(&Command::Get { key: "missing".into() }).unwrap(), Reply::Nil);
    }

    #[test]
    fn incr_on_missing_key_starts_at_zero() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(ctx.execute(&Command::Incr { key: "c".into() }).unwrap(), Reply::Int(1));
        assert_eq!(ctx.execute(&Command::Incr { key: "c".into() }).unwrap(), Reply::Int(2));
        assert_eq!(ctx.execute(&Command::Decr { key: "c".into() }).unwrap(), Reply::Int(1));
    }

    #[test]
    fn incr_on_non_integer_string_fails() {
        let mut ctx = ExecutionContext::new();
        set(&mut ctx, "k", "not-a-number");
        let err = ctx.execute(&Command::Incr { key: "k".into() }).unwrap_err();
        assert!(matches!(err, OctopusError::NotInteger));
    }

    #[test]
    fn wrong_type_on_list_ops_against_a_string() {
        let mut ctx = ExecutionContext::new();
        set(&mut ctx, "k", "v");
        let err = ctx.execute(&Command::LPush { key: "k".into(), value: "x".into() }).unwrap_err();
        assert!(matches!(err, OctopusError::WrongType));
    }

    #[test]
    fn list_push_and_pop_both_ends() {
        let mut ctx = ExecutionContext::new();
        ctx.execute(&Command::RPush { key: "l".into(), value: "a".into() }).unwrap();
        ctx.execute(&Command::RPush { key: "l".into(), value: "b".into() }).unwrap();
        ctx.execute(&Command::LPush { key: "l".into(), value: "z".into() }).unwrap();
        // list is now [z, a, b]
        assert_eq!(ctx.execute(&Command::LPop { key: "l".into() }).unwrap(), Reply::Str("z".into()));
        assert_eq!(ctx.execute(&Command::RPop { key: "l".into() }).unwrap(), Reply::Str("b".into()));
        assert_eq!(ctx.execute(&Command::LPop { key: "l".into() }).unwrap(), Reply::Str("a".into()));
        assert_eq!(ctx.execute(&Command::LPop { key: "l".into() }).unwrap(), Reply::Nil);
    }

    #[test]
    fn set_ops_add_remove_members() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(ctx.execute(&Command::SAdd { key: "s".into(), value: "a".into() }).unwrap(), Reply::Bool(true));
        assert_eq!(ctx.execute(&Command::SAdd { key: "s".into(), value: "a".into() }).unwrap(), Reply::Bool(false));
        ctx.execute(&Command::SAdd { key: "s".into(), value: "b".into() }).unwrap();
        assert_eq!(
            ctx.execute(&Command::SMembers { key: "s".into() }).unwrap(),
            Reply::Array(vec!["a".into(), "b".into()])
        );
        assert_eq!(ctx.execute(&Command::SRem { key: "s".into(), value: "a".into() }).unwrap(), Reply::Bool(true));
    }

    #[test]
    fn ttl_is_minus_one_when_no_deadline_is_set() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(ctx.execute(&Command::Ttl { key: "missing".into() }).unwrap(), Reply::Int(-1));
        set(&mut ctx, "k", "v");
        assert_eq!(ctx.execute(&Command::Ttl { key: "k".into() }).unwrap(), Reply::Int(-1));
    }

    #[tokio::test(start_paused = true)]
    async fn key_expires_after_its_ttl_elapses() {
        let mut ctx = ExecutionContext::new();
        set(&mut ctx, "k", "v");
        ctx.execute(&Command::Expire { key: "k".into(), seconds: 5 }).unwrap();
        assert_eq!(ctx.execute(&Command::Exists { key: "k".into() }).unwrap(), Reply::Bool(true));

        tokio::time::advance(std::time::Duration::from_secs(6)).await;

        assert_eq!(ctx.execute(&Command::Get { key: "k".into() }).unwrap(), Reply::Nil);
        assert_eq!(ctx.execute(&Command::Exists { key: "k".into() }).unwrap(), Reply::Bool(false));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expired_removes_unread_keys_past_their_deadline() {
        let mut ctx = ExecutionContext::new();
        set(&mut ctx, "k", "v");
        ctx.execute(&Command::Expire { key: "k".into(), seconds: 5 }).unwrap();
        assert_eq!(ctx.next_deadline(), ctx.expirations.get("k").copied());

        tokio::time::advance(std::time::Duration::from_secs(6)).await;
        ctx.sweep_expired();

        assert_eq!(ctx.next_deadline(), None);
        assert_eq!(ctx.execute(&Command::Exists { key: "k".into() }).unwrap(), Reply::Bool(false));
    }

    #[test]
    fn persist_removes_ttl() {
        let mut ctx = ExecutionContext::new();
        set(&mut ctx, "k", "v");
        ctx.execute(&Command::Expire { key: "k".into(), seconds: 10 }).unwrap();
        assert_eq!(ctx.execute(&Command::Persist { key: "k".into() }).unwrap(), Reply::Bool(true));
        assert_eq!(ctx.execute(&Command::Ttl { key: "k".into() }).unwrap(), Reply::Int(-1));
    }
}
