//! The command vocabulary and value model that execution contexts operate on.
//!
//! A [`Command`] is a single-key operation; an execution context applies it
//! to its private `HashMap<String, Value>` and returns a [`Reply`]. The
//! enum-of-variants shape (rather than a generic `{kind, key, value}` tuple)
//! lets each operation carry exactly the fields it needs and lets
//! [`crate::context::ExecutionContext::execute`] match exhaustively.

use sha2::{Digest, Sha256};
use std::fmt;

/// A stored value. Every key in an execution context's store holds exactly
/// one of these at a time; operations that expect a different shape fail
/// with [`crate::error::OctopusError::WrongType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    List(std::collections::VecDeque<String>),
    Set(std::collections::BTreeSet<String>),
}

/// The result of applying a [`Command`] to an execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Str(String),
    Int(i64),
    Nil,
    Bool(bool),
    Array(Vec<String>),
}

/// A single-key operation dispatched to a worker pool.
///
/// Every variant carries the key it addresses; [`Command::key`] extracts it
/// without a match in every call site that needs it for routing or hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Get { key: String },
    Del { key: String },
    Exists { key: String },
    Incr { key: String },
    Decr { key: String },
    Expire { key: String, seconds: u64 },
    Ttl { key: String },
    Persist { key: String },
    LPush { key: String, value: String },
    RPush { key: String, value: String },
    LPop { key: String },
    RPop { key: String },
    SAdd { key: String, value: String },
    SRem { key: String, value: String },
    SMembers { key: String },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. }
            | Command::Get { key }
            | Command::Del { key }
            | Command::Exists { key }
            | Command::Incr { key }
            | Command::Decr { key }
            | Command::Expire { key, .. }
            | Command::Ttl { key }
            | Command::Persist { key }
            | Command::LPush { key, .. }
            | Command::RPush { key, .. }
            | Command::LPop { key }
            | Command::RPop { key }
            | Command::SAdd { key, .. }
            | Command::SRem { key, .. }
            | Command::SMembers { key } => key,
        }
    }

    /// A canonical, order-stable encoding of this command used as the input
    /// to [`TaskDigest::of`]. Two commands that would have an identical
    /// effect on the store encode identically.
    fn canonical_encoding(&self) -> String {
        match self {
            Command::Set { key, value } => format!("set\0{key}\0{value}"),
            Command::Get { key } => format!("get\0{key}"),
            Command::Del { key } => format!("del\0{key}"),
            Command::Exists { key } => format!("exists\0{key}"),
            Command::Incr { key } => format!("incr\0{key}"),
            Command::Decr { key } => format!("decr\0{key}"),
            Command::Expire { key, seconds } => format!("expire\0{key}\0{seconds}"),
            Command::Ttl { key } => format!("ttl\0{key}"),
            Command::Persist { key } => format!("persist\0{key}"),
            Command::LPush { key, value } => format!("lpush\0{key}\0{value}"),
            Command::RPush { key, value } => format!("rpush\0{key}\0{value}"),
            Command::LPop { key } => format!("lpop\0{key}"),
            Command::RPop { key } => format!("rpop\0{key}"),
            Command::SAdd { key, value } => format!("sadd\0{key}\0{value}"),
            Command::SRem { key, value } => format!("srem\0{key}\0{value}"),
            Command::SMembers { key } => format!("smembers\0{key}"),
        }
    }
}

/// A SHA-256 digest of a command's structural identity (discriminant + key +
/// value + ttl, via [`Command::canonical_encoding`]), hex-encoded. Two
/// dispatches of the same command are the same task regardless of what
/// priority or delay either was submitted with; the task queue uses this to
/// deduplicate resubmissions of an already-queued task.
///
/// Grounded on `intelligent-crawler`'s `ContentHash::from_content`, which
/// hashes with `Sha256` and renders with `hex::encode`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TaskDigest(String);

impl TaskDigest {
    pub fn of(command: &Command) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(command.canonical_encoding().as_bytes());
        TaskDigest(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TaskDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskDigest({}…)", &self.0[..8.min(self.0.len())])
    }
}
