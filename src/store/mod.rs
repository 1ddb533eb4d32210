//! Key-value store adapters.
//!
//! Everything deferwork persists lives in four kinds of keys, mirroring a
//! Redis keyspace:
//!
//! | Key                   | Kind | Contents                               |
//! |-----------------------|------|----------------------------------------|
//! | `job:<id>`            | hash | the job record                         |
//! | `job:<id>:children`   | set  | ids of jobs that depend on `<id>`      |
//! | `queue:<name>`        | list | ids of queued jobs in FIFO order       |
//! | `deferred:<name>`     | set  | ids of jobs waiting on their parents   |
//!
//! The [`Store`] trait is the only seam between the job logic and a concrete
//! backend. Three backends ship with the crate:
//!
//! - [`MemoryStore`]: an in-process store, always available, used by tests and
//!   single-process deployments.
//! - `RedisStore` (feature `redis`): the reference backend.
//! - `PostgresStore` (feature `postgres`): the same keyspace on PostgreSQL tables.
//!
//! Multi-key atomic updates go through [`Store::commit`] with a
//! [`Transaction`]: a list of checks that must all hold, and a list of
//! operations applied only if they do.

use crate::{Result, job::JobId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use self::postgres::PostgresStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Key naming for everything deferwork stores.
pub mod keys {
    use crate::job::JobId;

    pub fn job(id: &JobId) -> String {
        format!("job:{}", id)
    }

    pub fn children(id: &JobId) -> String {
        format!("job:{}:children", id)
    }

    pub fn queue(name: &str) -> String {
        format!("queue:{}", name)
    }

    pub fn deferred(name: &str) -> String {
        format!("deferred:{}", name)
    }
}

/// The data type held under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Hash,
    Set,
    List,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Hash => "hash",
            KeyKind::Set => "set",
            KeyKind::List => "list",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hash" => Some(KeyKind::Hash),
            "set" => Some(KeyKind::Set),
            "list" => Some(KeyKind::List),
            _ => None,
        }
    }
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires in this many seconds, rounded to the nearest second.
    ExpiresIn(i64),
}

impl KeyTtl {
    /// Redis `TTL` encoding: `-2` missing, `-1` persistent, else seconds.
    pub fn as_seconds(&self) -> i64 {
        match self {
            KeyTtl::Missing => -2,
            KeyTtl::Persistent => -1,
            KeyTtl::ExpiresIn(seconds) => *seconds,
        }
    }

    pub(crate) fn from_millis(millis: i64) -> Self {
        KeyTtl::ExpiresIn((millis + 500).div_euclid(1000))
    }
}

/// A precondition evaluated inside [`Store::commit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Check {
    /// Hash field `field` at `key` exists and equals `value`.
    FieldEquals {
        key: String,
        field: String,
        value: String,
    },
    /// `member` belongs to the set at `key`.
    IsMember { key: String, member: String },
}

/// A write applied by [`Store::commit`] once every check holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    HashSet {
        key: String,
        field: String,
        value: String,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
    ListPush {
        key: String,
        value: String,
    },
    ListRemove {
        key: String,
        value: String,
    },
}

impl Check {
    pub fn key(&self) -> &str {
        match self {
            Check::FieldEquals { key, .. } | Check::IsMember { key, .. } => key,
        }
    }
}

impl Op {
    pub fn key(&self) -> &str {
        match self {
            Op::HashSet { key, .. }
            | Op::SetAdd { key, .. }
            | Op::SetRemove { key, .. }
            | Op::ListPush { key, .. }
            | Op::ListRemove { key, .. } => key,
        }
    }
}

/// A conditional multi-key update.
///
/// ```rust
/// use deferwork::store::Transaction;
///
/// let tx = Transaction::new()
///     .require_member("deferred:default", "child")
///     .set_remove("deferred:default", "child")
///     .list_push("queue:default", "child");
///
/// assert_eq!(tx.keys(), vec!["deferred:default", "queue:default"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Transaction {
    checks: Vec<Check>,
    ops: Vec<Op>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_field(
        mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.checks.push(Check::FieldEquals {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn require_member(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.checks.push(Check::IsMember {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn hash_set(
        mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.ops.push(Op::HashSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn set_add(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(Op::SetAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn set_remove(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(Op::SetRemove {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn list_push(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(Op::ListPush {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn list_remove(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(Op::ListRemove {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Every key the transaction reads or writes, sorted and deduplicated.
    pub fn keys(&self) -> Vec<&str> {
        let keys: BTreeSet<&str> = self
            .checks
            .iter()
            .map(Check::key)
            .chain(self.ops.iter().map(Op::key))
            .collect();
        keys.into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty() && self.ops.is_empty()
    }
}

/// Storage backend used by every deferwork component.
///
/// Semantics follow Redis: writing to a missing key creates it, a collection
/// whose last element is removed disappears, an expired key behaves exactly
/// like a missing one, and using a key as the wrong kind is an error.
#[async_trait]
pub trait Store: Send + Sync {
    /// Set hash fields, creating the hash if needed.
    async fn hash_set(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    /// All fields of a hash; empty when the key is missing.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn key_kind(&self, key: &str) -> Result<Option<KeyKind>>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Expire `key` at `at`. Returns false when the key does not exist.
    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Remove any expiry. Returns true when an expiry was removed.
    async fn persist(&self, key: &str) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Returns true when the member was newly added.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;

    /// Returns true when the member was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;

    /// Append to the tail of a list, returning its new length.
    async fn list_push(&self, key: &str, value: &str) -> Result<u64>;

    /// Pop from the head of a list.
    async fn list_pop_front(&self, key: &str) -> Result<Option<String>>;

    /// The whole list, head first.
    async fn list_range(&self, key: &str) -> Result<Vec<String>>;

    /// Remove every occurrence of `value`, returning how many were removed.
    async fn list_remove(&self, key: &str, value: &str) -> Result<u64>;

    /// Apply `tx` atomically.
    ///
    /// Returns `Ok(false)` without writing anything when a check fails.
    /// Backends that detect concurrent interference report
    /// [`DeferworkError::TransactionConflict`](crate::DeferworkError::TransactionConflict)
    /// and the caller may retry.
    async fn commit(&self, tx: &Transaction) -> Result<bool>;
}

/// Render a job id the way the store holds it in sets and lists.
pub(crate) fn member(id: &JobId) -> String {
    id.to_string()
}
