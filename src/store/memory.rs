//! In-memory store.
//!
//! `MemoryStore` keeps the whole keyspace in a `HashMap` behind an async
//! `RwLock`. It follows the same semantics as the Redis backend, including key
//! expiry, so the job logic behaves identically against either. Expired keys
//! are evicted lazily at the start of every operation, using the store's
//! [`Clock`]; pass a [`MockClock`](crate::clock::MockClock) to make expiry
//! deterministic.
//!
//! # Examples
//!
//! ```rust
//! use deferwork::clock::{Clock, MockClock};
//! use deferwork::store::{MemoryStore, Store, KeyTtl};
//! use chrono::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let clock = MockClock::new();
//! let store = MemoryStore::with_clock(clock.clone());
//!
//! store.set_add("deferred:default", "a").await?;
//! store.expire_at("deferred:default", clock.now() + Duration::seconds(1)).await?;
//! assert_eq!(store.ttl("deferred:default").await?, KeyTtl::ExpiresIn(1));
//!
//! clock.advance(Duration::seconds(2));
//! assert!(!store.exists("deferred:default").await?);
//! # Ok(())
//! # }
//! ```

use super::{Check, KeyKind, KeyTtl, Op, Store, Transaction};
use crate::{
    DeferworkError, Result,
    clock::{Clock, SystemClock},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::Arc,
};
use tokio::sync::{RwLock, RwLockWriteGuard};

#[derive(Debug)]
enum Entry {
    Hash(HashMap<String, Vec<u8>>),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
}

impl Entry {
    fn kind(&self) -> KeyKind {
        match self {
            Entry::Hash(_) => KeyKind::Hash,
            Entry::Set(_) => KeyKind::Set,
            Entry::List(_) => KeyKind::List,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Entry::Hash(hash) => hash.is_empty(),
            Entry::Set(set) => set.is_empty(),
            Entry::List(list) => list.is_empty(),
        }
    }
}

/// Internal storage for the in-memory keyspace.
#[derive(Debug, Default)]
struct MemoryStorage {
    entries: HashMap<String, Entry>,
    expirations: HashMap<String, DateTime<Utc>>,
}

fn wrong_kind(key: &str, expected: KeyKind, actual: KeyKind) -> DeferworkError {
    DeferworkError::Store {
        message: format!(
            "key '{}' holds a {}, not a {}",
            key,
            actual.as_str(),
            expected.as_str()
        ),
    }
}

impl MemoryStorage {
    fn evict_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            self.remove(&key);
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expirations.remove(key);
        self.entries.remove(key).is_some()
    }

    /// Collections disappear with their last element.
    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(Entry::is_empty) {
            self.remove(key);
        }
    }

    fn hash(&self, key: &str) -> Result<Option<&HashMap<String, Vec<u8>>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry::Hash(hash)) => Ok(Some(hash)),
            Some(other) => Err(wrong_kind(key, KeyKind::Hash, other.kind())),
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, Vec<u8>>> {
        match self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()))
        {
            Entry::Hash(hash) => Ok(hash),
            other => Err(wrong_kind(key, KeyKind::Hash, other.kind())),
        }
    }

    fn set(&self, key: &str) -> Result<Option<&BTreeSet<String>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry::Set(set)) => Ok(Some(set)),
            Some(other) => Err(wrong_kind(key, KeyKind::Set, other.kind())),
        }
    }

    fn set_mut(&mut self, key: &str) -> Result<&mut BTreeSet<String>> {
        match self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(BTreeSet::new()))
        {
            Entry::Set(set) => Ok(set),
            other => Err(wrong_kind(key, KeyKind::Set, other.kind())),
        }
    }

    fn list(&self, key: &str) -> Result<Option<&VecDeque<String>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry::List(list)) => Ok(Some(list)),
            Some(other) => Err(wrong_kind(key, KeyKind::List, other.kind())),
        }
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut VecDeque<String>> {
        match self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()))
        {
            Entry::List(list) => Ok(list),
            other => Err(wrong_kind(key, KeyKind::List, other.kind())),
        }
    }

    fn hash_set(&mut self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let hash = self.hash_mut(key)?;
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    fn set_add(&mut self, key: &str, member: &str) -> Result<bool> {
        Ok(self.set_mut(key)?.insert(member.to_string()))
    }

    fn set_remove(&mut self, key: &str, member: &str) -> Result<bool> {
        if self.set(key)?.is_none() {
            return Ok(false);
        }
        let removed = self.set_mut(key)?.remove(member);
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn list_push(&mut self, key: &str, value: &str) -> Result<u64> {
        let list = self.list_mut(key)?;
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    fn list_remove(&mut self, key: &str, value: &str) -> Result<u64> {
        if self.list(key)?.is_none() {
            return Ok(0);
        }
        let list = self.list_mut(key)?;
        let before = list.len();
        list.retain(|item| item != value);
        let removed = (before - list.len()) as u64;
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn check(&self, check: &Check) -> Result<bool> {
        match check {
            Check::FieldEquals { key, field, value } => Ok(self
                .hash(key)?
                .and_then(|hash| hash.get(field))
                .is_some_and(|stored| stored.as_slice() == value.as_bytes())),
            Check::IsMember { key, member } => {
                Ok(self.set(key)?.is_some_and(|set| set.contains(member)))
            }
        }
    }

    fn apply(&mut self, op: &Op) -> Result<()> {
        match op {
            Op::HashSet { key, field, value } => {
                self.hash_set(key, &[(field.clone(), value.as_bytes().to_vec())])
            }
            Op::SetAdd { key, member } => self.set_add(key, member).map(|_| ()),
            Op::SetRemove { key, member } => self.set_remove(key, member).map(|_| ()),
            Op::ListPush { key, value } => self.list_push(key, value).map(|_| ()),
            Op::ListRemove { key, value } => self.list_remove(key, value).map(|_| ()),
        }
    }

    /// Reject ops that would hit a key of the wrong kind before anything is
    /// written, so a failing commit leaves the keyspace untouched.
    fn validate(&self, op: &Op) -> Result<()> {
        let (key, expected) = match op {
            Op::HashSet { key, .. } => (key, KeyKind::Hash),
            Op::SetAdd { key, .. } | Op::SetRemove { key, .. } => (key, KeyKind::Set),
            Op::ListPush { key, .. } | Op::ListRemove { key, .. } => (key, KeyKind::List),
        };
        match self.entries.get(key.as_str()) {
            Some(entry) if entry.kind() != expected => Err(wrong_kind(key, expected, entry.kind())),
            _ => Ok(()),
        }
    }
}

/// A thread-safe, in-process [`Store`].
#[derive(Clone, Debug)]
pub struct MemoryStore {
    storage: Arc<RwLock<MemoryStorage>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store that expires keys by wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Create an empty store that expires keys according to `clock`.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            storage: Arc::new(RwLock::new(MemoryStorage::default())),
            clock: Arc::new(clock),
        }
    }

    /// Number of live keys.
    pub async fn key_count(&self) -> usize {
        self.storage().await.entries.len()
    }

    /// Drop every key.
    pub async fn flush(&self) {
        let mut storage = self.storage.write().await;
        storage.entries.clear();
        storage.expirations.clear();
    }

    async fn storage(&self) -> RwLockWriteGuard<'_, MemoryStorage> {
        let mut storage = self.storage.write().await;
        storage.evict_expired(self.clock.now());
        storage
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hash_set(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()> {
        self.storage().await.hash_set(key, fields)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let storage = self.storage().await;
        Ok(storage
            .hash(key)?
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let storage = self.storage().await;
        Ok(storage.hash(key)?.cloned().unwrap_or_default())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.storage().await.entries.contains_key(key))
    }

    async fn key_kind(&self, key: &str) -> Result<Option<KeyKind>> {
        Ok(self.storage().await.entries.get(key).map(Entry::kind))
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut storage = self.storage().await;
        Ok(keys.iter().filter(|key| storage.remove(key)).count() as u64)
    }

    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<bool> {
        let now = self.clock.now();
        let mut storage = self.storage().await;
        if !storage.entries.contains_key(key) {
            return Ok(false);
        }
        if at <= now {
            storage.remove(key);
        } else {
            storage.expirations.insert(key.to_string(), at);
        }
        Ok(true)
    }

    async fn persist(&self, key: &str) -> Result<bool> {
        Ok(self.storage().await.expirations.remove(key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let now = self.clock.now();
        let storage = self.storage().await;
        if !storage.entries.contains_key(key) {
            return Ok(KeyTtl::Missing);
        }
        Ok(match storage.expirations.get(key) {
            None => KeyTtl::Persistent,
            Some(at) => KeyTtl::from_millis((*at - now).num_milliseconds()),
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        self.storage().await.set_add(key, member)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.storage().await.set_remove(key, member)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let storage = self.storage().await;
        Ok(storage
            .set(key)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let storage = self.storage().await;
        Ok(storage.set(key)?.is_some_and(|set| set.contains(member)))
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<u64> {
        self.storage().await.list_push(key, value)
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>> {
        let mut storage = self.storage().await;
        if storage.list(key)?.is_none() {
            return Ok(None);
        }
        let popped = storage.list_mut(key)?.pop_front();
        storage.drop_if_empty(key);
        Ok(popped)
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let storage = self.storage().await;
        Ok(storage
            .list(key)?
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<u64> {
        self.storage().await.list_remove(key, value)
    }

    async fn commit(&self, tx: &Transaction) -> Result<bool> {
        let mut storage = self.storage().await;

        for check in tx.checks() {
            if !storage.check(check)? {
                return Ok(false);
            }
        }
        for op in tx.ops() {
            storage.validate(op)?;
        }
        for op in tx.ops() {
            storage.apply(op)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use chrono::Duration;

    #[tokio::test]
    async fn test_hash_round_trip() {
        let store = MemoryStore::new();
        store
            .hash_set(
                "job:1",
                &[
                    ("status".to_string(), b"queued".to_vec()),
                    ("origin".to_string(), b"default".to_vec()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            store.hash_get("job:1", "status").await.unwrap(),
            Some(b"queued".to_vec())
        );
        assert_eq!(store.hash_get_all("job:1").await.unwrap().len(), 2);
        assert_eq!(store.key_kind("job:1").await.unwrap(), Some(KeyKind::Hash));
        assert!(store.hash_get_all("job:2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_kind_is_an_error() {
        let store = MemoryStore::new();
        store.list_push("queue:default", "a").await.unwrap();

        let err = store.set_add("queue:default", "a").await.unwrap_err();
        assert!(matches!(err, DeferworkError::Store { .. }));
        assert!(store.hash_get("queue:default", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_collections_disappear() {
        let store = MemoryStore::new();
        store.set_add("s", "a").await.unwrap();
        assert!(store.set_remove("s", "a").await.unwrap());
        assert!(!store.exists("s").await.unwrap());

        store.list_push("l", "a").await.unwrap();
        assert_eq!(store.list_pop_front("l").await.unwrap(), Some("a".to_string()));
        assert!(!store.exists("l").await.unwrap());
        assert_eq!(store.list_pop_front("l").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_is_fifo_and_remove_counts() {
        let store = MemoryStore::new();
        for value in ["a", "b", "a", "c"] {
            store.list_push("l", value).await.unwrap();
        }
        assert_eq!(store.list_remove("l", "a").await.unwrap(), 2);
        assert_eq!(store.list_range("l").await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.list_pop_front("l").await.unwrap(), Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_expiry_follows_clock() {
        let clock = MockClock::new();
        let store = MemoryStore::with_clock(clock.clone());

        store.set_add("s", "a").await.unwrap();
        assert_eq!(store.ttl("s").await.unwrap(), KeyTtl::Persistent);

        assert!(store.expire_at("s", clock.now() + Duration::seconds(100)).await.unwrap());
        assert_eq!(store.ttl("s").await.unwrap(), KeyTtl::ExpiresIn(100));

        assert!(store.persist("s").await.unwrap());
        assert_eq!(store.ttl("s").await.unwrap(), KeyTtl::Persistent);

        store.expire_at("s", clock.now() + Duration::seconds(1)).await.unwrap();
        clock.advance(Duration::seconds(2));
        assert!(!store.exists("s").await.unwrap());
        assert_eq!(store.ttl("s").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn test_expire_missing_key_and_past_deadline() {
        let clock = MockClock::new();
        let store = MemoryStore::with_clock(clock.clone());
        assert!(!store.expire_at("nope", clock.now()).await.unwrap());

        store.set_add("s", "a").await.unwrap();
        assert!(store.expire_at("s", clock.now() - Duration::seconds(1)).await.unwrap());
        assert!(!store.exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_rewrite_keeps_expiry() {
        let clock = MockClock::new();
        let store = MemoryStore::with_clock(clock.clone());
        store.set_add("s", "a").await.unwrap();
        store.expire_at("s", clock.now() + Duration::seconds(10)).await.unwrap();

        store.set_add("s", "b").await.unwrap();
        assert_eq!(store.ttl("s").await.unwrap(), KeyTtl::ExpiresIn(10));
    }

    #[tokio::test]
    async fn test_commit_applies_only_when_checks_hold() {
        let store = MemoryStore::new();
        store
            .hash_set("job:p", &[("status".to_string(), b"started".to_vec())])
            .await
            .unwrap();
        store.set_add("deferred:default", "c").await.unwrap();

        let tx = Transaction::new()
            .require_field("job:p", "status", "finished")
            .require_member("deferred:default", "c")
            .set_remove("deferred:default", "c")
            .list_push("queue:default", "c");

        assert!(!store.commit(&tx).await.unwrap());
        assert!(store.list_range("queue:default").await.unwrap().is_empty());

        store
            .hash_set("job:p", &[("status".to_string(), b"finished".to_vec())])
            .await
            .unwrap();
        assert!(store.commit(&tx).await.unwrap());
        assert_eq!(store.list_range("queue:default").await.unwrap(), vec!["c"]);
        assert!(!store.exists("deferred:default").await.unwrap());

        // The membership check now fails, so a second commit is a no-op.
        assert!(!store.commit(&tx).await.unwrap());
        assert_eq!(store.list_range("queue:default").await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_commit_with_bad_op_writes_nothing() {
        let store = MemoryStore::new();
        store.set_add("s", "x").await.unwrap();

        let tx = Transaction::new().list_push("l", "a").list_push("s", "b");
        assert!(store.commit(&tx).await.is_err());
        assert!(!store.exists("l").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_counts_existing_keys() {
        let store = MemoryStore::new();
        store.set_add("a", "1").await.unwrap();
        store.list_push("b", "1").await.unwrap();

        let deleted = store
            .delete(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.key_count().await, 0);
    }
}
