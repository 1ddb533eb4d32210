
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deferwork::{
    Call, Connection, DeferworkConfig, DeferworkError, DependencyResolver, Job, JobStatus,
    Result, Store,
    store::{KeyKind, KeyTtl, MemoryStore, Transaction},
};
use serde_json::json;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};
use test_utils::{fixtures, setup};

#[tokio::test]
async fn test_finished_parent_does_not_defer() {
    let ctx = setup();
    let queue = ctx.conn.queue("default");
    let mut parent = queue.enqueue(Call::new("fixtures.say_hello")).await.unwrap();
    queue.dequeue().await.unwrap();
    parent.perform().await.unwrap();

    let child = queue
        .enqueue(Call::new("fixtures.echo").arg(parent.future_result()))
        .await
        .unwrap();

    assert_eq!(child.status(), Some(JobStatus::Queued));
    assert_eq!(queue.get_job_ids().await.unwrap(), vec![child.id]);
    assert_eq!(ctx.conn.deferred_registry("default").count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_explicit_and_future_dependencies_are_merged() {
    let ctx = setup();
    let queue = ctx.conn.queue("default");
    let a = queue.enqueue(Call::new("fixtures.say_hello")).await.unwrap();
    let b = queue.enqueue(Call::new("fixtures.say_hello")).await.unwrap();

    let child = queue
        .enqueue(
            Call::new("fixtures.echo")
                .arg(b.future_result())
                .depends_on(&a)
                .depends_on(b.id),
        )
        .await
        .unwrap();

    assert_eq!(child.parent_ids(), &[b.id, a.id]);
    assert_eq!(a.dependents().await.unwrap(), vec![child.id]);
    assert_eq!(b.dependents().await.unwrap(), vec![child.id]);
}

#[tokio::test]
async fn test_child_waits_for_every_parent() {
    let ctx = setup();
    let queue = ctx.conn.queue("default");
    let mut a = queue.enqueue(Call::new("fixtures.say_hello")).await.unwrap();
    let mut b = queue
        .enqueue(Call::new("fixtures.say_hello").arg(json!("B")))
        .await
        .unwrap();
    let mut child = queue
        .enqueue(
            Call::new("fixtures.echo")
                .arg(a.future_result())
                .kwarg("other", b.future_result()),
        )
        .await
        .unwrap();
    assert_eq!(child.status(), Some(JobStatus::Deferred));

    queue.dequeue().await.unwrap();
    a.perform().await.unwrap();
    assert_eq!(
        ctx.conn.job_status(child.id).await.unwrap(),
        Some(JobStatus::Deferred)
    );
    assert!(!queue.get_job_ids().await.unwrap().contains(&child.id));

    queue.dequeue().await.unwrap();
    b.perform().await.unwrap();
    assert_eq!(
        ctx.conn.job_status(child.id).await.unwrap(),
        Some(JobStatus::Queued)
    );
    assert_eq!(queue.get_job_ids().await.unwrap(), vec![child.id]);
    assert_eq!(ctx.conn.deferred_registry("default").count().await.unwrap(), 0);

    let outcome = child.perform().await.unwrap();
    assert_eq!(
        outcome.result(),
        Some(&json!({
            "args": ["Hi there, Stranger!"],
            "kwargs": {"other": "Hi there, B!"}
        }))
    );
}

#[tokio::test]
async fn test_promoted_child_gets_enqueued_at() {
    let ctx = setup();
    let queue = ctx.conn.queue("default");
    let mut parent = queue.enqueue(Call::new("fixtures.say_hello")).await.unwrap();
    let child = queue
        .enqueue(Call::new("fixtures.say_hello").depends_on(&parent))
        .await
        .unwrap();
    assert!(child.enqueued_at.is_none());

    ctx.clock.advance(chrono::Duration::seconds(30));
    queue.dequeue().await.unwrap();
    parent.perform().await.unwrap();

    let child = ctx.conn.get_job(child.id).await.unwrap();
    assert_eq!(child.status(), Some(JobStatus::Queued));
    assert_eq!(
        child.enqueued_at.map(|at| at.timestamp()),
        Some(ctx.conn.now().timestamp())
    );
}

#[tokio::test]
async fn test_failed_parent_leaves_child_deferred() {
    let ctx = setup();
    let queue = ctx.conn.queue("default");
    let mut parent = queue
        .enqueue(Call::new("fixtures.div_by_zero"))
        .await
        .unwrap();
    let child = queue
        .enqueue(Call::new("fixtures.echo").arg(parent.future_result()))
        .await
        .unwrap();

    queue.dequeue().await.unwrap();
    assert!(!parent.perform().await.unwrap().is_finished());

    assert_eq!(
        ctx.conn.job_status(child.id).await.unwrap(),
        Some(JobStatus::Deferred)
    );
    assert!(ctx.conn.deferred_registry("default").contains(child.id).await.unwrap());
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_expired_deferred_job_is_not_promoted() {
    let ctx = setup();
    let queue = ctx.conn.queue("default");
    let mut parent = queue.enqueue(Call::new("fixtures.say_hello")).await.unwrap();
    let child = queue
        .enqueue(Call::new("fixtures.say_hello").depends_on(&parent).ttl(1))
        .await
        .unwrap();
    assert_eq!(
        ctx.conn.store().ttl(&child.key()).await.unwrap(),
        KeyTtl::ExpiresIn(1)
    );

    ctx.clock.advance(chrono::Duration::seconds(2));
    queue.dequeue().await.unwrap();
    parent.perform().await.unwrap();

    // The expired child is not resurrected by its parent finishing.
    assert!(!ctx.conn.job_exists(child.id).await.unwrap());
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_deleted_child_is_not_promoted() {
    let ctx = setup();
    let queue = ctx.conn.queue("default");
    let mut parent = queue.enqueue(Call::new("fixtures.say_hello")).await.unwrap();
    let child = queue
        .enqueue(Call::new("fixtures.say_hello").depends_on(&parent))
        .await
        .unwrap();

    child.delete().await.unwrap();
    queue.dequeue().await.unwrap();
    parent.perform().await.unwrap();

    assert!(queue.is_empty().await.unwrap());
    assert!(!ctx.conn.job_exists(child.id).await.unwrap());
}

#[tokio::test]
async fn test_promote_ready_children_is_idempotent() {
    let ctx = setup();
    let queue = ctx.conn.queue("default");
    let mut parent = queue.enqueue(Call::new("fixtures.say_hello")).await.unwrap();
    let child = queue
        .enqueue(Call::new("fixtures.say_hello").depends_on(&parent))
        .await
        .unwrap();

    queue.dequeue().await.unwrap();
    parent.perform().await.unwrap();

    let resolver = DependencyResolver::new(ctx.conn.clone());
    assert!(resolver.promote_ready_children(parent.id).await.unwrap().is_empty());
    assert!(!resolver.promote_child(child.id).await.unwrap());
    assert_eq!(queue.get_job_ids().await.unwrap(), vec![child.id]);
}

#[tokio::test]
async fn test_enqueue_or_defer_uses_default_queue() {
    let ctx = setup();
    let mut job = Job::create(&ctx.conn, Call::new("fixtures.say_hello")).unwrap();
    job.save().await.unwrap();

    DependencyResolver::new(ctx.conn.clone())
        .enqueue_or_defer(&mut job)
        .await
        .unwrap();

    assert_eq!(job.origin.as_deref(), Some("default"));
    assert_eq!(job.status(), Some(JobStatus::Queued));
    assert_eq!(ctx.conn.default_queue().get_job_ids().await.unwrap(), vec![job.id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_parents_enqueue_child_once() {
    for _ in 0..25 {
        let ctx = setup();
        let queue = ctx.conn.queue("default");
        let parents = vec![
            queue.enqueue(Call::new("fixtures.say_hello").arg(json!("A"))).await.unwrap(),
            queue.enqueue(Call::new("fixtures.say_hello").arg(json!("B"))).await.unwrap(),
            queue.enqueue(Call::new("fixtures.say_hello").arg(json!("C"))).await.unwrap(),
        ];
        let child = queue
            .enqueue(Call::new("fixtures.say_hello").depends_on_all(parents.iter()))
            .await
            .unwrap();
        assert_eq!(child.status(), Some(JobStatus::Deferred));
        for _ in &parents {
            queue.dequeue().await.unwrap();
        }

        let handles: Vec<_> = parents
            .into_iter()
            .map(|mut parent| tokio::spawn(async move { parent.perform().await }))
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_finished());
        }

        assert_eq!(queue.get_job_ids().await.unwrap(), vec![child.id]);
        assert_eq!(
            ctx.conn.job_status(child.id).await.unwrap(),
            Some(JobStatus::Queued)
        );
        assert_eq!(ctx.conn.deferred_registry("default").count().await.unwrap(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parent_finishing_during_enqueue_does_not_strand_child() {
    for _ in 0..25 {
        let ctx = setup();
        let queue = ctx.conn.queue("default");
        let mut parent = queue.enqueue(Call::new("fixtures.say_hello")).await.unwrap();
        queue.dequeue().await.unwrap();

        let parent_id = parent.id;
        let performing = tokio::spawn(async move { parent.perform().await });
        let enqueue_queue = queue.clone();
        let enqueuing = tokio::spawn(async move {
            enqueue_queue
                .enqueue(Call::new("fixtures.say_hello").depends_on(parent_id))
                .await
        });

        performing.await.unwrap().unwrap();
        let child = enqueuing.await.unwrap().unwrap();

        assert_eq!(
            ctx.conn.job_status(child.id).await.unwrap(),
            Some(JobStatus::Queued)
        );
        assert_eq!(queue.get_job_ids().await.unwrap(), vec![child.id]);
    }
}

/// Delegates to a [`MemoryStore`] but reports a conflict for the first
/// `conflicts` commits.
struct ConflictingStore {
    inner: MemoryStore,
    conflicts: AtomicU32,
    commits: AtomicU32,
}

impl ConflictingStore {
    fn new(conflicts: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            conflicts: AtomicU32::new(conflicts),
            commits: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Store for ConflictingStore {
    async fn hash_set(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()> {
        self.inner.hash_set(key, fields).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.inner.hash_get(key, field).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        self.inner.hash_get_all(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn key_kind(&self, key: &str) -> Result<Option<KeyKind>> {
        self.inner.key_kind(key).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.inner.delete(keys).await
    }

    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<bool> {
        self.inner.expire_at(key, at).await
    }

    async fn persist(&self, key: &str) -> Result<bool> {
        self.inner.persist(key).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.inner.ttl(key).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.set_remove(key, member).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.inner.set_members(key).await
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.set_contains(key, member).await
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<u64> {
        self.inner.list_push(key, value).await
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>> {
        self.inner.list_pop_front(key).await
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        self.inner.list_range(key).await
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<u64> {
        self.inner.list_remove(key, value).await
    }

    async fn commit(&self, tx: &Transaction) -> Result<bool> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(DeferworkError::TransactionConflict {
                key: tx.keys().first().map(|key| key.to_string()).unwrap_or_default(),
                attempts: 1,
            });
        }
        self.inner.commit(tx).await
    }
}

async fn deferred_child(conn: &Connection) -> (Job, Job) {
    let queue = conn.queue("default");
    let parent = queue.enqueue(Call::new("fixtures.say_hello")).await.unwrap();
    let child = queue
        .enqueue(Call::new("fixtures.say_hello").depends_on(&parent))
        .await
        .unwrap();
    queue.dequeue().await.unwrap();
    conn.store()
        .hash_set(
            &parent.key(),
            &[("status".to_string(), b"finished".to_vec())],
        )
        .await
        .unwrap();
    (parent, child)
}

#[tokio::test]
async fn test_promotion_retries_conflicts() {
    let store = Arc::new(ConflictingStore::new(0));
    let conn = Connection::new(store.clone(), Arc::new(fixtures()))
        .with_config(DeferworkConfig::new().with_promotion_retries(3));
    let (parent, child) = deferred_child(&conn).await;

    store.conflicts.store(2, Ordering::SeqCst);
    let before = store.commits.load(Ordering::SeqCst);
    let promoted = DependencyResolver::new(conn.clone())
        .promote_ready_children(parent.id)
        .await
        .unwrap();

    assert_eq!(promoted, vec![child.id]);
    assert_eq!(store.commits.load(Ordering::SeqCst) - before, 3);
    assert_eq!(conn.queue("default").get_job_ids().await.unwrap(), vec![child.id]);
}

#[tokio::test]
async fn test_promotion_gives_up_after_retries() {
    let store = Arc::new(ConflictingStore::new(0));
    let conn = Connection::new(store.clone(), Arc::new(fixtures()))
        .with_config(DeferworkConfig::new().with_promotion_retries(2));
    let (_parent, child) = deferred_child(&conn).await;

    store.conflicts.store(5, Ordering::SeqCst);
    let err = DependencyResolver::new(conn.clone())
        .promote_child(child.id)
        .await
        .unwrap_err();

    assert!(matches!(err, DeferworkError::TransactionConflict { attempts: 2, .. }));
    assert_eq!(
        conn.job_status(child.id).await.unwrap(),
        Some(JobStatus::Deferred)
    );
    assert!(conn.deferred_registry("default").contains(child.id).await.unwrap());
}
