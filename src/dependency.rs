//! Job dependencies: deferring jobs until their parents finish.
//!
//! A job with unfinished parents is parked in its queue's deferred registry
//! instead of the queue itself. Each parent records the job in its children
//! set. When a parent finishes, every child whose parents have now all
//! finished is moved into its queue with one atomic store transaction, so a
//! child is enqueued exactly once even when several parents finish at the
//! same moment.
//!
//! Enqueueing registers the child with its parents *before* checking their
//! status and, after deferring, tries one promotion itself. A parent that
//! finishes anywhere in between therefore either sees the child in its
//! children set or is seen as finished by the child, and the child cannot be
//! stranded in the deferred registry.

use crate::{
    DeferworkError, Result,
    call::FutureResult,
    connection::Connection,
    job::{Job, JobId, JobStatus, format_timestamp},
    queue::Queue,
    store::{self, Transaction, keys},
    ttl::Expiration,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A parent job a new job waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dependency(JobId);

impl Dependency {
    pub fn job_id(&self) -> JobId {
        self.0
    }

    /// Parse a job id given as text.
    pub fn parse(id: &str) -> Result<Self> {
        Ok(Self(Uuid::parse_str(id)?))
    }
}

impl From<JobId> for Dependency {
    fn from(id: JobId) -> Self {
        Self(id)
    }
}

impl From<&Job> for Dependency {
    fn from(job: &Job) -> Self {
        Self(job.id)
    }
}

impl From<FutureResult> for Dependency {
    fn from(future: FutureResult) -> Self {
        Self(future.job_id)
    }
}

impl TryFrom<&str> for Dependency {
    type Error = DeferworkError;

    fn try_from(id: &str) -> Result<Self> {
        Dependency::parse(id)
    }
}

/// Enqueue and promotion logic for jobs with parents.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    conn: Connection,
}

impl DependencyResolver {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Create a job from `call`, save it with `queue` as its origin, and
    /// either queue or defer it.
    pub async fn enqueue(&self, queue: &str, call: crate::Call) -> Result<Job> {
        let mut job = Job::create(&self.conn, call)?;
        job.origin = Some(queue.to_string());
        job.save().await?;
        self.enqueue_or_defer(&mut job).await?;
        Ok(job)
    }

    /// Queue `job` when all its parents have finished, otherwise defer it.
    ///
    /// Jobs without an origin go to the configured default queue.
    pub async fn enqueue_or_defer(&self, job: &mut Job) -> Result<()> {
        let origin = match &job.origin {
            Some(origin) => origin.clone(),
            None => {
                let origin = self.conn.config().queue.default_queue.clone();
                job.origin = Some(origin.clone());
                origin
            }
        };

        self.register_dependents(job).await?;

        match self.first_unfinished_parent(job.parent_ids()).await? {
            Some(parent_id) => {
                job.set_status(JobStatus::Deferred).await?;
                job.save().await?;
                self.apply_ttl(job).await?;
                self.conn
                    .deferred_registry(origin.clone())
                    .add(job.id)
                    .await?;
                debug!(job_id = %job.id, %parent_id, queue = %origin, "Deferred job");

                if self.promote_child(job.id).await? {
                    job.refresh().await?;
                }
            }
            None => {
                let queue = Queue::new(self.conn.clone(), origin);
                queue.prepare(job).await?;
                self.apply_ttl(job).await?;
                queue.push(job.id).await?;
            }
        }
        Ok(())
    }

    async fn apply_ttl(&self, job: &mut Job) -> Result<()> {
        let Some(ttl) = job.ttl else {
            return Ok(());
        };
        match Expiration::plan(ttl, job.status(), self.conn.now()) {
            Expiration::DeleteNow => job.delete().await,
            plan => {
                plan.apply(self.conn.store(), &[job.key(), job.children_key()])
                    .await
            }
        }
    }

    /// Add `job` to the children set of each of its parents.
    pub async fn register_dependents(&self, job: &Job) -> Result<()> {
        let member = store::member(&job.id);
        for parent_id in job.parent_ids() {
            self.conn
                .store()
                .set_add(&keys::children(parent_id), &member)
                .await?;
        }
        Ok(())
    }

    async fn first_unfinished_parent(&self, parent_ids: &[JobId]) -> Result<Option<JobId>> {
        for parent_id in parent_ids {
            if self.conn.job_status(*parent_id).await? != Some(JobStatus::Finished) {
                return Ok(Some(*parent_id));
            }
        }
        Ok(None)
    }

    /// Promote every child of `parent_id` whose parents have all finished.
    ///
    /// Returns the ids that this call moved into a queue.
    pub async fn promote_ready_children(&self, parent_id: JobId) -> Result<Vec<JobId>> {
        let members = self
            .conn
            .store()
            .set_members(&keys::children(&parent_id))
            .await?;

        let mut promoted = Vec::new();
        for member in members {
            let child_id = match Uuid::parse_str(&member) {
                Ok(id) => id,
                Err(e) => {
                    warn!(%parent_id, %member, error = %e, "Ignoring malformed child id");
                    continue;
                }
            };
            if self.promote_child(child_id).await? {
                promoted.push(child_id);
            }
        }
        Ok(promoted)
    }

    /// Move a deferred child into its queue if every parent has finished.
    ///
    /// Returns false when the child is gone, no longer deferred, or still
    /// waiting on a parent.
    pub async fn promote_child(&self, child_id: JobId) -> Result<bool> {
        let child = match Job::fetch(&self.conn, child_id).await {
            Ok(child) => child,
            Err(DeferworkError::NoSuchJob { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if child.status() != Some(JobStatus::Deferred) {
            return Ok(false);
        }
        let Some(origin) = child.origin.clone() else {
            return Ok(false);
        };
        if self
            .first_unfinished_parent(child.parent_ids())
            .await?
            .is_some()
        {
            return Ok(false);
        }

        let member = store::member(&child_id);
        let deferred_key = keys::deferred(&origin);
        let mut tx = Transaction::new()
            .require_field(child.key(), "status", JobStatus::Deferred.as_str())
            .require_member(deferred_key.clone(), member.clone());
        for parent_id in child.parent_ids() {
            tx = tx.require_field(keys::job(parent_id), "status", JobStatus::Finished.as_str());
        }
        let tx = tx
            .set_remove(deferred_key, member.clone())
            .list_push(keys::queue(&origin), member)
            .hash_set(child.key(), "status", JobStatus::Queued.as_str())
            .hash_set(child.key(), "enqueued_at", format_timestamp(&self.conn.now()));

        let attempts = self.conn.config().queue.promotion_retries.max(1);
        for attempt in 1..=attempts {
            match self.conn.store().commit(&tx).await {
                Ok(true) => {
                    info!(job_id = %child_id, queue = %origin, "Promoted deferred job");
                    return Ok(true);
                }
                Ok(false) => return Ok(false),
                Err(DeferworkError::TransactionConflict { .. }) => {
                    debug!(job_id = %child_id, attempt, "Promotion conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(DeferworkError::TransactionConflict {
            key: child.key(),
            attempts,
        })
    }
}
