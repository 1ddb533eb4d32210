//! Named FIFO queues of job ids.
//!
//! A queue is a store list under `queue:<name>`. Jobs are pushed on the tail
//! and popped from the head. Job ids whose records have expired or been
//! deleted may linger in the list; readers skip them and [`Queue::compact`]
//! removes them.
//!
//! # Examples
//!
//! ```rust
//! use deferwork::{Call, Connection, FunctionRegistry};
//! use deferwork::store::MemoryStore;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = Connection::new(Arc::new(MemoryStore::new()), Arc::new(FunctionRegistry::new()));
//! let queue = conn.queue("emails");
//!
//! let job = queue.enqueue(Call::new("mailer.send").arg(json!("hi@example.com"))).await?;
//! assert_eq!(queue.get_job_ids().await?, vec![job.id]);
//!
//! let next = queue.dequeue_job().await?.expect("a job");
//! assert_eq!(next.id, job.id);
//! assert!(queue.is_empty().await?);
//! # Ok(())
//! # }
//! ```

use crate::{
    Call, DeferworkError, Result,
    connection::Connection,
    dependency::DependencyResolver,
    job::{Job, JobId, JobStatus},
    store::{self, keys},
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Queue {
    name: String,
    conn: Connection,
    synchronous: bool,
}

impl Queue {
    pub fn new(conn: Connection, name: impl Into<String>) -> Self {
        let synchronous = conn.config().queue.synchronous;
        Self {
            name: name.into(),
            conn,
            synchronous,
        }
    }

    /// Perform jobs inline at enqueue time instead of leaving them for a
    /// worker.
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> String {
        keys::queue(&self.name)
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    /// Create a job from `call` and queue it, or defer it when it has
    /// unfinished parents.
    ///
    /// On a synchronous queue a job that ends up queued is taken straight
    /// back off the queue and performed before this returns.
    pub async fn enqueue(&self, call: Call) -> Result<Job> {
        let mut job = DependencyResolver::new(self.conn.clone())
            .enqueue(&self.name, call)
            .await?;

        if self.synchronous && job.status() == Some(JobStatus::Queued) {
            self.remove(job.id).await?;
            job.perform().await?;
        }
        Ok(job)
    }

    /// Queue an existing job on this queue, ignoring its parents.
    pub async fn enqueue_job(&self, job: &mut Job) -> Result<()> {
        self.prepare(job).await?;
        self.push(job.id).await?;
        Ok(())
    }

    /// Mark `job` as queued here and save it, without making it visible.
    pub(crate) async fn prepare(&self, job: &mut Job) -> Result<()> {
        if !JobStatus::can_transition(job.status(), JobStatus::Queued) {
            return Err(DeferworkError::InvalidStatusTransition {
                id: job.id,
                from: job.status(),
                to: JobStatus::Queued,
            });
        }
        job.origin = Some(self.name.clone());
        job.enqueued_at = Some(self.conn.now());
        job.set_status(JobStatus::Queued).await?;
        job.save().await
    }

    pub(crate) async fn push(&self, id: JobId) -> Result<()> {
        let length = self
            .conn
            .store()
            .list_push(&self.key(), &store::member(&id))
            .await?;
        debug!(job_id = %id, queue = %self.name, length, "Enqueued job");
        Ok(())
    }

    pub(crate) async fn remove(&self, id: JobId) -> Result<u64> {
        self.conn
            .store()
            .list_remove(&self.key(), &store::member(&id))
            .await
    }

    /// Pop the id at the head of the queue.
    pub async fn dequeue(&self) -> Result<Option<JobId>> {
        while let Some(member) = self.conn.store().list_pop_front(&self.key()).await? {
            match Uuid::parse_str(&member) {
                Ok(id) => return Ok(Some(id)),
                Err(e) => {
                    warn!(queue = %self.name, %member, error = %e, "Dropping malformed job id");
                }
            }
        }
        Ok(None)
    }

    /// Pop ids until one still has a record, and load it.
    pub async fn dequeue_job(&self) -> Result<Option<Job>> {
        while let Some(id) = self.dequeue().await? {
            match Job::fetch(&self.conn, id).await {
                Ok(job) => return Ok(Some(job)),
                Err(DeferworkError::NoSuchJob { .. }) => {
                    debug!(job_id = %id, queue = %self.name, "Skipping expired job");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Queued ids, head first.
    pub async fn get_job_ids(&self) -> Result<Vec<JobId>> {
        self.conn
            .store()
            .list_range(&self.key())
            .await?
            .iter()
            .map(|member| Uuid::parse_str(member).map_err(DeferworkError::from))
            .collect()
    }

    /// Queued jobs, head first, skipping ids without a record.
    pub async fn get_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for id in self.get_job_ids().await? {
            match Job::fetch(&self.conn, id).await {
                Ok(job) => jobs.push(job),
                Err(DeferworkError::NoSuchJob { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.conn.store().list_range(&self.key()).await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.count().await? == 0)
    }

    /// Drop ids whose job record no longer exists. Returns how many were
    /// removed.
    pub async fn compact(&self) -> Result<u64> {
        let mut removed = 0;
        for id in self.get_job_ids().await? {
            if !Job::exists(&self.conn, id).await? {
                removed += self.remove(id).await?;
            }
        }
        if removed > 0 {
            debug!(queue = %self.name, removed, "Compacted queue");
        }
        Ok(removed)
    }
}
