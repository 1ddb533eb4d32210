//! Per-queue registry of deferred jobs.

use crate::{
    Result,
    connection::Connection,
    job::{Job, JobId},
    store::{self, keys},
};
use tracing::debug;
use uuid::Uuid;

/// The set of jobs deferred on a queue, waiting for their parents.
#[derive(Debug, Clone)]
pub struct DeferredRegistry {
    name: String,
    conn: Connection,
}

impl DeferredRegistry {
    pub fn new(conn: Connection, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conn,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> String {
        keys::deferred(&self.name)
    }

    /// Deferred job ids, sorted.
    pub async fn get_job_ids(&self) -> Result<Vec<JobId>> {
        let mut ids = self
            .conn
            .store()
            .set_members(&self.key())
            .await?
            .iter()
            .map(|member| Uuid::parse_str(member))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        ids.sort();
        Ok(ids)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.conn.store().set_members(&self.key()).await?.len())
    }

    pub async fn contains(&self, id: JobId) -> Result<bool> {
        self.conn
            .store()
            .set_contains(&self.key(), &store::member(&id))
            .await
    }

    /// Drop ids whose job record no longer exists, such as deferred jobs
    /// that expired before their parents finished. Returns how many were
    /// removed.
    pub async fn compact(&self) -> Result<u64> {
        let mut removed = 0;
        for id in self.get_job_ids().await? {
            if !Job::exists(&self.conn, id).await? && self.remove(id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(registry = %self.name, removed, "Compacted deferred registry");
        }
        Ok(removed)
    }

    pub(crate) async fn add(&self, id: JobId) -> Result<bool> {
        self.conn
            .store()
            .set_add(&self.key(), &store::member(&id))
            .await
    }

    pub(crate) async fn remove(&self, id: JobId) -> Result<bool> {
        self.conn
            .store()
            .set_remove(&self.key(), &store::member(&id))
            .await
    }
}
