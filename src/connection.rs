//! The handle every deferwork component is built from.
//!
//! A [`Connection`] bundles the store, the function resolver, the clock and
//! the configuration. It is cheap to clone; jobs, queues and workers each hold
//! their own copy instead of reaching for process-wide state.

use crate::{
    DeferworkError, Result,
    clock::{Clock, SystemClock},
    config::DeferworkConfig,
    function::FunctionResolver,
    job::{Job, JobId, JobStatus},
    queue::Queue,
    registry::DeferredRegistry,
    store::{Store, keys},
};
use chrono::{DateTime, Utc};
use std::{fmt, sync::Arc};

#[derive(Clone)]
pub struct Connection {
    store: Arc<dyn Store>,
    resolver: Arc<dyn FunctionResolver>,
    clock: Arc<dyn Clock>,
    config: Arc<DeferworkConfig>,
}

impl Connection {
    pub fn new(store: Arc<dyn Store>, resolver: Arc<dyn FunctionResolver>) -> Self {
        Self {
            store,
            resolver,
            clock: Arc::new(SystemClock),
            config: Arc::new(DeferworkConfig::default()),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_config(mut self, config: DeferworkConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn resolver(&self) -> &dyn FunctionResolver {
        self.resolver.as_ref()
    }

    pub fn config(&self) -> &DeferworkConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn queue(&self, name: impl Into<String>) -> Queue {
        Queue::new(self.clone(), name)
    }

    /// The queue named by `queue.default_queue` in the configuration.
    pub fn default_queue(&self) -> Queue {
        self.queue(self.config.queue.default_queue.clone())
    }

    pub fn deferred_registry(&self, name: impl Into<String>) -> DeferredRegistry {
        DeferredRegistry::new(self.clone(), name)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        Job::fetch(self, id).await
    }

    pub async fn job_exists(&self, id: JobId) -> Result<bool> {
        Job::exists(self, id).await
    }

    /// Stored status of `id`; `None` when the job or its status is missing.
    pub async fn job_status(&self, id: JobId) -> Result<Option<JobStatus>> {
        let Some(bytes) = self.store.hash_get(&keys::job(&id), "status").await? else {
            return Ok(None);
        };
        let invalid = |message: String| DeferworkError::InvalidRecord {
            id,
            field: "status".to_string(),
            message,
        };
        let text = String::from_utf8(bytes).map_err(|e| invalid(e.to_string()))?;
        JobStatus::parse(&text)
            .map(Some)
            .ok_or_else(|| invalid(format!("unknown status '{}'", text)))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::MockClock, function::FunctionRegistry, store::MemoryStore};
    use uuid::Uuid;

    fn connection() -> Connection {
        Connection::new(Arc::new(MemoryStore::new()), Arc::new(FunctionRegistry::new()))
    }

    #[tokio::test]
    async fn test_missing_job() {
        let conn = connection();
        let id = Uuid::new_v4();

        assert!(!conn.job_exists(id).await.unwrap());
        assert_eq!(conn.job_status(id).await.unwrap(), None);
        assert!(matches!(
            conn.get_job(id).await,
            Err(DeferworkError::NoSuchJob { id: missing }) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_unknown_status_is_invalid_record() {
        let conn = connection();
        let id = Uuid::new_v4();
        conn.store()
            .hash_set(&keys::job(&id), &[("status".to_string(), b"running".to_vec())])
            .await
            .unwrap();

        assert!(matches!(
            conn.job_status(id).await,
            Err(DeferworkError::InvalidRecord { .. })
        ));
    }

    #[test]
    fn test_clock_and_config_overrides() {
        let clock = MockClock::new();
        let config = DeferworkConfig::new().with_default_queue("reports");
        let conn = connection().with_clock(clock.clone()).with_config(config);

        assert_eq!(conn.now(), clock.now());
        assert_eq!(conn.default_queue().name(), "reports");
        assert_eq!(conn.deferred_registry("reports").key(), "deferred:reports");
    }
}
