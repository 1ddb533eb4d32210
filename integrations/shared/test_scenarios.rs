use deferwork::{
    Argument, BoxError, Call, Connection, DeferworkError, FunctionRegistry, Invocation, JobStatus,
    Result, Worker, WorkerPool,
};
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info};
use uuid::Uuid;

/// Shared end-to-end scenarios, run against whichever store backs `conn`.
#[derive(Clone)]
pub struct TestScenarios {
    pub conn: Connection,
    run_id: String,
}

fn ensure(condition: bool, message: impl Into<String>) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(DeferworkError::Worker {
            message: message.into(),
        })
    }
}

impl TestScenarios {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            run_id: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Functions the scenarios enqueue.
    pub fn functions() -> FunctionRegistry {
        FunctionRegistry::new()
            .with_function("integration.add", |inv: Invocation| async move {
                let a: i64 = inv.argument(0, "a")?;
                let b: i64 = inv.argument(1, "b")?;
                Ok::<_, BoxError>(json!(a + b))
            })
            .with_function("integration.sum", |inv: Invocation| async move {
                let values: Vec<i64> = inv.argument(0, "values")?;
                Ok::<_, BoxError>(json!(values.iter().sum::<i64>()))
            })
            .with_function("integration.fail", |_inv: Invocation| async move {
                Err::<Value, BoxError>("integration failure".into())
            })
    }

    /// Queue names are unique per run so repeated runs never see each
    /// other's jobs.
    fn queue_name(&self, name: &str) -> String {
        format!("{}-{}", name, self.run_id)
    }

    /// Enqueue, work and inspect a single job.
    pub async fn test_basic_job_lifecycle(&self) -> Result<()> {
        info!("🧪 Testing basic job lifecycle");

        let queue = self.conn.queue(self.queue_name("basic"));
        let job = queue
            .enqueue(Call::new("integration.add").arg(json!(2)).arg(json!(3)))
            .await?;
        ensure(job.status() == Some(JobStatus::Queued), "job should be queued")?;
        info!("✅ Job enqueued: {}", job.id);

        let worker = Worker::new(self.conn.clone(), vec![queue.name().to_string()]);
        let processed = worker.work_one().await?;
        ensure(
            processed.map(|job| job.id) == Some(job.id),
            "worker should take the job",
        )?;

        let finished = self.conn.get_job(job.id).await?;
        ensure(
            finished.status() == Some(JobStatus::Finished),
            "job should be finished",
        )?;
        ensure(finished.result == Some(json!(5)), "result should be 5")?;
        info!("✅ Job finished with result {:?}", finished.result);

        finished.delete().await?;
        ensure(!self.conn.job_exists(job.id).await?, "job should be deleted")?;
        info!("✅ Basic job lifecycle test completed");
        Ok(())
    }

    /// A chain of jobs passing results through future references.
    pub async fn test_dependency_chain(&self) -> Result<()> {
        info!("🧪 Testing dependency chain");

        let queue = self.conn.queue(self.queue_name("chain"));
        let first = queue
            .enqueue(Call::new("integration.add").arg(json!(1)).arg(json!(1)))
            .await?;
        let second = queue
            .enqueue(
                Call::new("integration.add")
                    .arg(first.future_result())
                    .arg(json!(10)),
            )
            .await?;
        let third = queue
            .enqueue(Call::new("integration.sum").arg(vec![
                Argument::from(first.future_result()),
                Argument::from(second.future_result()),
            ]))
            .await?;
        ensure(
            second.status() == Some(JobStatus::Deferred)
                && third.status() == Some(JobStatus::Deferred),
            "dependents should be deferred",
        )?;

        let worker = Worker::new(self.conn.clone(), vec![queue.name().to_string()]);
        let processed = worker.work_burst().await?;
        ensure(processed == 3, format!("expected 3 jobs, worked {}", processed))?;

        let third = self.conn.get_job(third.id).await?;
        ensure(third.result == Some(json!(14)), "chain should sum to 14")?;
        info!("✅ Dependency chain test completed");
        Ok(())
    }

    /// Several parents finishing on different workers promote their child once.
    pub async fn test_concurrent_fan_in(&self) -> Result<()> {
        info!("🧪 Testing concurrent fan-in");

        let queue_name = self.queue_name("fan-in");
        let queue = self.conn.queue(queue_name.clone());
        let mut parents = Vec::new();
        for n in 0..8 {
            parents.push(
                queue
                    .enqueue(Call::new("integration.add").arg(json!(n)).arg(json!(0)))
                    .await?,
            );
        }
        let child = queue
            .enqueue(
                Call::new("integration.sum").arg(Argument::Sequence(
                    parents
                        .iter()
                        .map(|parent| Argument::from(parent.future_result()))
                        .collect(),
                )),
            )
            .await?;

        let mut pool = WorkerPool::new();
        for _ in 0..4 {
            pool.add_worker(
                Worker::new(self.conn.clone(), vec![queue_name.clone()])
                    .with_poll_interval(Duration::from_millis(20)),
            );
        }
        pool.start()?;

        let mut status = self.conn.job_status(child.id).await?;
        for _ in 0..250 {
            if status == Some(JobStatus::Finished) {
                break;
            }
            sleep(Duration::from_millis(20)).await;
            status = self.conn.job_status(child.id).await?;
        }
        pool.shutdown().await?;

        ensure(status == Some(JobStatus::Finished), "child should finish")?;
        let child = self.conn.get_job(child.id).await?;
        ensure(child.result == Some(json!(28)), "child should sum to 28")?;
        ensure(queue.is_empty().await?, "queue should be drained")?;
        info!("✅ Concurrent fan-in test completed");
        Ok(())
    }

    /// Job TTLs expire queued jobs; readers skip what is gone.
    pub async fn test_job_expiry(&self) -> Result<()> {
        info!("🧪 Testing job expiry");

        let queue = self.conn.queue(self.queue_name("expiry"));
        let short = queue
            .enqueue(Call::new("integration.add").arg(json!(1)).arg(json!(2)).ttl(1))
            .await?;
        let kept = queue
            .enqueue(Call::new("integration.add").arg(json!(3)).arg(json!(4)))
            .await?;

        sleep(Duration::from_millis(1500)).await;
        ensure(!self.conn.job_exists(short.id).await?, "job should have expired")?;

        let jobs = queue.get_jobs().await?;
        ensure(
            jobs.len() == 1 && jobs[0].id == kept.id,
            "only the kept job should remain",
        )?;
        ensure(queue.compact().await? == 1, "compact should drop one id")?;
        info!("✅ Job expiry test completed");
        Ok(())
    }

    /// Failures are recorded on the job; lookups of missing jobs error.
    pub async fn test_error_handling(&self) -> Result<()> {
        info!("🧪 Testing error handling and edge cases");

        let queue = self.conn.queue(self.queue_name("errors"));
        ensure(queue.dequeue().await?.is_none(), "empty queue should yield nothing")?;

        let failing = queue.enqueue(Call::new("integration.fail")).await?;
        let worker = Worker::new(self.conn.clone(), vec![queue.name().to_string()]);
        worker.work_burst().await?;

        let failing = self.conn.get_job(failing.id).await?;
        ensure(
            failing.status() == Some(JobStatus::Failed),
            "failing job should be failed",
        )?;
        ensure(
            failing.exc_info.as_deref() == Some("integration failure"),
            "failure text should be recorded",
        )?;

        match self.conn.get_job(Uuid::new_v4()).await {
            Err(DeferworkError::NoSuchJob { .. }) => {}
            other => {
                return Err(DeferworkError::Worker {
                    message: format!("expected NoSuchJob, got {:?}", other.map(|job| job.id)),
                });
            }
        }
        info!("✅ Error handling test completed");
        Ok(())
    }

    async fn run_scenario<F>(name: &str, limit: Duration, scenario: F) -> bool
    where
        F: Future<Output = Result<()>>,
    {
        info!("🧪 Running test: {}", name);
        match timeout(limit, scenario).await {
            Ok(Ok(())) => {
                info!("✅ {} - PASSED", name);
                true
            }
            Ok(Err(e)) => {
                error!("❌ {} - FAILED: {}", name, e);
                false
            }
            Err(_) => {
                error!("❌ {} - TIMEOUT", name);
                false
            }
        }
    }

    pub async fn run_all_tests(&self) -> Result<()> {
        info!("🚀 Starting comprehensive integration tests");

        let limit = Duration::from_secs(30);
        let results = [
            Self::run_scenario("Basic Job Lifecycle", limit, self.test_basic_job_lifecycle()).await,
            Self::run_scenario("Dependency Chain", limit, self.test_dependency_chain()).await,
            Self::run_scenario("Concurrent Fan-in", limit, self.test_concurrent_fan_in()).await,
            Self::run_scenario("Job Expiry", limit, self.test_job_expiry()).await,
            Self::run_scenario("Error Handling", limit, self.test_error_handling()).await,
        ];

        let passed = results.iter().filter(|passed| **passed).count();
        let failed = results.len() - passed;
        info!(
            "🏁 Integration tests completed: {} passed, {} failed",
            passed, failed
        );

        if failed > 0 {
            return Err(DeferworkError::Worker {
                message: format!("{} tests failed", failed),
            });
        }
        Ok(())
    }
}
