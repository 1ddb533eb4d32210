//! Workers that pull jobs off queues and perform them.
//!
//! A [`Worker`] listens on one or more queues, checked in the order they were
//! listed: each time it looks for work it takes the head of the first
//! non-empty queue. Workers poll;
//! when every queue is empty they sleep for the configured polling interval.
//!
//! ```rust,no_run
//! use deferwork::{Connection, FunctionRegistry, Worker, WorkerPool};
//! use deferwork::store::MemoryStore;
//! use std::{sync::Arc, time::Duration};
//!
//! # #[tokio::main]
//! # async fn main() -> deferwork::Result<()> {
//! let conn = Connection::new(Arc::new(MemoryStore::new()), Arc::new(FunctionRegistry::new()));
//!
//! let mut pool = WorkerPool::new();
//! pool.add_worker(
//!     Worker::new(conn.clone(), vec!["high".to_string(), "default".to_string()])
//!         .with_poll_interval(Duration::from_millis(200)),
//! );
//! pool.start()?;
//!
//! // ... later
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    DeferworkError, Result,
    connection::Connection,
    job::{Job, JobOutcome},
    queue::Queue,
};
use std::time::Duration;
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct Worker {
    name: String,
    queues: Vec<Queue>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(conn: Connection, queue_names: Vec<String>) -> Self {
        let poll_interval = conn.config().worker.polling_interval;
        Self {
            name: format!("worker-{}", Uuid::new_v4().simple()),
            queues: queue_names
                .into_iter()
                .map(|name| Queue::new(conn.clone(), name))
                .collect(),
            poll_interval,
        }
    }

    /// A worker on the queues listed in the connection's configuration.
    pub fn from_config(conn: Connection) -> Self {
        let queues = conn.config().worker.queues.clone();
        Self::new(conn, queues)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_names(&self) -> Vec<&str> {
        self.queues.iter().map(Queue::name).collect()
    }

    /// Take one job from the first non-empty queue and perform it.
    ///
    /// Returns the job after the attempt, or `None` when every queue is
    /// empty. A job whose perform call errors is logged and returned with
    /// its status unchanged.
    pub async fn work_one(&self) -> Result<Option<Job>> {
        for queue in &self.queues {
            if let Some(job) = queue.dequeue_job().await? {
                return Ok(Some(self.process_job(job).await));
            }
        }
        Ok(None)
    }

    /// Work until every queue is empty. Returns the number of jobs taken.
    pub async fn work_burst(&self) -> Result<usize> {
        let mut processed = 0;
        while self.work_one().await?.is_some() {
            processed += 1;
        }
        info!(worker = %self.name, processed, "Burst finished");
        Ok(processed)
    }

    /// Work until a shutdown signal arrives or the sender is dropped.
    ///
    /// The signal is only observed between jobs; a job that is being
    /// performed always runs to completion.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(worker = %self.name, queues = ?self.queue_names(), "Worker started");

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            match self.work_one().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker = %self.name, error = %e, "Error dequeuing job"),
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = sleep(self.poll_interval) => {}
            }
        }

        info!(worker = %self.name, "Worker shutting down");
        Ok(())
    }

    async fn process_job(&self, mut job: Job) -> Job {
        debug!(worker = %self.name, job_id = %job.id, origin = ?job.origin, "Processing job");
        match job.perform().await {
            Ok(JobOutcome::Finished(_)) => {
                debug!(worker = %self.name, job_id = %job.id, "Job completed");
            }
            Ok(JobOutcome::Failed(_)) => {
                warn!(worker = %self.name, job_id = %job.id, "Job failed");
            }
            Err(e) => {
                error!(worker = %self.name, job_id = %job.id, error = %e, "Could not perform job");
            }
        }
        job
    }
}

/// A set of workers run as tokio tasks.
pub struct WorkerPool {
    workers: Vec<Worker>,
    shutdown_tx: Vec<mpsc::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            shutdown_tx: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// `worker.pool_size` workers on the configured queues.
    pub fn from_config(conn: &Connection) -> Self {
        let mut pool = Self::new();
        for _ in 0..conn.config().worker.pool_size {
            pool.add_worker(Worker::from_config(conn.clone()));
        }
        pool
    }

    pub fn add_worker(&mut self, worker: Worker) {
        self.workers.push(worker);
    }

    pub fn len(&self) -> usize {
        self.workers.len() + self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn every added worker.
    pub fn start(&mut self) -> Result<()> {
        info!("Starting worker pool with {} workers", self.workers.len());

        for worker in self.workers.drain(..) {
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            self.shutdown_tx.push(shutdown_tx);

            self.handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(shutdown_rx).await {
                    error!("Worker error: {}", e);
                }
            }));
        }
        Ok(())
    }

    /// Signal every worker and wait for them to stop.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down worker pool");

        for tx in self.shutdown_tx.drain(..) {
            if tx.send(()).await.is_err() {
                warn!("Failed to send shutdown signal to worker");
            }
        }

        for handle in self.handles.drain(..) {
            handle.await.map_err(|e| DeferworkError::Worker {
                message: format!("Worker task failed: {}", e),
            })?;
        }
        Ok(())
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
