//! # deferwork
//!
//! A job queue for Rust backed by a key-value store, with job dependencies and
//! results that flow from one job into the next.
//!
//! ## Features
//!
//! - **Pluggable stores**: Redis (feature `redis`), PostgreSQL (feature `postgres`)
//!   and an in-process store that is always available
//! - **Future results**: pass a job's eventual result as an argument to another job;
//!   it is substituted when the dependent job runs
//! - **Dependencies**: jobs wait in a deferred registry until every parent has finished,
//!   then move to their queue exactly once
//! - **TTL handling**: jobs and results expire on schedule, but never while running
//! - **Async/await**: built on Tokio; job functions are async closures
//!
//! ## Quick Start
//!
//! ```rust
//! use deferwork::{BoxError, Call, Connection, FunctionRegistry, JobStatus, Worker};
//! use deferwork::store::MemoryStore;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = FunctionRegistry::new()
//!     .with_function("fetch", |_inv| async move { Ok::<_, BoxError>(json!(21)) })
//!     .with_function("double", |inv| async move {
//!         let n: i64 = inv.argument(0, "n")?;
//!         Ok::<_, BoxError>(json!(n * 2))
//!     });
//!
//! let conn = Connection::new(Arc::new(MemoryStore::new()), Arc::new(registry));
//! let queue = conn.queue("default");
//!
//! // `double` takes the result of `fetch` as its argument.
//! let fetch = queue.enqueue(Call::new("fetch")).await?;
//! let double = queue.enqueue(Call::new("double").arg(fetch.future_result())).await?;
//! assert_eq!(double.status(), Some(JobStatus::Deferred));
//!
//! let worker = Worker::new(conn.clone(), vec!["default".to_string()]);
//! assert_eq!(worker.work_burst().await?, 2);
//!
//! let double = conn.get_job(double.id).await?;
//! assert_eq!(double.result, Some(json!(42)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A [`Job`] is a persisted record of a function call: the function's registered
//! name, its arguments, timestamps, status, and eventually its result or error.
//! Functions are looked up by name through a [`FunctionResolver`] when the job runs.
//!
//! ### Queues and the deferred registry
//!
//! A [`Queue`] is a FIFO list of job ids. A job whose parents have not all finished
//! is placed in the queue's [`DeferredRegistry`] instead; finishing the last parent
//! moves it into the queue.
//!
//! ### Workers
//!
//! A [`Worker`] checks its queues in the order they were listed, pops the
//! first job it finds and performs it.
//! [`WorkerPool`] runs several workers as tokio tasks.

pub mod call;
pub mod clock;
pub mod config;
pub mod connection;
pub mod dependency;
pub mod error;
pub mod function;
pub mod job;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod store;
pub mod ttl;
pub mod worker;

pub use call::{Argument, Call, CallSpec, Callable, FutureResult};
pub use config::DeferworkConfig;
pub use connection::Connection;
pub use dependency::{Dependency, DependencyResolver};
pub use error::DeferworkError;
pub use function::{BoxError, FunctionRegistry, FunctionResolver, Invocation, JobFunction};
pub use job::{Job, JobId, JobOutcome, JobStatus};
pub use queue::Queue;
pub use registry::DeferredRegistry;
pub use store::Store;
pub use worker::{Worker, WorkerPool};

pub type Result<T> = std::result::Result<T, DeferworkError>;
