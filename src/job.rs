//! Jobs: persisted records of a deferred function call.
//!
//! A [`Job`] pairs an id with a call specification and the bookkeeping needed
//! to run it once: timestamps, status, result or error text, TTLs, and the
//! ids of the parent jobs it depends on. The record lives in a hash under
//! `job:<id>`; a second key, `job:<id>:children`, holds the ids of jobs that
//! depend on it.
//!
//! Status only ever moves forward:
//!
//! ```text
//! (unsaved) ──► deferred ──► queued ──► started ──► finished
//!     │                        ▲           │
//!     └────────────────────────┘           └──────► failed
//! ```
//!
//! # Examples
//!
//! ```rust
//! use deferwork::{Call, Connection, FunctionRegistry, Job, JobOutcome, BoxError};
//! use deferwork::store::MemoryStore;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = FunctionRegistry::new().with_function("add", |inv| async move {
//!     let a: i64 = inv.argument(0, "a")?;
//!     let b: i64 = inv.argument(1, "b")?;
//!     Ok::<_, BoxError>(json!(a + b))
//! });
//! let conn = Connection::new(Arc::new(MemoryStore::new()), Arc::new(registry));
//!
//! let mut job = Job::create(&conn, Call::new("add").arg(json!(3)).arg(json!(4)))?;
//! assert_eq!(job.get_call_string()?, "add(3, 4)");
//!
//! let outcome = job.perform().await?;
//! assert_eq!(outcome, JobOutcome::Finished(json!(7)));
//! # Ok(())
//! # }
//! ```

use crate::{
    DeferworkError, Result,
    call::{Argument, Call, CallSpec, FutureResult},
    connection::Connection,
    dependency::DependencyResolver,
    function::{Invocation, JobFunction},
    store::{self, keys},
    ttl::Expiration,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::OnceLock,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type JobId = Uuid;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Deferred,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Deferred => "deferred",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "deferred" => Some(JobStatus::Deferred),
            "started" => Some(JobStatus::Started),
            "finished" => Some(JobStatus::Finished),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// Whether a job may move from `from` (`None` for a job that was never
    /// given a status) to `to`.
    pub fn can_transition(from: Option<JobStatus>, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (from, to),
            (None, Queued | Deferred | Started)
                | (Some(Deferred), Queued)
                | (Some(Queued), Started)
                | (Some(Started), Finished | Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a performed job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The function returned this value.
    Finished(Value),
    /// The function failed or panicked; the text describes why.
    Failed(String),
}

impl JobOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobOutcome::Finished(_))
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            JobOutcome::Finished(value) => Some(value),
            JobOutcome::Failed(_) => None,
        }
    }
}

pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|at| at.with_timezone(&Utc))
        })
}

#[derive(Clone)]
pub struct Job {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub origin: Option<String>,
    pub description: Option<String>,
    pub result: Option<Value>,
    pub exc_info: Option<String>,
    pub meta: serde_json::Map<String, Value>,
    pub ttl: Option<i64>,
    pub result_ttl: Option<i64>,
    status: Option<JobStatus>,
    parent_ids: Vec<JobId>,
    data: Option<Vec<u8>>,
    call: OnceLock<CallSpec>,
    conn: Connection,
}

impl Job {
    /// An empty job with a fresh id and no call specification.
    pub fn new(conn: &Connection) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: conn.now(),
            enqueued_at: None,
            started_at: None,
            ended_at: None,
            origin: None,
            description: None,
            result: None,
            exc_info: None,
            meta: serde_json::Map::new(),
            ttl: None,
            result_ttl: None,
            status: None,
            parent_ids: Vec::new(),
            data: None,
            call: OnceLock::new(),
            conn: conn.clone(),
        }
    }

    /// Build an unsaved job from `call`.
    ///
    /// Parent ids are every job referenced by a pending argument, in the order
    /// they are first found, followed by any explicit dependencies not already
    /// seen. The description defaults to the call string.
    pub fn create(conn: &Connection, call: Call) -> Result<Self> {
        let spec = call.call_spec();
        let mut parent_ids = spec.future_results(conn.config().queue.max_argument_nodes)?;
        for dependency in &call.depends_on {
            let parent_id = dependency.job_id();
            if !parent_ids.contains(&parent_id) {
                parent_ids.push(parent_id);
            }
        }

        let mut job = Job::new(conn);
        job.description = Some(call.description.unwrap_or_else(|| spec.call_string()));
        job.data = Some(spec.encode()?);
        job.call = OnceLock::from(spec);
        job.parent_ids = parent_ids;
        job.ttl = call.ttl;
        job.result_ttl = call.result_ttl;
        job.meta = call.meta;
        Ok(job)
    }

    /// Load the job stored under `id`.
    pub async fn fetch(conn: &Connection, id: JobId) -> Result<Self> {
        let fields = conn.store().hash_get_all(&keys::job(&id)).await?;
        if fields.is_empty() {
            return Err(DeferworkError::NoSuchJob { id });
        }
        Job::from_record(conn, id, &fields)
    }

    pub async fn exists(conn: &Connection, id: JobId) -> Result<bool> {
        conn.store().exists(&keys::job(&id)).await
    }

    pub fn key(&self) -> String {
        keys::job(&self.id)
    }

    pub fn children_key(&self) -> String {
        keys::children(&self.id)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Status as last seen by this handle.
    pub fn status(&self) -> Option<JobStatus> {
        self.status
    }

    /// Jobs that must finish before this one may run.
    pub fn parent_ids(&self) -> &[JobId] {
        &self.parent_ids
    }

    pub fn future_result(&self) -> FutureResult {
        FutureResult::new(self.id)
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Replace the encoded call specification; it is decoded again on next use.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = Some(data);
        self.call = OnceLock::new();
    }

    pub fn set_call(&mut self, spec: CallSpec) -> Result<()> {
        self.data = Some(spec.encode()?);
        self.call = OnceLock::from(spec);
        Ok(())
    }

    fn call_spec(&self) -> Result<&CallSpec> {
        if let Some(spec) = self.call.get() {
            return Ok(spec);
        }
        let data = self
            .data
            .as_deref()
            .ok_or(DeferworkError::EmptyJob { id: self.id })?;
        let spec = CallSpec::decode(data)?;
        Ok(self.call.get_or_init(|| spec))
    }

    pub fn func_name(&self) -> Result<&str> {
        Ok(&self.call_spec()?.func_name)
    }

    pub fn instance(&self) -> Result<Option<&Value>> {
        Ok(self.call_spec()?.instance.as_ref())
    }

    pub fn args(&self) -> Result<&[Argument]> {
        Ok(&self.call_spec()?.args)
    }

    pub fn kwargs(&self) -> Result<&BTreeMap<String, Argument>> {
        Ok(&self.call_spec()?.kwargs)
    }

    /// Resolve the function this job runs.
    pub fn func(&self) -> Result<JobFunction> {
        let name = self.func_name()?;
        self.conn
            .resolver()
            .resolve(name)
            .ok_or_else(|| DeferworkError::CallableResolution {
                name: name.to_string(),
            })
    }

    pub fn get_call_string(&self) -> Result<String> {
        Ok(self.call_spec()?.call_string())
    }

    pub fn get_ttl(&self, default: Option<i64>) -> Option<i64> {
        self.ttl.or(default)
    }

    pub fn get_result_ttl(&self, default: Option<i64>) -> Option<i64> {
        self.result_ttl.or(default)
    }

    /// Read the status from the store, updating this handle.
    pub async fn get_status(&mut self) -> Result<Option<JobStatus>> {
        self.status = self.conn.job_status(self.id).await?;
        Ok(self.status)
    }

    /// Move to `status` and persist just that field.
    pub async fn set_status(&mut self, status: JobStatus) -> Result<()> {
        if !JobStatus::can_transition(self.status, status) {
            return Err(DeferworkError::InvalidStatusTransition {
                id: self.id,
                from: self.status,
                to: status,
            });
        }
        if status == JobStatus::Started {
            Expiration::NoExpiry
                .apply(self.conn.store(), &[self.key(), self.children_key()])
                .await?;
        }
        self.status = Some(status);
        self.conn
            .store()
            .hash_set(
                &self.key(),
                &[("status".to_string(), status.as_str().as_bytes().to_vec())],
            )
            .await
    }

    /// Ids of jobs that depend on this one.
    pub async fn dependents(&self) -> Result<Vec<JobId>> {
        self.conn
            .store()
            .set_members(&self.children_key())
            .await?
            .iter()
            .map(|member| Uuid::parse_str(member).map_err(DeferworkError::from))
            .collect()
    }

    fn to_record(&self) -> Result<Vec<(String, Vec<u8>)>> {
        fn text(name: &str, value: impl AsRef<str>) -> (String, Vec<u8>) {
            (name.to_string(), value.as_ref().as_bytes().to_vec())
        }

        let mut fields = vec![text("created_at", format_timestamp(&self.created_at))];
        if let Some(data) = &self.data {
            fields.push(("data".to_string(), data.clone()));
        }
        if let Some(description) = &self.description {
            fields.push(text("description", description));
        }
        if let Some(origin) = &self.origin {
            fields.push(text("origin", origin));
        }
        if let Some(at) = &self.enqueued_at {
            fields.push(text("enqueued_at", format_timestamp(at)));
        }
        if let Some(at) = &self.started_at {
            fields.push(text("started_at", format_timestamp(at)));
        }
        if let Some(at) = &self.ended_at {
            fields.push(text("ended_at", format_timestamp(at)));
        }
        if let Some(result) = &self.result {
            fields.push(("result".to_string(), serde_json::to_vec(result)?));
        }
        if let Some(exc_info) = &self.exc_info {
            fields.push(text("exc_info", exc_info));
        }
        if !self.meta.is_empty() {
            fields.push(("meta".to_string(), serde_json::to_vec(&self.meta)?));
        }
        if let Some(status) = &self.status {
            fields.push(text("status", status.as_str()));
        }
        if let Some(ttl) = self.ttl {
            fields.push(text("ttl", ttl.to_string()));
        }
        if let Some(result_ttl) = self.result_ttl {
            fields.push(text("result_ttl", result_ttl.to_string()));
        }
        if !self.parent_ids.is_empty() {
            fields.push(("parent_ids".to_string(), serde_json::to_vec(&self.parent_ids)?));
        }
        Ok(fields)
    }

    fn from_record(conn: &Connection, id: JobId, fields: &HashMap<String, Vec<u8>>) -> Result<Self> {
        let record = Record { id, fields };

        let created_at = record
            .timestamp("created_at")?
            .ok_or_else(|| record.invalid("created_at", "missing"))?;
        let status = match record.text("status")? {
            Some(text) => Some(
                JobStatus::parse(&text)
                    .ok_or_else(|| record.invalid("status", format!("unknown status '{}'", text)))?,
            ),
            None => None,
        };

        Ok(Self {
            id,
            created_at,
            enqueued_at: record.timestamp("enqueued_at")?,
            started_at: record.timestamp("started_at")?,
            ended_at: record.timestamp("ended_at")?,
            origin: record.text("origin")?,
            description: record.text("description")?,
            result: record.json("result")?,
            exc_info: record.text("exc_info")?,
            meta: record.json("meta")?.unwrap_or_default(),
            ttl: record.integer("ttl")?,
            result_ttl: record.integer("result_ttl")?,
            status,
            parent_ids: record.json("parent_ids")?.unwrap_or_default(),
            data: fields.get("data").cloned(),
            call: OnceLock::new(),
            conn: conn.clone(),
        })
    }

    /// Write every field that is set. A job without a call specification
    /// cannot be saved.
    pub async fn save(&self) -> Result<()> {
        if self.data.is_none() {
            return Err(DeferworkError::EmptyJob { id: self.id });
        }
        let fields = self.to_record()?;
        self.conn.store().hash_set(&self.key(), &fields).await?;
        debug!(job_id = %self.id, fields = fields.len(), "Saved job");
        Ok(())
    }

    /// Reload every field from the store.
    pub async fn refresh(&mut self) -> Result<()> {
        *self = Job::fetch(&self.conn, self.id).await?;
        Ok(())
    }

    /// Run the job's function and record the outcome.
    ///
    /// The job must be queued, or never have been given a status, and every
    /// parent must have finished. Pending arguments are replaced by their
    /// parents' results before the call. A function error or panic is captured
    /// as [`JobOutcome::Failed`]; store, decoding and resolution problems are
    /// returned as errors instead.
    pub async fn perform(&mut self) -> Result<JobOutcome> {
        let current = self.conn.job_status(self.id).await?;
        if matches!(
            current,
            Some(JobStatus::Started | JobStatus::Finished | JobStatus::Failed)
        ) {
            return Err(DeferworkError::InvalidStatusTransition {
                id: self.id,
                from: current,
                to: JobStatus::Started,
            });
        }

        let spec = self.call_spec()?.clone();
        let referenced = spec.future_results(self.conn.config().queue.max_argument_nodes)?;
        let results = self.parent_results(&referenced).await?;

        if !JobStatus::can_transition(current, JobStatus::Started) {
            return Err(DeferworkError::InvalidStatusTransition {
                id: self.id,
                from: current,
                to: JobStatus::Started,
            });
        }

        let function = self.func()?;
        let invocation = Invocation {
            job_id: self.id,
            instance: spec.instance.clone(),
            args: spec
                .args
                .iter()
                .map(|arg| self.resolve_argument(arg, &results))
                .collect::<Result<_>>()?,
            kwargs: spec
                .kwargs
                .iter()
                .map(|(name, arg)| Ok((name.clone(), self.resolve_argument(arg, &results)?)))
                .collect::<Result<_>>()?,
        };

        // Lift the expiry before the record says started.
        Expiration::NoExpiry
            .apply(self.conn.store(), &[self.key(), self.children_key()])
            .await?;
        self.status = Some(JobStatus::Started);
        self.started_at = Some(self.conn.now());
        self.save().await?;
        info!(job_id = %self.id, func = %spec.func_name, "Job started");

        let outcome = match tokio::spawn(function(invocation)).await {
            Ok(Ok(value)) => JobOutcome::Finished(value),
            Ok(Err(error)) => JobOutcome::Failed(describe_error(error.as_ref())),
            Err(join_error) => JobOutcome::Failed(describe_join_error(join_error)),
        };

        self.ended_at = Some(self.conn.now());
        match &outcome {
            JobOutcome::Finished(value) => {
                self.status = Some(JobStatus::Finished);
                self.result = Some(value.clone());
                info!(job_id = %self.id, "Job finished");
            }
            JobOutcome::Failed(exc_info) => {
                self.status = Some(JobStatus::Failed);
                self.exc_info = Some(exc_info.clone());
                warn!(job_id = %self.id, error = %exc_info, "Job failed");
            }
        }
        self.save().await?;

        // Children read this record, so promote before cleanup can remove it.
        DependencyResolver::new(self.conn.clone())
            .promote_ready_children(self.id)
            .await?;

        let default_result_ttl = self.conn.config().queue.default_result_ttl;
        let result_ttl = self
            .get_result_ttl(Some(default_result_ttl))
            .unwrap_or(default_result_ttl);
        self.cleanup(result_ttl).await?;

        Ok(outcome)
    }

    fn resolve_argument(&self, argument: &Argument, results: &HashMap<JobId, Value>) -> Result<Value> {
        argument
            .resolve(results)
            .map_err(|missing| DeferworkError::DependencyNotResolved {
                job_id: self.id,
                parent_id: missing.job_id,
            })
    }

    /// Results of every parent and referenced job.
    ///
    /// Fails on the first parent that exists but has not finished. A parent
    /// whose record is gone only fails the job when its result is referenced
    /// in the arguments; otherwise it already finished and was cleaned up.
    async fn parent_results(&self, referenced: &[JobId]) -> Result<HashMap<JobId, Value>> {
        let mut results = HashMap::new();
        let mut gone = HashSet::new();
        for parent_id in self.parent_ids.iter().chain(referenced) {
            if results.contains_key(parent_id) || gone.contains(parent_id) {
                continue;
            }
            let unresolved = DeferworkError::DependencyNotResolved {
                job_id: self.id,
                parent_id: *parent_id,
            };
            let parent = match Job::fetch(&self.conn, *parent_id).await {
                Ok(parent) => parent,
                Err(DeferworkError::NoSuchJob { .. }) if !referenced.contains(parent_id) => {
                    debug!(job_id = %self.id, parent_id = %parent_id, "Parent record already removed");
                    gone.insert(*parent_id);
                    continue;
                }
                Err(DeferworkError::NoSuchJob { .. }) => return Err(unresolved),
                Err(e) => return Err(e),
            };
            if parent.status != Some(JobStatus::Finished) {
                return Err(unresolved);
            }
            results.insert(*parent_id, parent.result.unwrap_or(Value::Null));
        }
        Ok(results)
    }

    /// Schedule removal of this job's keys.
    ///
    /// A negative `ttl` keeps them forever, zero deletes the job right away,
    /// and a positive `ttl` lets them expire that many seconds from now. A job
    /// that is currently started keeps its keys regardless.
    pub async fn cleanup(&mut self, ttl: i64) -> Result<()> {
        match Expiration::plan(ttl, self.status, self.conn.now()) {
            Expiration::DeleteNow => self.delete().await,
            plan => {
                plan.apply(self.conn.store(), &[self.key(), self.children_key()])
                    .await
            }
        }
    }

    /// Remove this job from everywhere it is referenced, then delete its keys.
    pub async fn delete(&self) -> Result<()> {
        let store = self.conn.store();
        let member = store::member(&self.id);

        let origin = match &self.origin {
            Some(origin) => Some(origin.clone()),
            None => store
                .hash_get(&self.key(), "origin")
                .await?
                .and_then(|bytes| String::from_utf8(bytes).ok()),
        };
        if let Some(origin) = origin {
            self.conn.queue(origin.clone()).remove(self.id).await?;
            self.conn.deferred_registry(origin).remove(self.id).await?;
        }
        for parent_id in &self.parent_ids {
            store.set_remove(&keys::children(parent_id), &member).await?;
        }

        store.delete(&[self.key(), self.children_key()]).await?;
        debug!(job_id = %self.id, "Deleted job");
        Ok(())
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("origin", &self.origin)
            .field("description", &self.description)
            .field("parent_ids", &self.parent_ids)
            .field("created_at", &self.created_at)
            .field("enqueued_at", &self.enqueued_at)
            .field("ended_at", &self.ended_at)
            .finish_non_exhaustive()
    }
}

struct Record<'a> {
    id: JobId,
    fields: &'a HashMap<String, Vec<u8>>,
}

impl Record<'_> {
    fn invalid(&self, field: &str, message: impl Into<String>) -> DeferworkError {
        DeferworkError::InvalidRecord {
            id: self.id,
            field: field.to_string(),
            message: message.into(),
        }
    }

    fn text(&self, field: &str) -> Result<Option<String>> {
        self.fields
            .get(field)
            .map(|bytes| {
                String::from_utf8(bytes.clone()).map_err(|e| self.invalid(field, e.to_string()))
            })
            .transpose()
    }

    fn timestamp(&self, field: &str) -> Result<Option<DateTime<Utc>>> {
        self.text(field)?
            .map(|text| {
                parse_timestamp(&text)
                    .ok_or_else(|| self.invalid(field, format!("unreadable timestamp '{}'", text)))
            })
            .transpose()
    }

    fn integer(&self, field: &str) -> Result<Option<i64>> {
        self.text(field)?
            .map(|text| {
                text.trim()
                    .parse::<i64>()
                    .map_err(|e| self.invalid(field, e.to_string()))
            })
            .transpose()
    }

    fn json<T: serde::de::DeserializeOwned>(&self, field: &str) -> Result<Option<T>> {
        self.fields
            .get(field)
            .map(|bytes| serde_json::from_slice(bytes).map_err(|e| self.invalid(field, e.to_string())))
            .transpose()
    }
}

fn describe_error(error: &(dyn std::error::Error + Send + Sync + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str("\nCaused by: ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn describe_join_error(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return "job task was cancelled".to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("job panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("job panicked: {}", message)
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Deferred,
            JobStatus::Started,
            JobStatus::Finished,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
            assert_eq!(status.to_string(), status.as_str());
        }
        assert_eq!(JobStatus::parse("running"), None);
    }

    #[test]
    fn test_status_only_moves_forward() {
        use JobStatus::*;
        assert!(JobStatus::can_transition(None, Deferred));
        assert!(JobStatus::can_transition(None, Queued));
        assert!(JobStatus::can_transition(Some(Deferred), Queued));
        assert!(JobStatus::can_transition(Some(Queued), Started));
        assert!(JobStatus::can_transition(Some(Started), Failed));

        assert!(!JobStatus::can_transition(Some(Deferred), Started));
        assert!(!JobStatus::can_transition(Some(Queued), Deferred));
        assert!(!JobStatus::can_transition(Some(Finished), Started));
        assert!(!JobStatus::can_transition(Some(Failed), Queued));
        assert!(!JobStatus::can_transition(Some(Started), Started));
        assert!(Finished.is_terminal() && Failed.is_terminal() && !Started.is_terminal());
    }

    #[test]
    fn test_timestamp_format() {
        let at = Utc.with_ymd_and_hms(2012, 2, 7, 22, 13, 24).unwrap();
        assert_eq!(format_timestamp(&at), "2012-02-07T22:13:24Z");
        assert_eq!(parse_timestamp("2012-02-07T22:13:24Z"), Some(at));
        assert_eq!(parse_timestamp("2012-02-07T22:13:24+00:00"), Some(at));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_describe_error_includes_sources() {
        let io = std::io::Error::other("disk on fire");
        let wrapped = DeferworkError::from(io);
        let text = describe_error(&wrapped);
        assert!(text.starts_with("IO error: disk on fire"));

        #[derive(Debug)]
        struct Outer(std::io::Error);
        impl fmt::Display for Outer {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("outer")
            }
        }
        impl std::error::Error for Outer {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let text = describe_error(&Outer(std::io::Error::other("inner")));
        assert_eq!(text, "outer\nCaused by: inner");
    }

    #[test]
    fn test_outcome_accessors() {
        let finished = JobOutcome::Finished(serde_json::json!(1));
        assert!(finished.is_finished());
        assert_eq!(finished.result(), Some(&serde_json::json!(1)));

        let failed = JobOutcome::Failed("boom".to_string());
        assert!(!failed.is_finished());
        assert_eq!(failed.result(), None);
    }
}
