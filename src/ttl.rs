//! Expiry planning for job records.
//!
//! Deciding what a TTL means is kept separate from talking to the store:
//! [`Expiration::plan`] is a pure function of the TTL, the job's status and
//! the current time, and [`Expiration::apply`] carries the decision out.
//!
//! A record in the `started` state never gets an expiry, whatever the TTL.
//! A job that is running when its TTL would otherwise lapse keeps its record
//! until it finishes and the result TTL takes over.

use crate::{Result, job::JobStatus, store::Store};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// What should happen to a job's keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// Remove any expiry; keep the keys forever.
    NoExpiry,
    /// Delete the keys now.
    DeleteNow,
    /// Let the keys expire at this instant.
    ExpireAt(DateTime<Utc>),
}

impl Expiration {
    /// Negative TTLs mean "keep forever", zero means "delete now", and
    /// positive TTLs expire the keys that many seconds from `now`.
    ///
    /// ```rust
    /// use deferwork::{JobStatus, ttl::Expiration};
    /// use chrono::{Duration, Utc};
    ///
    /// let now = Utc::now();
    /// assert_eq!(Expiration::plan(-1, Some(JobStatus::Finished), now), Expiration::NoExpiry);
    /// assert_eq!(Expiration::plan(0, Some(JobStatus::Finished), now), Expiration::DeleteNow);
    /// assert_eq!(
    ///     Expiration::plan(10, Some(JobStatus::Finished), now),
    ///     Expiration::ExpireAt(now + Duration::seconds(10))
    /// );
    /// assert_eq!(Expiration::plan(10, Some(JobStatus::Started), now), Expiration::NoExpiry);
    /// ```
    pub fn plan(ttl: i64, status: Option<JobStatus>, now: DateTime<Utc>) -> Self {
        if status == Some(JobStatus::Started) || ttl < 0 {
            Expiration::NoExpiry
        } else if ttl == 0 {
            Expiration::DeleteNow
        } else {
            Expiration::ExpireAt(now + Duration::seconds(ttl))
        }
    }

    /// Carry the plan out on `keys`.
    ///
    /// [`Expiration::DeleteNow`] only removes the keys themselves; callers that
    /// also need a job unlinked from queues use [`Job::delete`](crate::Job::delete).
    pub async fn apply(&self, store: &dyn Store, keys: &[String]) -> Result<()> {
        match self {
            Expiration::NoExpiry => {
                for key in keys {
                    store.persist(key).await?;
                }
            }
            Expiration::DeleteNow => {
                store.delete(keys).await?;
            }
            Expiration::ExpireAt(at) => {
                for key in keys {
                    store.expire_at(key, *at).await?;
                }
            }
        }
        debug!(?keys, plan = ?self, "Applied expiration");
        Ok(())
    }
}
