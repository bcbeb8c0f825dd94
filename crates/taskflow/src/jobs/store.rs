use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{QueueError, Result};
use crate::jobs::model::{Job, JobFailure, JobId, JobState, StateCounts};

/// Outcome record for every job, keyed by job id.
///
/// Each `mark_*` call validates the transition with
/// [`JobState::can_transition_to`] and fails with
/// [`QueueError::InvalidTransition`] otherwise, so terminal records never
/// change again.
#[async_trait]
pub trait ResultStore: Send + Sync + 'static {
    async fn insert_pending(&self, job: &Job) -> Result<()>;

    /// Unknown and TTL-expired ids are both `NotFound`.
    async fn get(&self, job_id: JobId) -> Result<Job>;

    /// Begin an attempt: STARTED, `attempt_count + 1`, `started_at = now`.
    async fn mark_started(&self, job_id: JobId) -> Result<Job>;

    async fn mark_retry(&self, job_id: JobId, error: JobFailure) -> Result<Job>;

    async fn mark_success(&self, job_id: JobId, result: Option<Value>) -> Result<Job>;

    async fn mark_failure(&self, job_id: JobId, error: JobFailure) -> Result<Job>;

    /// PENDING -> CANCELLED; anything else is `NotCancellable`.
    async fn cancel(&self, job_id: JobId) -> Result<Job>;

    /// Drop a record outright. Used to roll back a submission whose enqueue
    /// failed.
    async fn remove(&self, job_id: JobId) -> Result<bool>;

    /// Delete terminal records whose TTL ran out before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn counts(&self) -> Result<StateCounts>;
}

/// Shared transition check for store backends.
pub(crate) fn check_transition(job: &Job, to: JobState) -> Result<()> {
    if job.state.can_transition_to(to) {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition {
            job_id: job.id,
            from: job.state,
            to,
        })
    }
}

/// Apply a transition to an in-memory copy of the record. Backends that keep
/// whole rows call this and write the result back.
pub(crate) fn apply_transition(
    job: &mut Job,
    to: JobState,
    outcome: Transition,
    ttl: Option<chrono::Duration>,
    now: DateTime<Utc>,
) -> Result<()> {
    check_transition(job, to)?;

    match outcome {
        Transition::Start => {
            job.attempt_count += 1;
            job.started_at = Some(now);
        }
        Transition::Retry(err) => job.last_error = Some(err),
        Transition::Succeed(result) => job.result = result,
        Transition::Fail(err) => {
            job.last_error = Some(err.clone());
            job.error = Some(err);
        }
        Transition::Cancel => {}
    }

    job.state = to;
    if to.is_terminal() {
        job.finished_at = Some(now);
        job.expires_at = ttl.map(|ttl| now + ttl);
    }
    Ok(())
}

pub(crate) enum Transition {
    Start,
    Retry(JobFailure),
    Succeed(Option<Value>),
    Fail(JobFailure),
    Cancel,
}
