use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::error::QueueError;
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::registry::HandlerError;

pub type JobId = Uuid;

pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Started => "STARTED",
            JobState::Retry => "RETRY",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
            JobState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Some(JobState::Pending),
            "STARTED" => Some(JobState::Started),
            "RETRY" => Some(JobState::Retry),
            "SUCCESS" => Some(JobState::Success),
            "FAILURE" => Some(JobState::Failure),
            "CANCELLED" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failure | JobState::Cancelled
        )
    }

    /// Transition table shared by every result store backend.
    ///
    /// STARTED -> STARTED is a redelivery after a worker died mid-attempt.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, Started | Cancelled | Failure) => true,
            (Started, Started | Success | Failure | Retry) => true,
            (Retry, Started | Failure) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque job input: raw bytes tagged with the schema the producer used.
///
/// The engine never looks inside; handlers decode it themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub schema: String,
    pub bytes: Vec<u8>,
}

impl Payload {
    pub fn new(schema: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            schema: schema.into(),
            bytes: bytes.into(),
        }
    }

    pub fn json<T: Serialize>(schema: impl Into<String>, value: &T) -> Result<Self, QueueError> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::new(schema, bytes))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode a JSON payload. A payload that does not match `T` will never
    /// decode on a later attempt either, so the error is permanent.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.bytes)
            .map_err(|e| HandlerError::permanent(e.to_string()).with_code(ErrorCode::BadPayload))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: String,
    pub message: String,
}

impl JobFailure {
    /// Terminal failures always carry a readable message; an empty one falls
    /// back to the code.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let mut message = message.into();
        if message.trim().is_empty() {
            message = format!("job failed with {code}");
        }
        Self { code, message }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub handler_name: String,
    pub payload: Payload,

    pub state: JobState,
    pub attempt_count: i32,
    pub max_retries: i32,

    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    pub last_error: Option<JobFailure>,

    pub replay_of: Option<JobId>,

    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new_pending(new: NewJob) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: new.queue,
            handler_name: new.handler_name,
            payload: new.payload,
            state: JobState::Pending,
            attempt_count: 0,
            max_retries: new.max_retries,
            result: None,
            error: None,
            last_error: None,
            replay_of: new.replay_of,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            expires_at: None,
        }
    }

    /// Upper bound on executions: the first attempt plus every retry.
    pub fn attempt_ceiling(&self) -> i32 {
        self.max_retries.saturating_add(1)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.attempt_ceiling()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            id: self.id,
            handler_name: self.handler_name.clone(),
            state: self.state,
            attempt_count: self.attempt_count,
            result: self.result.clone(),
            error: self.error.clone(),
            last_error: self.last_error.clone(),
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub handler_name: String,
    pub payload: Payload,
    pub max_retries: i32,
    pub replay_of: Option<JobId>,
}

/// What producers and observers see when they poll a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub id: JobId,
    pub handler_name: String,
    pub state: JobState,
    pub attempt_count: i32,
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    /// Most recent attempt failure, kept while the job is still retrying.
    pub last_error: Option<JobFailure>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Broker-side envelope. Only the job id and routing data travel through the
/// queue; the payload rides along so workers do not need a store round-trip
/// before resolving the handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: JobId,
    pub queue: String,
    pub handler_name: String,
    pub payload: Payload,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            queue: job.queue.clone(),
            handler_name: job.handler_name.clone(),
            payload: job.payload.clone(),
            enqueued_at: job.enqueued_at,
        }
    }
}

/// A leased message. `lease_id` is the receipt used to ack or nack; it goes
/// stale once the lease expires and another worker picks the message up.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    pub lease_id: Uuid,
    pub delivery_count: i32,
    pub worker_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: i64,
    pub started: i64,
    pub retry: i64,
    pub success: i64,
    pub failure: i64,
    pub cancelled: i64,
}

impl StateCounts {
    pub fn bump(&mut self, state: JobState, n: i64) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::Started => self.started += n,
            JobState::Retry => self.retry += n,
            JobState::Success => self.success += n,
            JobState::Failure => self.failure += n,
            JobState::Cancelled => self.cancelled += n,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending + self.started + self.retry + self.success + self.failure + self.cancelled
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub ready: i64,
    pub leased: i64,
}
