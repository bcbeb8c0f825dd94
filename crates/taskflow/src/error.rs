use thiserror::Error;
use uuid::Uuid;

use crate::jobs::model::JobState;

/// Errors surfaced synchronously by the dispatcher, broker and result store.
///
/// Handler failures never show up here; they are recorded on the job itself
/// (see [`crate::jobs::model::JobFailure`]).
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("result store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("job {0} already exists")]
    DuplicateJob(Uuid),

    #[error("job {job_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("job {job_id} cannot be cancelled in state {state}")]
    NotCancellable { job_id: Uuid, state: JobState },

    #[error("job {job_id} cannot be replayed until it finishes (state {state})")]
    NotReplayable { job_id: Uuid, state: JobState },
}

impl QueueError {
    pub fn broker(err: impl std::fmt::Display) -> Self {
        QueueError::BrokerUnavailable(err.to_string())
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        QueueError::StoreUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
