use serde::Serialize;
use std::sync::Arc;

use crate::error::{QueueError, Result};
use crate::jobs::broker::Broker;
use crate::jobs::model::{
    Job, JobId, NewJob, Payload, QueueMessage, StatusSnapshot, DEFAULT_QUEUE,
};
use crate::jobs::registry::HandlerHandle;
use crate::jobs::store::ResultStore;

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub default_queue: String,
    pub max_retries: i32,
    pub max_payload_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_queue: DEFAULT_QUEUE.to_string(),
            max_retries: 3,
            max_payload_bytes: 256 * 1024, // 256KB default
        }
    }
}

/// Per-submission overrides. Unset fields fall back to [`DispatcherConfig`].
#[derive(Clone, Debug, Default)]
pub struct SubmitOptions {
    pub queue: Option<String>,
    pub max_retries: Option<i32>,
}

impl SubmitOptions {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn max_retries(mut self, n: i32) -> Self {
        self.max_retries = Some(n);
        self
    }
}

/// Producer-side entry point.
///
/// Talks to workers only through the broker and the result store. Handler
/// names are not checked here: an unknown handler fails on its first
/// execution attempt with `HANDLER_NOT_FOUND`.
#[derive(Clone)]
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    cfg: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn ResultStore>, cfg: DispatcherConfig) -> Self {
        Self { broker, store, cfg }
    }

    pub async fn submit(&self, handler_name: &str, payload: Payload) -> Result<JobId> {
        self.submit_with(handler_name, payload, SubmitOptions::default())
            .await
    }

    pub async fn submit_to(&self, handler: &HandlerHandle, payload: Payload) -> Result<JobId> {
        self.submit(handler.name(), payload).await
    }

    /// Serialize `value` as JSON and submit it. Fails before touching the
    /// store or broker if serialization fails.
    pub async fn submit_json<T: Serialize>(
        &self,
        handler_name: &str,
        schema: &str,
        value: &T,
    ) -> Result<JobId> {
        let payload = Payload::json(schema, value)?;
        self.submit(handler_name, payload).await
    }

    pub async fn submit_with(
        &self,
        handler_name: &str,
        payload: Payload,
        opts: SubmitOptions,
    ) -> Result<JobId> {
        self.check_payload(&payload)?;

        let job = Job::new_pending(NewJob {
            queue: opts
                .queue
                .unwrap_or_else(|| self.cfg.default_queue.clone()),
            handler_name: handler_name.to_string(),
            payload,
            max_retries: opts.max_retries.unwrap_or(self.cfg.max_retries).max(0),
            replay_of: None,
        });

        self.record_and_enqueue(job).await
    }

    pub async fn get_status(&self, job_id: JobId) -> Result<StatusSnapshot> {
        Ok(self.store.get(job_id).await?.snapshot())
    }

    /// Cancel a job that no worker has started yet. A worker that later
    /// dequeues it sees CANCELLED and drops the message.
    pub async fn cancel(&self, job_id: JobId) -> Result<StatusSnapshot> {
        let job = self.store.cancel(job_id).await?;
        tracing::info!(%job_id, handler = %job.handler_name, "job cancelled");
        Ok(job.snapshot())
    }

    /// Submit a finished job's handler and payload again as a new job.
    pub async fn replay(&self, job_id: JobId) -> Result<JobId> {
        let src = self.store.get(job_id).await?;
        if !src.state.is_terminal() {
            return Err(QueueError::NotReplayable {
                job_id,
                state: src.state,
            });
        }

        let job = Job::new_pending(NewJob {
            queue: src.queue,
            handler_name: src.handler_name,
            payload: src.payload,
            max_retries: src.max_retries,
            replay_of: Some(src.id),
        });

        self.record_and_enqueue(job).await
    }

    fn check_payload(&self, payload: &Payload) -> Result<()> {
        if payload.len() > self.cfg.max_payload_bytes {
            tracing::warn!(
                payload_bytes = payload.len(),
                max_payload_bytes = self.cfg.max_payload_bytes,
                "payload rejected"
            );
            return Err(QueueError::PayloadTooLarge {
                max: self.cfg.max_payload_bytes,
                actual: payload.len(),
            });
        }
        Ok(())
    }

    /// PENDING record first, then exactly one broker message. If the enqueue
    /// fails the record is rolled back so no job exists without a message.
    async fn record_and_enqueue(&self, job: Job) -> Result<JobId> {
        self.store.insert_pending(&job).await?;

        if let Err(err) = self.broker.enqueue(QueueMessage::for_job(&job)).await {
            if let Err(rollback) = self.store.remove(job.id).await {
                tracing::error!(job_id = %job.id, error = %rollback, "failed to roll back pending job");
            }
            tracing::warn!(job_id = %job.id, error = %err, "enqueue failed, submission rejected");
            return Err(match err {
                QueueError::BrokerUnavailable(_) => err,
                other => QueueError::broker(other),
            });
        }

        tracing::info!(
            job_id = %job.id,
            handler = %job.handler_name,
            queue = %job.queue,
            replay_of = ?job.replay_of,
            "job submitted"
        );
        Ok(job.id)
    }
}
