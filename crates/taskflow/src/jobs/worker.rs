use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::error::{QueueError, Result};
use crate::jobs::broker::Broker;
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::{Delivery, JobFailure, JobState, DEFAULT_QUEUE};
use crate::jobs::registry::{HandlerContext, HandlerError, HandlerRegistry};
use crate::jobs::retry::{RetryDecision, RetryPolicy};
use crate::jobs::store::ResultStore;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub queue: String,
    pub pool_size: usize,
    pub visibility_timeout: Duration,
    pub job_timeout: Duration,
    pub poll_interval: Duration,
    pub reap_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            pool_size: 4,
            visibility_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            reap_interval: Duration::from_secs(1),
        }
    }
}

/// What one delivery turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Retried { delay: Duration },
    Failed { code: String },
    /// Dropped before execution: unknown, already finished, or cancelled.
    Skipped { state: Option<JobState> },
}

/// Fixed number of slots pulling from one broker queue.
///
/// Each slot runs one job at a time, so `pool_size` bounds concurrent
/// executions for the whole process.
pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    cfg: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
        registry: Arc<HandlerRegistry>,
        policy: RetryPolicy,
        cfg: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            store,
            registry,
            policy,
            cfg,
        }
    }

    /// Run every slot plus the lease reaper until `shutdown` flips to `true`
    /// (or its sender is dropped). In-flight jobs finish before this returns.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let pool = Arc::new(self);
        let mut join_set = JoinSet::new();

        tracing::info!(
            worker_id = %pool.cfg.worker_id,
            queue = %pool.cfg.queue,
            pool_size = pool.cfg.pool_size,
            handlers = ?pool.registry.names(),
            "worker pool starting"
        );

        for slot in 0..pool.cfg.pool_size.max(1) {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            join_set.spawn(async move { pool.slot_loop(slot, shutdown).await });
        }

        {
            let pool = pool.clone();
            join_set.spawn(async move { pool.reaper_loop(shutdown).await });
        }

        while let Some(joined) = join_set.join_next().await {
            joined?;
        }

        tracing::info!(worker_id = %pool.cfg.worker_id, "worker pool stopped");
        Ok(())
    }

    /// Fetch and process at most one message. `None` when the queue had
    /// nothing visible.
    pub async fn run_once(&self) -> Result<Option<Outcome>> {
        // taken before the fetch so the lease can only end later than we think
        let leased_at = Instant::now();
        let fetched = self
            .broker
            .fetch(&self.cfg.queue, &self.cfg.worker_id, self.cfg.visibility_timeout)
            .await?;

        match fetched {
            Some(delivery) => Ok(Some(self.process(delivery, leased_at).await?)),
            None => Ok(None),
        }
    }

    async fn slot_loop(&self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(
                        worker_id = %self.cfg.worker_id,
                        slot,
                        error = %err,
                        "slot iteration failed"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(worker_id = %self.cfg.worker_id, slot, "slot stopped");
    }

    // reclaim leases from dead workers on a fixed interval
    async fn reaper_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.broker.reap_expired().await {
                Ok(n) if n > 0 => {
                    tracing::warn!(worker_id = %self.cfg.worker_id, reaped = n, "reclaimed expired leases")
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "lease reaper failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.reap_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Drive one delivery to ACK or NACK.
    ///
    /// A store or broker error leaves the message leased; it comes back after
    /// the visibility timeout.
    async fn process(&self, delivery: Delivery, leased_at: Instant) -> Result<Outcome> {
        let job_id = delivery.message.job_id;

        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(QueueError::NotFound(_)) => {
                tracing::warn!(%job_id, "no result record for message, dropping");
                self.ack(&delivery).await?;
                return Ok(Outcome::Skipped { state: None });
            }
            Err(err) => return Err(err),
        };

        // checkpoint: duplicates of finished jobs and cancellations never run
        if job.state.is_terminal() {
            tracing::info!(%job_id, state = %job.state, "job already final, dropping message");
            self.ack(&delivery).await?;
            return Ok(Outcome::Skipped {
                state: Some(job.state),
            });
        }

        // a worker died mid-attempt on the last allowed try
        if job.attempts_exhausted() {
            let failure = JobFailure::new(
                ErrorCode::RetriesExhausted.as_str(),
                format!(
                    "attempt ceiling of {} reached after redelivery",
                    job.attempt_ceiling()
                ),
            );
            return self.fail(&delivery, failure).await;
        }

        let job = match self.store.mark_started(job_id).await {
            Ok(job) => job,
            Err(QueueError::InvalidTransition { from, .. }) => {
                // lost a race with cancel
                self.ack(&delivery).await?;
                return Ok(Outcome::Skipped { state: Some(from) });
            }
            Err(err) => return Err(err),
        };

        tracing::info!(
            %job_id,
            handler = %job.handler_name,
            attempt = job.attempt_count,
            delivery = delivery.delivery_count,
            worker_id = %self.cfg.worker_id,
            "executing job"
        );

        let started = Instant::now();
        let ctx = HandlerContext {
            job_id,
            attempt: job.attempt_count,
            worker_id: self.cfg.worker_id.clone(),
        };
        let result = match self.registry.handler_for(&job.handler_name) {
            Some(entry) => {
                entry
                    .run_within(
                        delivery.message.payload.clone(),
                        ctx,
                        self.cfg.job_timeout,
                        Some(self.execution_ceiling(leased_at)),
                    )
                    .await
            }
            None => Err(HandlerError::permanent(format!(
                "no handler registered for {:?}",
                job.handler_name
            ))
            .with_code(ErrorCode::HandlerNotFound)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                self.store.mark_success(job_id, value).await?;
                self.ack(&delivery).await?;
                tracing::info!(%job_id, attempt = job.attempt_count, latency_ms, "job succeeded");
                Ok(Outcome::Succeeded)
            }
            Err(err) => {
                let class = err.class;
                let failure = JobFailure::new(err.code.as_str(), err.message);

                let decision = self
                    .policy
                    .clone()
                    .with_max_retries(job.max_retries)
                    .decide(job.attempt_count, class, &mut rand::thread_rng());

                match decision {
                    RetryDecision::Retry { delay } => {
                        tracing::warn!(
                            %job_id,
                            attempt = job.attempt_count,
                            code = %failure.code,
                            error = %failure.message,
                            delay_ms = delay.as_millis() as u64,
                            latency_ms,
                            "job failed, retry scheduled"
                        );
                        self.store.mark_retry(job_id, failure).await?;
                        if !self.broker.nack(&delivery, delay).await? {
                            tracing::warn!(%job_id, "lease lost before nack");
                        }
                        Ok(Outcome::Retried { delay })
                    }
                    RetryDecision::GiveUp => self.fail(&delivery, failure).await,
                }
            }
        }
    }

    /// Time a handler may still run before the lease lapses. A tenth of the
    /// lease is held back for the store write and the ack/nack.
    fn execution_ceiling(&self, leased_at: Instant) -> Duration {
        let lease = self.cfg.visibility_timeout;
        (lease - lease / 10).saturating_sub(leased_at.elapsed())
    }

    async fn fail(&self, delivery: &Delivery, failure: JobFailure) -> Result<Outcome> {
        let job_id = delivery.message.job_id;
        let job = self.store.mark_failure(job_id, failure.clone()).await?;
        self.ack(delivery).await?;
        tracing::error!(
            %job_id,
            attempts = job.attempt_count,
            code = %failure.code,
            error = %failure.message,
            "job failed"
        );
        Ok(Outcome::Failed { code: failure.code })
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if !self.broker.ack(delivery).await? {
            tracing::warn!(job_id = %delivery.message.job_id, "lease lost before ack");
        }
        Ok(())
    }
}
