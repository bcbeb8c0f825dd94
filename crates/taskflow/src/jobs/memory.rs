use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::jobs::broker::Broker;
use crate::jobs::model::{
    Delivery, Job, JobFailure, JobId, JobState, QueueDepth, QueueMessage, StateCounts,
};
use crate::jobs::store::{apply_transition, ResultStore, Transition};

fn chrono_dur(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[derive(Debug, Clone)]
struct Lease {
    id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    message: QueueMessage,
    visible_at: DateTime<Utc>,
    lease: Option<Lease>,
    delivery_count: i32,
}

#[derive(Default)]
struct BrokerInner {
    next_seq: u64,
    slots: Vec<Slot>,
}

/// In-memory [`Broker`] for development and testing.
///
/// Messages live in a `Vec` behind a mutex. Not durable: everything is lost
/// on restart; use [`crate::jobs::pg::PgBroker`] for that.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, message: QueueMessage) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.slots.push(Slot {
            seq,
            message,
            visible_at: Utc::now(),
            lease: None,
            delivery_count: 0,
        });
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Delivery>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let pos = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.message.queue == queue && s.lease.is_none() && s.visible_at <= now)
            .min_by_key(|(_, s)| (s.visible_at, s.seq))
            .map(|(idx, _)| idx);

        let Some(idx) = pos else {
            return Ok(None);
        };

        let slot = &mut inner.slots[idx];
        let lease_id = Uuid::new_v4();
        slot.lease = Some(Lease {
            id: lease_id,
            expires_at: now + chrono_dur(visibility_timeout),
        });
        slot.delivery_count += 1;

        Ok(Some(Delivery {
            message: slot.message.clone(),
            lease_id,
            delivery_count: slot.delivery_count,
            worker_id: worker_id.to_string(),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.slots.len();
        inner
            .slots
            .retain(|s| s.lease.as_ref().map(|l| l.id) != Some(delivery.lease_id));
        Ok(inner.slots.len() < before)
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.lease.as_ref().map(|l| l.id) == Some(delivery.lease_id));

        match slot {
            Some(slot) => {
                slot.lease = None;
                slot.visible_at = Utc::now() + chrono_dur(delay);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reap_expired(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut reaped = 0;
        for slot in inner.slots.iter_mut() {
            if slot.lease.as_ref().is_some_and(|l| l.expires_at < now) {
                // keeps its original visible_at, so it goes back to its FIFO spot
                slot.lease = None;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let inner = self.inner.lock().await;
        let mut depth = QueueDepth::default();
        for slot in inner.slots.iter().filter(|s| s.message.queue == queue) {
            if slot.lease.is_some() {
                depth.leased += 1;
            } else {
                depth.ready += 1;
            }
        }
        Ok(depth)
    }
}

/// In-memory [`ResultStore`]. Optional TTL applies to terminal records.
#[derive(Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<Mutex<HashMap<JobId, Job>>>,
    ttl: Option<chrono::Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            jobs: Arc::default(),
            ttl: Some(chrono_dur(ttl)),
        }
    }

    async fn transition(&self, job_id: JobId, to: JobState, outcome: Transition) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let job = jobs
            .get_mut(&job_id)
            .filter(|j| !j.is_expired_at(now))
            .ok_or(QueueError::NotFound(job_id))?;

        apply_transition(job, to, outcome, self.ttl, now)?;
        Ok(job.clone())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn insert_pending(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(QueueError::DuplicateJob(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Job> {
        let jobs = self.jobs.lock().await;
        jobs.get(&job_id)
            .filter(|j| !j.is_expired_at(Utc::now()))
            .cloned()
            .ok_or(QueueError::NotFound(job_id))
    }

    async fn mark_started(&self, job_id: JobId) -> Result<Job> {
        self.transition(job_id, JobState::Started, Transition::Start)
            .await
    }

    async fn mark_retry(&self, job_id: JobId, error: JobFailure) -> Result<Job> {
        self.transition(job_id, JobState::Retry, Transition::Retry(error))
            .await
    }

    async fn mark_success(&self, job_id: JobId, result: Option<Value>) -> Result<Job> {
        self.transition(job_id, JobState::Success, Transition::Succeed(result))
            .await
    }

    async fn mark_failure(&self, job_id: JobId, error: JobFailure) -> Result<Job> {
        self.transition(job_id, JobState::Failure, Transition::Fail(error))
            .await
    }

    async fn cancel(&self, job_id: JobId) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let job = jobs
            .get_mut(&job_id)
            .filter(|j| !j.is_expired_at(now))
            .ok_or(QueueError::NotFound(job_id))?;

        if job.state != JobState::Pending {
            return Err(QueueError::NotCancellable {
                job_id,
                state: job.state,
            });
        }
        apply_transition(job, JobState::Cancelled, Transition::Cancel, self.ttl, now)?;
        Ok(job.clone())
    }

    async fn remove(&self, job_id: JobId) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        Ok(jobs.remove(&job_id).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, j| !j.is_expired_at(now));
        Ok((before - jobs.len()) as u64)
    }

    async fn counts(&self) -> Result<StateCounts> {
        let jobs = self.jobs.lock().await;
        let now = Utc::now();
        let mut counts = StateCounts::default();
        for job in jobs.values().filter(|j| !j.is_expired_at(now)) {
            counts.bump(job.state, 1);
        }
        Ok(counts)
    }
}
