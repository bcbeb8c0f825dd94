// tests/submission.rs
mod common;

use common::{email, register_send_email, Harness, EMAIL_SCHEMA};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use taskflow::jobs::model::{Delivery, QueueMessage};
use taskflow::jobs::{
    Broker, Dispatcher, DispatcherConfig, HandlerRegistry, JobState, MemoryStore, Outcome,
    Payload, QueueDepth, ResultStore, SubmitOptions,
};
use taskflow::QueueError;

fn harness() -> Harness {
    let mut builder = HandlerRegistry::builder();
    register_send_email(&mut builder);
    Harness::new(builder.build().unwrap(), 3)
}

#[tokio::test]
async fn submitted_job_is_pending_with_one_message() {
    let h = harness();

    let id = h
        .dispatcher
        .submit_json("send_email", EMAIL_SCHEMA, &email(&["a@b.com"]))
        .await
        .unwrap();

    let status = h.dispatcher.get_status(id).await.unwrap();
    assert_eq!(status.state, JobState::Pending);
    assert_eq!(status.attempt_count, 0);
    assert!(status.result.is_none());
    assert!(status.error.is_none());
    assert!(status.started_at.is_none());

    assert_eq!(
        h.broker.depth("default").await.unwrap(),
        QueueDepth { ready: 1, leased: 0 }
    );
}

#[tokio::test]
async fn ids_are_unique_across_submissions() {
    let h = harness();

    let mut ids = HashSet::new();
    for _ in 0..200 {
        let id = h
            .dispatcher
            .submit_json("send_email", EMAIL_SCHEMA, &email(&["a@b.com"]))
            .await
            .unwrap();
        assert!(ids.insert(id), "duplicate id {id}");
    }
}

#[tokio::test]
async fn unknown_id_is_not_found() {
    let h = harness();
    let missing = Uuid::new_v4();

    let err = h.dispatcher.get_status(missing).await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound(id) if id == missing));
}

#[tokio::test]
async fn oversized_payload_is_rejected_before_anything_is_written() {
    let broker = taskflow::jobs::MemoryBroker::new();
    let store = MemoryStore::new();
    let dispatcher = Dispatcher::new(
        Arc::new(broker.clone()),
        Arc::new(store.clone()),
        DispatcherConfig {
            max_payload_bytes: 16,
            ..DispatcherConfig::default()
        },
    );

    let err = dispatcher
        .submit("send_email", Payload::new(EMAIL_SCHEMA, vec![b'x'; 17]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        QueueError::PayloadTooLarge { max: 16, actual: 17 }
    ));
    assert_eq!(store.counts().await.unwrap().total(), 0);
    assert_eq!(broker.depth("default").await.unwrap(), QueueDepth::default());
}

#[tokio::test]
async fn unserializable_payload_is_a_serialization_error() {
    let h = harness();

    // JSON object keys must be strings
    let mut bad = BTreeMap::new();
    bad.insert((1u8, 2u8), "x");

    let err = h
        .dispatcher
        .submit_json("send_email", EMAIL_SCHEMA, &bad)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Serialization(_)));
    assert_eq!(h.store.counts().await.unwrap().total(), 0);
}

#[tokio::test]
async fn named_queue_keeps_messages_apart() {
    let h = harness();

    let id = h
        .dispatcher
        .submit_with(
            "send_email",
            Payload::json(EMAIL_SCHEMA, &email(&["a@b.com"])).unwrap(),
            SubmitOptions::default().queue("mail"),
        )
        .await
        .unwrap();

    assert_eq!(h.broker.depth("default").await.unwrap(), QueueDepth::default());
    assert_eq!(h.broker.depth("mail").await.unwrap().ready, 1);
    // the harness pool only listens on "default"
    assert!(h.workers.run_once().await.unwrap().is_none());
    assert_eq!(
        h.dispatcher.get_status(id).await.unwrap().state,
        JobState::Pending
    );
}

#[tokio::test]
async fn cancel_only_while_pending() {
    let h = harness();

    let queued = h
        .dispatcher
        .submit_json("send_email", EMAIL_SCHEMA, &email(&["a@b.com"]))
        .await
        .unwrap();
    let snapshot = h.dispatcher.cancel(queued).await.unwrap();
    assert_eq!(snapshot.state, JobState::Cancelled);
    assert!(snapshot.finished_at.is_some());

    // the worker drops the cancelled message without running it
    assert_eq!(
        h.workers.run_once().await.unwrap(),
        Some(Outcome::Skipped {
            state: Some(JobState::Cancelled)
        })
    );
    let status = h.dispatcher.get_status(queued).await.unwrap();
    assert_eq!(status.state, JobState::Cancelled);
    assert_eq!(status.attempt_count, 0);
    assert_eq!(h.broker.depth("default").await.unwrap(), QueueDepth::default());

    let err = h.dispatcher.cancel(queued).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::NotCancellable { state: JobState::Cancelled, .. }
    ));
}

#[tokio::test]
async fn replay_creates_a_linked_job() {
    let h = harness();

    let original = h
        .dispatcher
        .submit_json("send_email", EMAIL_SCHEMA, &email(&[]))
        .await
        .unwrap();

    // not final yet
    let err = h.dispatcher.replay(original).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::NotReplayable { state: JobState::Pending, .. }
    ));

    assert_eq!(h.run_until_final(original).await.state, JobState::Failure);

    let replayed = h.dispatcher.replay(original).await.unwrap();
    assert_ne!(replayed, original);

    let job = h.store.get(replayed).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.replay_of, Some(original));
    assert_eq!(job.handler_name, "send_email");
    assert_eq!(job.attempt_count, 0);
}

/// Broker that is down for every call.
struct UnreachableBroker;

#[async_trait]
impl Broker for UnreachableBroker {
    async fn enqueue(&self, _message: QueueMessage) -> taskflow::Result<()> {
        Err(QueueError::broker("connection refused"))
    }

    async fn fetch(
        &self,
        _queue: &str,
        _worker_id: &str,
        _visibility_timeout: Duration,
    ) -> taskflow::Result<Option<Delivery>> {
        Err(QueueError::broker("connection refused"))
    }

    async fn ack(&self, _delivery: &Delivery) -> taskflow::Result<bool> {
        Err(QueueError::broker("connection refused"))
    }

    async fn nack(&self, _delivery: &Delivery, _delay: Duration) -> taskflow::Result<bool> {
        Err(QueueError::broker("connection refused"))
    }

    async fn reap_expired(&self) -> taskflow::Result<u64> {
        Err(QueueError::broker("connection refused"))
    }

    async fn depth(&self, _queue: &str) -> taskflow::Result<QueueDepth> {
        Err(QueueError::broker("connection refused"))
    }
}

#[tokio::test]
async fn broker_outage_fails_submission_without_leaving_a_record() {
    let store = MemoryStore::new();
    let dispatcher = Dispatcher::new(
        Arc::new(UnreachableBroker),
        Arc::new(store.clone()),
        DispatcherConfig::default(),
    );

    let err = dispatcher
        .submit_json("send_email", EMAIL_SCHEMA, &email(&["a@b.com"]))
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::BrokerUnavailable(_)));
    assert_eq!(store.counts().await.unwrap().total(), 0);
}
