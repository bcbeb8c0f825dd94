// tests/execution.rs
mod common;

use common::{email, register_send_email, wait_for_terminal, Harness, EMAIL_SCHEMA};

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use taskflow::jobs::{
    Broker, HandlerError, HandlerOptions, HandlerRegistry, JobState, Outcome, Payload, QueueDepth,
    ResultStore, SubmitOptions,
};

#[tokio::test]
async fn send_email_succeeds_on_first_attempt() {
    let mut builder = HandlerRegistry::builder();
    register_send_email(&mut builder);
    let h = Harness::new(builder.build().unwrap(), 3);

    let id = h
        .dispatcher
        .submit_json("send_email", EMAIL_SCHEMA, &email(&["a@b.com"]))
        .await
        .unwrap();

    let status = h.run_until_final(id).await;
    assert_eq!(status.state, JobState::Success);
    assert_eq!(status.attempt_count, 1);
    assert_eq!(status.result.unwrap()["delivered"], 1);
    assert!(status.error.is_none());
    assert!(status.started_at.is_some());
    assert!(status.finished_at.is_some());

    assert_eq!(h.broker.depth("default").await.unwrap(), QueueDepth::default());
}

#[tokio::test]
async fn submit_through_the_registration_handle() {
    let mut builder = HandlerRegistry::builder();
    let send_email = register_send_email(&mut builder);
    let h = Harness::new(builder.build().unwrap(), 3);

    let id = h
        .dispatcher
        .submit_to(
            &send_email,
            Payload::json(EMAIL_SCHEMA, &email(&["a@b.com", "c@d.com"])).unwrap(),
        )
        .await
        .unwrap();

    let status = h.run_until_final(id).await;
    assert_eq!(status.handler_name, "send_email");
    assert_eq!(status.state, JobState::Success);
    assert_eq!(status.result.unwrap()["delivered"], 2);
}

#[tokio::test]
async fn permanent_error_fails_without_retry() {
    let mut builder = HandlerRegistry::builder();
    register_send_email(&mut builder);
    let h = Harness::new(builder.build().unwrap(), 3);

    let id = h
        .dispatcher
        .submit_json("send_email", EMAIL_SCHEMA, &email(&[]))
        .await
        .unwrap();

    let status = h.run_until_final(id).await;
    assert_eq!(status.state, JobState::Failure);
    assert_eq!(status.attempt_count, 1);

    let error = status.error.unwrap();
    assert_eq!(error.code, "PERMANENT");
    assert!(error.message.contains("no recipients"));
}

#[tokio::test]
async fn unknown_handler_fails_at_execution() {
    let mut builder = HandlerRegistry::builder();
    register_send_email(&mut builder);
    let h = Harness::new(builder.build().unwrap(), 3);

    // accepted at submission, resolved by the worker
    let id = h
        .dispatcher
        .submit("send_sms", Payload::new("sms.v1", b"{}".to_vec()))
        .await
        .unwrap();
    assert_eq!(
        h.dispatcher.get_status(id).await.unwrap().state,
        JobState::Pending
    );

    let status = h.run_until_final(id).await;
    assert_eq!(status.state, JobState::Failure);
    assert_eq!(status.attempt_count, 1);
    assert_eq!(status.error.unwrap().code, "HANDLER_NOT_FOUND");
}

#[tokio::test]
async fn transient_errors_stop_at_the_retry_ceiling() {
    let calls = Arc::new(AtomicI32::new(0));

    let mut builder = HandlerRegistry::builder();
    {
        let calls = calls.clone();
        builder.register("flaky", move |_payload, _ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::transient("smtp unavailable"))
            }
        });
    }
    let h = Harness::new(builder.build().unwrap(), 2);

    let id = h
        .dispatcher
        .submit("flaky", Payload::new("none", Vec::new()))
        .await
        .unwrap();

    let status = h.run_until_final(id).await;
    assert_eq!(status.state, JobState::Failure);
    assert_eq!(status.attempt_count, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(status.error.unwrap().code, "TRANSIENT");
}

#[tokio::test]
async fn per_job_retry_override() {
    let calls = Arc::new(AtomicI32::new(0));

    let mut builder = HandlerRegistry::builder();
    {
        let calls = calls.clone();
        builder.register("flaky", move |_payload, _ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::transient("still down"))
            }
        });
    }
    let h = Harness::new(builder.build().unwrap(), 5);

    let id = h
        .dispatcher
        .submit_with(
            "flaky",
            Payload::new("none", Vec::new()),
            SubmitOptions::default().max_retries(0),
        )
        .await
        .unwrap();

    let status = h.run_until_final(id).await;
    assert_eq!(status.state, JobState::Failure);
    assert_eq!(status.attempt_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn states_move_forward_through_retries() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut builder = HandlerRegistry::builder();
    {
        let seen = seen.clone();
        builder.register("third_time_lucky", move |_payload, ctx| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(ctx.attempt);
                if ctx.attempt < 3 {
                    Err(HandlerError::transient(format!("attempt {} failed", ctx.attempt)))
                } else {
                    Ok(None)
                }
            }
        });
    }
    let h = Harness::new(builder.build().unwrap(), 3);

    let id = h
        .dispatcher
        .submit("third_time_lucky", Payload::new("none", Vec::new()))
        .await
        .unwrap();

    let mut states = vec![h.dispatcher.get_status(id).await.unwrap().state];
    loop {
        match h.workers.run_once().await.unwrap() {
            Some(Outcome::Retried { .. }) => {
                states.push(h.dispatcher.get_status(id).await.unwrap().state);
            }
            Some(Outcome::Succeeded) => {
                states.push(h.dispatcher.get_status(id).await.unwrap().state);
                break;
            }
            Some(other) => panic!("unexpected outcome {other:?}"),
            None => tokio::time::sleep(Duration::from_millis(2)).await,
        }
    }

    assert_eq!(
        states,
        vec![
            JobState::Pending,
            JobState::Retry,
            JobState::Retry,
            JobState::Success
        ]
    );
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);

    let status = h.dispatcher.get_status(id).await.unwrap();
    assert_eq!(status.attempt_count, 3);
    assert!(status.error.is_none());
    assert_eq!(status.last_error.unwrap().message, "attempt 2 failed");
}

#[tokio::test]
async fn handler_timeout_is_retried() {
    let mut builder = HandlerRegistry::builder();
    builder.register_with_options(
        "slow",
        |_payload, ctx| async move {
            if ctx.attempt == 1 {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok(None)
        },
        HandlerOptions::new().timeout(Duration::from_millis(20)),
    );
    let h = Harness::new(builder.build().unwrap(), 3);

    let id = h
        .dispatcher
        .submit("slow", Payload::new("none", Vec::new()))
        .await
        .unwrap();

    let status = h.run_until_final(id).await;
    assert_eq!(status.state, JobState::Success);
    assert_eq!(status.attempt_count, 2);
    assert_eq!(status.last_error.unwrap().code, "TIMEOUT");
}

#[tokio::test]
async fn handler_panic_does_not_take_down_the_worker() {
    let mut builder = HandlerRegistry::builder();
    builder.register("boom", |_payload, _ctx| async move {
        if true {
            panic!("handler bug");
        }
        Ok(None)
    });
    let h = Harness::new(builder.build().unwrap(), 1);

    let id = h
        .dispatcher
        .submit("boom", Payload::new("none", Vec::new()))
        .await
        .unwrap();

    let status = h.run_until_final(id).await;
    assert_eq!(status.state, JobState::Failure);
    assert_eq!(status.attempt_count, 2);

    let error = status.error.unwrap();
    assert_eq!(error.code, "PANIC");
    assert!(error.message.contains("handler bug"));
}

#[tokio::test]
async fn jobs_run_in_submission_order() {
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut builder = HandlerRegistry::builder();
    {
        let order = order.clone();
        builder.register("record", move |payload, _ctx| {
            let order = order.clone();
            async move {
                let n: u32 = payload.decode()?;
                order.lock().unwrap().push(n);
                Ok(None)
            }
        });
    }
    let h = Harness::new(builder.build().unwrap(), 0);

    for n in 0..10u32 {
        h.dispatcher
            .submit_json("record", "u32", &n)
            .await
            .unwrap();
    }
    while h.workers.run_once().await.unwrap().is_some() {}

    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<u32>>());
}

#[tokio::test]
async fn pool_drains_queue_and_stops_on_shutdown() {
    let mut builder = HandlerRegistry::builder();
    register_send_email(&mut builder);
    let h = Harness::new(builder.build().unwrap(), 3);

    let mut ids = Vec::new();
    for i in 0..20 {
        let recipients = if i % 5 == 0 { vec![] } else { vec!["a@b.com"] };
        ids.push((
            i,
            h.dispatcher
                .submit_json("send_email", EMAIL_SCHEMA, &email(&recipients))
                .await
                .unwrap(),
        ));
    }

    let Harness {
        dispatcher,
        workers,
        store,
        ..
    } = h;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(workers.run(shutdown_rx));

    for (i, id) in ids {
        let status = wait_for_terminal(&dispatcher, id).await;
        let expected = if i % 5 == 0 {
            JobState::Failure
        } else {
            JobState::Success
        };
        assert_eq!(status.state, expected, "job #{i}");
        assert_eq!(status.attempt_count, 1);
    }

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("pool did not stop")
        .unwrap()
        .unwrap();

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.success, 16);
    assert_eq!(counts.failure, 4);
}
