use chrono::Utc;
use std::env;
use std::sync::Arc;
use uuid::Uuid;

use taskflow::config::Config;
use taskflow::db;
use taskflow::jobs::error_codes::suggested_action;
use taskflow::jobs::{Broker, Dispatcher, Payload, PgBroker, PgStore, ResultStore, StatusSnapshot};

const USAGE: &str = "taskflowctl <command>\n\
     Commands:\n\
     - migrate\n\
     - submit <handler> <json-payload> [schema]\n\
     - status <job_id>\n\
     - cancel <job_id>\n\
     - replay <job_id>\n\
     - stats\n\
     - purge\n\
     \n\
     Uses DATABASE_URL (or TASKFLOW_DATABASE_URL).\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let cfg = Config::from_env()?;
    taskflow::observability::init(cfg.log_json);

    let pool = db::make_pool(&cfg.database_url).await?;
    let store: Arc<dyn ResultStore> = match cfg.result_ttl {
        Some(ttl) => Arc::new(PgStore::with_ttl(pool.clone(), ttl)),
        None => Arc::new(PgStore::new(pool.clone())),
    };
    let broker: Arc<dyn Broker> = Arc::new(PgBroker::new(pool.clone()));
    let dispatcher = Dispatcher::new(broker.clone(), store.clone(), cfg.dispatcher_config());

    match args[1].as_str() {
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrate OK");
        }
        "submit" => {
            let handler = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: taskflowctl submit <handler> <json>"))?;
            let raw = args.get(3).map(String::as_str).unwrap_or("{}");
            let schema = args.get(4).map(String::as_str).unwrap_or("json");

            // validate it is JSON before it goes on the queue
            let value: serde_json::Value = serde_json::from_str(raw)?;
            let job_id = dispatcher
                .submit(handler, Payload::json(schema, &value)?)
                .await?;
            println!("{job_id}");
        }
        "status" => {
            let job_id = job_id_arg(&args, "status")?;
            print_status(&dispatcher.get_status(job_id).await?);
        }
        "cancel" => {
            let job_id = job_id_arg(&args, "cancel")?;
            print_status(&dispatcher.cancel(job_id).await?);
        }
        "replay" => {
            let job_id = job_id_arg(&args, "replay")?;
            let new_id = dispatcher.replay(job_id).await?;
            println!("replayed {job_id} as {new_id}");
        }
        "stats" => {
            let counts = store.counts().await?;
            let depth = broker.depth(&cfg.queue).await?;
            println!(
                "jobs: pending={} started={} retry={} success={} failure={} cancelled={}",
                counts.pending,
                counts.started,
                counts.retry,
                counts.success,
                counts.failure,
                counts.cancelled
            );
            println!(
                "queue {}: ready={} leased={}",
                cfg.queue, depth.ready, depth.leased
            );
        }
        "purge" => {
            let n = store.purge_expired(Utc::now()).await?;
            println!("purged {n} expired results");
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn job_id_arg(args: &[String], cmd: &str) -> anyhow::Result<Uuid> {
    let raw = args
        .get(2)
        .ok_or_else(|| anyhow::anyhow!("usage: taskflowctl {cmd} <job_id>"))?;
    Ok(raw.parse()?)
}

fn print_status(s: &StatusSnapshot) {
    println!(
        "JOB: id={} handler={} state={} attempts={} enqueued_at={} started_at={:?} finished_at={:?}",
        s.id, s.handler_name, s.state, s.attempt_count, s.enqueued_at, s.started_at, s.finished_at
    );
    if let Some(result) = &s.result {
        println!("result: {result}");
    }
    if let Some(err) = s.error.as_ref().or(s.last_error.as_ref()) {
        println!("error: {} {}", err.code, err.message);
        println!("hint: {}", suggested_action(&err.code));
    }
}
