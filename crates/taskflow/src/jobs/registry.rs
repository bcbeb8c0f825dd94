use serde_json::Value;
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::Semaphore,
    time::{timeout_at, Instant},
};
use uuid::Uuid;

use crate::jobs::error_codes::{ErrorClass, ErrorCode};
use crate::jobs::model::Payload;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type HandlerResult = Result<Option<Value>, HandlerError>;

type HandlerFn = dyn Fn(Payload, HandlerContext) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// Error raised by a handler. The class decides whether the worker retries.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub class: ErrorClass,
    pub message: String,
}

impl HandlerError {
    /// Retried according to the pool's retry policy.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Transient,
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    /// Recorded as FAILURE immediately, no retry.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Permanent,
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn timeout(budget: Duration) -> Self {
        Self {
            code: ErrorCode::Timeout,
            class: ErrorCode::Timeout.default_class(),
            message: format!("handler timeout after {}ms", budget.as_millis()),
        }
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = code;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

/// Per-attempt information handed to a handler next to its payload.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub job_id: Uuid,
    pub attempt: i32,
    pub worker_id: String,
}

#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

/// Returned by every registration. Producers can submit through it so the
/// handler name is spelled once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerHandle {
    name: String,
}

impl HandlerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler name must not be empty")]
    EmptyName,
    #[error("handler {0:?} registered more than once")]
    Duplicate(String),
}

#[derive(Clone)]
pub struct HandlerEntry {
    handler: Arc<HandlerFn>,
    semaphore: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
}

#[derive(Default)]
pub struct RegistryBuilder {
    handlers: HashMap<String, HandlerEntry>,
    problems: Vec<RegistryError>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: &str, handler: F) -> HandlerHandle
    where
        F: Fn(Payload, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_with_options(name, handler, HandlerOptions::new())
    }

    pub fn register_with_options<F, Fut>(
        &mut self,
        name: &str,
        handler: F,
        opts: HandlerOptions,
    ) -> HandlerHandle
    where
        F: Fn(Payload, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = name.trim().to_string();
        if name.is_empty() {
            self.problems.push(RegistryError::EmptyName);
        } else if self.handlers.contains_key(&name) {
            self.problems.push(RegistryError::Duplicate(name.clone()));
        }

        let semaphore = opts
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let handler: Arc<HandlerFn> =
            Arc::new(move |payload, ctx| Box::pin(handler(payload, ctx)) as BoxFuture<'static, _>);

        self.handlers.insert(
            name.clone(),
            HandlerEntry {
                handler,
                semaphore,
                timeout: opts.timeout,
            },
        );
        HandlerHandle { name }
    }

    /// Freeze the catalog. Any registration mistake fails startup here.
    pub fn build(mut self) -> Result<Arc<HandlerRegistry>, RegistryError> {
        if !self.problems.is_empty() {
            return Err(self.problems.remove(0));
        }
        Ok(Arc::new(HandlerRegistry {
            handlers: self.handlers,
        }))
    }
}

/// Immutable handler catalog, resolved by name at execution time.
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn handler_for(&self, name: &str) -> Option<HandlerEntry> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl HandlerEntry {
    pub async fn run(
        &self,
        payload: Payload,
        ctx: HandlerContext,
        default_timeout: Duration,
    ) -> HandlerResult {
        self.run_within(payload, ctx, default_timeout, None).await
    }

    /// Run one attempt in its own task so a panic is contained and a timeout
    /// can abort the work.
    ///
    /// `ceiling` caps the handler's own timeout. Waiting for a concurrency
    /// permit counts against the same deadline.
    pub async fn run_within(
        &self,
        payload: Payload,
        ctx: HandlerContext,
        default_timeout: Duration,
        ceiling: Option<Duration>,
    ) -> HandlerResult {
        let budget = match ceiling {
            Some(ceiling) => self.timeout.unwrap_or(default_timeout).min(ceiling),
            None => self.timeout.unwrap_or(default_timeout),
        };
        let now = Instant::now();
        let deadline = now
            .checked_add(budget)
            .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60));

        let _permit = match &self.semaphore {
            Some(sem) => match timeout_at(deadline, sem.clone().acquire_owned()).await {
                Ok(Ok(permit)) => Some(permit),
                Ok(Err(_)) => return Err(HandlerError::transient("handler semaphore closed")),
                Err(_) => return Err(HandlerError::timeout(budget)),
            },
            None => None,
        };

        let mut task = tokio::spawn((self.handler)(payload, ctx));

        match timeout_at(deadline, &mut task).await {
            Ok(Ok(res)) => res,
            Ok(Err(join_err)) if join_err.is_panic() => Err(HandlerError::transient(format!(
                "handler panicked: {}",
                panic_message(join_err.into_panic())
            ))
            .with_code(ErrorCode::Panic)),
            Ok(Err(join_err)) => Err(HandlerError::transient(join_err.to_string())),
            Err(_) => {
                task.abort();
                Err(HandlerError::timeout(budget))
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
