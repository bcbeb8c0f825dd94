pub mod broker;
pub mod dispatcher;
pub mod error_codes;
pub mod memory;
pub mod model;
pub mod pg;
pub mod registry;
pub mod retry;
pub mod store;
pub mod worker;

pub use broker::Broker;
pub use dispatcher::{Dispatcher, DispatcherConfig, SubmitOptions};
pub use memory::{MemoryBroker, MemoryStore};
pub use model::{
    Job, JobFailure, JobId, JobState, Payload, QueueDepth, StateCounts, StatusSnapshot,
};
pub use pg::{PgBroker, PgStore};
pub use registry::{
    HandlerContext, HandlerError, HandlerHandle, HandlerOptions, HandlerRegistry, HandlerResult,
    RegistryBuilder,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::ResultStore;
pub use worker::{Outcome, WorkerConfig, WorkerPool};
