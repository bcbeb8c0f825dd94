pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod observability;

pub use error::{QueueError, Result};
