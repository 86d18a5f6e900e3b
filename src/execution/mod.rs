//! Run execution.
//!
//! [`Executor`] drives a [`Graph`](crate::core::graph::Graph) to completion
//! under a [`RunConfig`], dispatching attempts to a
//! [`TaskRunner`](crate::operators::TaskRunner).

mod config;
mod executor;
mod retry_queue;

pub use config::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONCURRENCY, RunConfig};
pub use executor::Executor;
