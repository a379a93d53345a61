//! Durable task queue and the worker pool that drains it.

pub mod queue;
pub mod worker;

pub use queue::{RedisBroker, TaskQueue};
pub use worker::WorkerPool;
