//! Scheduler layer for the worker
//!
//! This layer pulls build tasks from the queue, runs them through the
//! pipeline with bounded parallelism and settles every message with the
//! disposition the redelivery policy picks.

pub mod attempts;
pub mod consumer;

pub use consumer::{TaskConsumer, TaskHandler};
