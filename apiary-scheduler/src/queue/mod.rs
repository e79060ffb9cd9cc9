//! Queueing for the dispatch pipeline
//!
//! Three shapes of queue, all in-memory and bounded where the pipeline
//! needs backpressure:
//! - [`ready::PriorityReadyQueue`]: the priority-ordered intake buffer
//! - [`drone::DroneQueue`]: a FIFO feeding one drone's dispatch worker
//! - [`retry::RetryQueue`]: the time-ordered persona retry buffer

pub mod drone;
pub mod ready;
pub mod retry;

use thiserror::Error;

use apiary_common::Task;

/// Returned when a task is offered to a queue that has been closed; the
/// task comes back so the caller can reroute or drop it.
#[derive(Debug, Error)]
#[error("Queue closed")]
pub struct QueueClosed(pub Task);
