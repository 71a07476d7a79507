//! Background workers that execute queued jobs.

pub mod checkpoint;
pub mod pool;

pub use checkpoint::JobCheckpoint;
pub use pool::{DeliveryOutcome, Worker, WorkerConfig, WorkerPool, WorkerPoolHandle, WorkerStats};
