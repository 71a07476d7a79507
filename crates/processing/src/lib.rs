//! `mediagraph-processing`
//!
//! **Responsibility:** boundary to the external media-analysis functions.
//!
//! Scene-graph construction and retrieval are opaque here: a [`Processor`] turns a
//! job input into an output or a [`ProcessingError`]. This crate knows nothing
//! about queues or stores; workers hand each processor a [`Checkpoint`] through
//! which cancellation and progress flow.

pub mod command;
pub mod error;
pub mod processor;
pub mod registry;

pub use command::CommandProcessor;
pub use error::{Interrupted, ProcessingError};
pub use processor::{Checkpoint, FnProcessor, NoopCheckpoint, Processor};
pub use registry::{ProcessorRegistry, ProcessorRegistryBuilder, RegistryError};
