//! Minibatch input pipeline: shuffled sample scheduling per data reader
//! and distribution of assembled minibatches across a model.

pub mod minibatch;
pub mod reader;

pub use minibatch::DistributedMinibatch;
pub use reader::{DataReader, ReaderCore};

/// Phase of the training loop a reader serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    Training,
    Validation,
    Testing,
}
