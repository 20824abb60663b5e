//! Data-parallel training collectives and distributed minibatch I/O.
//!
//! Two subsystems make up this crate. The [`comm`] module partitions a
//! flat world of ranks into model replicas, exposes intra-model,
//! inter-model, node-local and global collectives, and aggregates
//! gradients across replicas through a transform-aware allreduce. The
//! [`data`] module coordinates parallel data readers, each pulling a
//! disjoint shard of a sample batch, and redistributes the assembled
//! minibatch into a column-circulant staging matrix for the first
//! training layer, with deterministic shuffling and checkpointed
//! resumption.
//!
//! Both subsystems sit on a [`transport::Transport`] substrate; the
//! in-process [`transport::local::LocalWorld`] backs tests and
//! single-node runs.

pub mod checkpoint;
pub mod comm;
pub mod data;
pub mod mat;
pub mod transport;
pub mod utils;

pub use comm::allreduce::{AllreduceTransform, IdentityTransform};
pub use comm::{Communicator, Request};
pub use data::{DataReader, DistributedMinibatch, ExecutionMode, ReaderCore};
pub use mat::{CircMat, DataType, Mat, MatrixData};
pub use utils::error::{CohortError, Result};
