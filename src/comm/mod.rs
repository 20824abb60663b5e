//! Communicator over a two-dimensional topology of models and ranks.
//!
//! The flat world is carved into `num_models` replicas of
//! `procs_per_model` ranks each. Every process belongs to three
//! sub-communicators: its *model* (peers computing the same replica), the
//! *inter-model* group (peers holding the same position across replicas,
//! used for gradient aggregation), and its *node* (peers on the same
//! host). Byte and barrier counters feed telemetry only.

use crate::mat::MatrixData;
use crate::transport::Transport;
use crate::utils::error::{CohortError, Result};
use std::cell::{Cell, RefCell};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

pub mod allreduce;
pub mod buffers;

use buffers::CollectiveBuffers;

/// Tag used for matrix point-to-point traffic.
const TAG_MAT: u64 = 0;

/// Handle for an in-flight non-blocking operation. Must be waited on
/// before the backing matrix is reused.
#[must_use]
pub struct Request {
    kind: RequestKind,
}

enum RequestKind {
    Complete,
    Recv { src: usize, tag: u64 },
}

impl Request {
    fn complete() -> Self {
        Self {
            kind: RequestKind::Complete,
        }
    }
}

pub struct Communicator {
    world: Arc<dyn Transport>,
    model: Arc<dyn Transport>,
    intermodel: Arc<dyn Transport>,
    node: Arc<dyn Transport>,
    procs_per_model: usize,
    num_models: usize,
    model_rank: usize,
    rank_in_model: usize,
    procs_per_node: usize,
    rank_in_node: usize,
    model_ranks_on_node: Vec<usize>,
    buffers: RefCell<CollectiveBuffers>,
    bytes_sent: Cell<u64>,
    bytes_received: Cell<u64>,
    num_model_barriers: Cell<u64>,
    num_intermodel_barriers: Cell<u64>,
    num_global_barriers: Cell<u64>,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("procs_per_model", &self.procs_per_model)
            .field("num_models", &self.num_models)
            .field("model_rank", &self.model_rank)
            .field("rank_in_model", &self.rank_in_model)
            .field("procs_per_node", &self.procs_per_node)
            .field("rank_in_node", &self.rank_in_node)
            .field("model_ranks_on_node", &self.model_ranks_on_node)
            .finish_non_exhaustive()
    }
}

impl Communicator {
    /// Collective constructor: every rank of `world` must call this with
    /// the same `procs_per_model`. Zero means the whole world forms one
    /// model.
    pub fn new(world: Arc<dyn Transport>, procs_per_model: usize) -> Result<Self> {
        let world_size = world.size();
        let world_rank = world.rank();

        let procs_per_model = if procs_per_model == 0 {
            world_size
        } else {
            procs_per_model
        };
        if procs_per_model > world_size {
            return Err(CohortError::InvalidTopology(format!(
                "not enough processes for one model: procs_per_model {} exceeds world size {}",
                procs_per_model, world_size
            )));
        }
        if world_size % procs_per_model != 0 {
            return Err(CohortError::InvalidTopology(format!(
                "procs_per_model {} does not divide world size {}",
                procs_per_model, world_size
            )));
        }

        let num_models = world_size / procs_per_model;
        let model_rank = world_rank / procs_per_model;
        let rank_in_model = world_rank % procs_per_model;

        let model = world.split(model_rank, rank_in_model)?;
        let intermodel = world.split(rank_in_model, model_rank)?;
        let (node, model_ranks_on_node) = Self::setup_node_comm(&world, rank_in_model)?;

        debug!(
            world_rank,
            model_rank, rank_in_model, num_models, "communicator initialized"
        );

        Ok(Self {
            procs_per_node: node.size(),
            rank_in_node: node.rank(),
            world,
            model,
            intermodel,
            node,
            procs_per_model,
            num_models,
            model_rank,
            rank_in_model,
            model_ranks_on_node,
            buffers: RefCell::new(CollectiveBuffers::new()),
            bytes_sent: Cell::new(0),
            bytes_received: Cell::new(0),
            num_model_barriers: Cell::new(0),
            num_intermodel_barriers: Cell::new(0),
            num_global_barriers: Cell::new(0),
        })
    }

    /// Group ranks sharing a host. Host strings are hashed to pre-split
    /// the world cheaply; collisions are resolved by exchanging the
    /// literal strings within each hash group.
    fn setup_node_comm(
        world: &Arc<dyn Transport>,
        rank_in_model: usize,
    ) -> Result<(Arc<dyn Transport>, Vec<usize>)> {
        let host = world.processor_name();
        let mut hasher = DefaultHasher::new();
        host.hash(&mut hasher);
        let hash = hasher.finish() as usize;

        let hash_comm = world.split(hash, world.rank())?;
        let names = hash_comm.allgather(host.as_bytes())?;
        let mut node_index = hash_comm.rank();
        for (i, name) in names.iter().enumerate() {
            if name.as_slice() == host.as_bytes() {
                node_index = i;
                break;
            }
        }
        let node = hash_comm.split(node_index, world.rank())?;

        // Record which in-model positions share this host.
        let mine = (rank_in_model as u64).to_le_bytes();
        let gathered = node.allgather(&mine)?;
        let model_ranks_on_node = gathered
            .iter()
            .map(|b| u64::from_le_bytes(b.as_slice().try_into().expect("u64 payload")) as usize)
            .collect();

        Ok((node, model_ranks_on_node))
    }

    // Coordinate accessors.

    pub fn world_rank(&self) -> usize {
        self.world.rank()
    }

    pub fn world_size(&self) -> usize {
        self.world.size()
    }

    pub fn num_models(&self) -> usize {
        self.num_models
    }

    pub fn model_rank(&self) -> usize {
        self.model_rank
    }

    pub fn rank_in_model(&self) -> usize {
        self.rank_in_model
    }

    pub fn procs_per_model(&self) -> usize {
        self.procs_per_model
    }

    pub fn procs_per_node(&self) -> usize {
        self.procs_per_node
    }

    pub fn rank_in_node(&self) -> usize {
        self.rank_in_node
    }

    /// In-model positions of the ranks sharing this host, in node-rank
    /// order.
    pub fn model_ranks_on_node(&self) -> &[usize] {
        &self.model_ranks_on_node
    }

    pub fn model_comm(&self) -> &Arc<dyn Transport> {
        &self.model
    }

    pub fn intermodel_comm(&self) -> &Arc<dyn Transport> {
        &self.intermodel
    }

    pub fn node_comm(&self) -> &Arc<dyn Transport> {
        &self.node
    }

    pub fn world_comm(&self) -> &Arc<dyn Transport> {
        &self.world
    }

    fn world_rank_of(&self, model: usize, rank: usize) -> usize {
        model * self.procs_per_model + rank
    }

    // Point-to-point.

    /// Send a matrix to `(model, rank)`.
    pub fn send<M: MatrixData>(&self, mat: &M, model: usize, rank: usize) -> Result<()> {
        let bytes = mat.local().to_bytes();
        self.world
            .send(&bytes, self.world_rank_of(model, rank), TAG_MAT)?;
        self.add_bytes_sent(mat.local_byte_count());
        Ok(())
    }

    /// Receive a matrix from `(model, rank)`; the destination shape fixes
    /// the expected payload size.
    pub fn recv<M: MatrixData>(&self, mat: &mut M, model: usize, rank: usize) -> Result<()> {
        let expected = mat.local_byte_count();
        let mut buf = vec![0u8; expected];
        let n = self
            .world
            .recv(&mut buf, self.world_rank_of(model, rank), TAG_MAT)?;
        if n != expected {
            return Err(CohortError::Transport(format!(
                "matrix payload of {} bytes does not match destination of {}",
                n, expected
            )));
        }
        mat.local_mut().copy_from_bytes(&buf);
        self.add_bytes_received(expected);
        Ok(())
    }

    /// Buffered non-blocking send; the returned request completes
    /// immediately.
    pub fn nb_send<M: MatrixData>(&self, mat: &M, model: usize, rank: usize) -> Result<Request> {
        self.send(mat, model, rank)?;
        Ok(Request::complete())
    }

    /// Post a receive from `(model, rank)`; the payload lands in the
    /// matrix passed to [`Communicator::wait`].
    pub fn nb_recv(&self, model: usize, rank: usize) -> Request {
        Request {
            kind: RequestKind::Recv {
                src: self.world_rank_of(model, rank),
                tag: TAG_MAT,
            },
        }
    }

    /// Complete an in-flight request. For receives, `mat` is the backing
    /// destination and must match the sender's shape.
    pub fn wait<M: MatrixData>(&self, req: Request, mat: &mut M) -> Result<()> {
        match req.kind {
            RequestKind::Complete => Ok(()),
            RequestKind::Recv { src, tag } => {
                let expected = mat.local_byte_count();
                let mut buf = vec![0u8; expected];
                let n = self.world.recv(&mut buf, src, tag)?;
                if n != expected {
                    return Err(CohortError::Transport(format!(
                        "matrix payload of {} bytes does not match destination of {}",
                        n, expected
                    )));
                }
                mat.local_mut().copy_from_bytes(&buf);
                self.add_bytes_received(expected);
                Ok(())
            }
        }
    }

    /// Fan a matrix out from `root` (a world rank) to an explicit list of
    /// world-rank destinations.
    pub fn broadcast<M: MatrixData>(&self, mat: &mut M, dests: &[usize], root: usize) -> Result<()> {
        let me = self.world.rank();
        if me == root {
            let bytes = mat.local().to_bytes();
            for &dst in dests {
                if dst != root {
                    self.world.send(&bytes, dst, TAG_MAT)?;
                    self.add_bytes_sent(mat.local_byte_count());
                }
            }
        } else if dests.contains(&me) {
            let expected = mat.local_byte_count();
            let mut buf = vec![0u8; expected];
            let n = self.world.recv(&mut buf, root, TAG_MAT)?;
            if n != expected {
                return Err(CohortError::Transport(format!(
                    "matrix payload of {} bytes does not match destination of {}",
                    n, expected
                )));
            }
            mat.local_mut().copy_from_bytes(&buf);
            self.add_bytes_received(expected);
        }
        Ok(())
    }

    // Inter-model collectives.

    /// Broadcast a matrix across the inter-model communicator.
    pub fn intermodel_broadcast_matrix<M: MatrixData>(&self, mat: &mut M, root: usize) -> Result<()> {
        let mut bytes = mat.local().to_bytes();
        self.intermodel.broadcast(&mut bytes, root)?;
        if self.model_rank == root {
            self.add_bytes_sent(mat.local_byte_count());
        } else {
            mat.local_mut().copy_from_bytes(&bytes);
            self.add_bytes_received(mat.local_byte_count());
        }
        Ok(())
    }

    /// Elementwise SUM of a matrix across model replicas.
    pub fn intermodel_sum_matrix<M: MatrixData>(&self, mat: &mut M) -> Result<()> {
        self.add_bytes_sent(mat.local_byte_count());
        let mut vals: Vec<f32> = mat.local().view().iter().copied().collect();
        self.intermodel.allreduce_sum_f32(&mut vals)?;
        for (dst, v) in mat.local_mut().view_mut().iter_mut().zip(vals) {
            *dst = v;
        }
        self.add_bytes_received(mat.local_byte_count());
        Ok(())
    }

    // Barriers.

    pub fn model_barrier(&self) -> Result<()> {
        self.num_model_barriers.set(self.num_model_barriers.get() + 1);
        self.model.barrier()
    }

    pub fn intermodel_barrier(&self) -> Result<()> {
        self.num_intermodel_barriers
            .set(self.num_intermodel_barriers.get() + 1);
        self.intermodel.barrier()
    }

    pub fn global_barrier(&self) -> Result<()> {
        self.num_global_barriers
            .set(self.num_global_barriers.get() + 1);
        self.world.barrier()
    }

    // Telemetry counters. Never reset.

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.get()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.get()
    }

    pub fn num_model_barriers(&self) -> u64 {
        self.num_model_barriers.get()
    }

    pub fn num_intermodel_barriers(&self) -> u64 {
        self.num_intermodel_barriers.get()
    }

    pub fn num_global_barriers(&self) -> u64 {
        self.num_global_barriers.get()
    }

    pub(crate) fn add_bytes_sent(&self, n: usize) {
        self.bytes_sent.set(self.bytes_sent.get() + n as u64);
    }

    pub(crate) fn add_bytes_received(&self, n: usize) {
        self.bytes_received.set(self.bytes_received.get() + n as u64);
    }

    /// Scratch buffer at `idx` within the bucket for `size`; see
    /// [`CollectiveBuffers::get`].
    pub fn get_collective_buffer(&self, size: usize, idx: usize) -> Result<Rc<RefCell<Vec<u8>>>> {
        self.buffers.borrow_mut().get(size, idx)
    }
}
