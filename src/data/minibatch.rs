//! Distribution of minibatches assembled by parallel readers.
//!
//! A subset of the ranks in each model act as readers, each fetching a
//! disjoint shard of one sample batch into a local matrix. The assembled
//! minibatch is then rotated into the circulant staging matrix one column
//! block per reader, so every rank of the model ends up with the same
//! globally ordered minibatch.

use crate::comm::Communicator;
use crate::data::reader::{DataReader, ReaderCore};
use crate::data::ExecutionMode;
use crate::mat::{CircMat, DataType, Mat, MatrixData};
use crate::utils::error::{CohortError, Result};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Per-rank minibatch plan within a model: readers leapfrog through the
/// shared index space.
struct IterationPlan {
    base_offset: usize,
    model_offset: usize,
    stride: usize,
    num_mini_batches: usize,
    last_mini_batch_size: usize,
}

pub struct DistributedMinibatch {
    comm: Rc<Communicator>,
    /// Reader rank currently designated as broadcast source.
    root: usize,
    num_parallel_readers_training: usize,
    num_parallel_readers_validating: usize,
    num_parallel_readers_testing: usize,
    max_mini_batch_size: usize,
    num_samples_in_batch: usize,
    local_data_valid: bool,
    local_reader_done: bool,
    num_valid_readers: usize,
    /// Which reader ranks produced data in the current minibatch.
    valid_readers: Vec<bool>,
    mode: ExecutionMode,
    readers: HashMap<ExecutionMode, Box<dyn DataReader>>,
}

impl DistributedMinibatch {
    pub fn new(
        comm: Rc<Communicator>,
        num_parallel_readers: usize,
        mini_batch_size: usize,
        readers: HashMap<ExecutionMode, Box<dyn DataReader>>,
    ) -> Self {
        let count_for = |mode: ExecutionMode| {
            readers.get(&mode).map_or(0, |r| {
                Self::max_parallel_readers(
                    &comm,
                    r.num_samples(),
                    mini_batch_size,
                    num_parallel_readers,
                )
            })
        };
        let num_parallel_readers_training = count_for(ExecutionMode::Training);
        let num_parallel_readers_validating = count_for(ExecutionMode::Validation);
        let num_parallel_readers_testing = count_for(ExecutionMode::Testing);

        Self {
            num_valid_readers: num_parallel_readers_training,
            root: 0,
            num_parallel_readers_training,
            num_parallel_readers_validating,
            num_parallel_readers_testing,
            max_mini_batch_size: mini_batch_size,
            num_samples_in_batch: 0,
            local_data_valid: false,
            local_reader_done: false,
            valid_readers: Vec::new(),
            mode: ExecutionMode::Training,
            readers,
            comm,
        }
    }

    fn max_parallel_readers(
        comm: &Communicator,
        data_set_size: usize,
        mini_batch_size: usize,
        requested: usize,
    ) -> usize {
        let mut readers = requested.min(comm.procs_per_model());
        // No point keeping readers that would never see a shard.
        let viable = data_set_size.div_ceil(mini_batch_size.max(1));
        readers = readers.min(viable);
        if readers < requested {
            warn!(
                requested,
                viable = readers,
                data_set_size,
                mini_batch_size,
                "reducing parallel readers; surplus ranks stay inactive for this phase"
            );
        }
        readers
    }

    /// Viable reader count for a data set: `min(requested, ceil(N/B))`,
    /// capped at the ranks available in one model.
    pub fn compute_max_num_parallel_readers(
        &self,
        data_set_size: usize,
        mini_batch_size: usize,
        num_parallel_readers: usize,
    ) -> usize {
        Self::max_parallel_readers(
            &self.comm,
            data_set_size,
            mini_batch_size,
            num_parallel_readers,
        )
    }

    pub fn set_execution_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.num_valid_readers = self.num_parallel_readers_for(mode);
        self.valid_readers.clear();
        self.local_reader_done = false;
        self.local_data_valid = false;
        self.root = 0;
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    fn num_parallel_readers_for(&self, mode: ExecutionMode) -> usize {
        match mode {
            ExecutionMode::Training => self.num_parallel_readers_training,
            ExecutionMode::Validation => self.num_parallel_readers_validating,
            ExecutionMode::Testing => self.num_parallel_readers_testing,
        }
    }

    /// Parallel readers for the current phase.
    pub fn num_parallel_readers(&self) -> usize {
        self.num_parallel_readers_for(self.mode)
    }

    /// Readers that produced data in the current minibatch.
    pub fn num_valid_readers(&self) -> usize {
        self.num_valid_readers
    }

    pub fn num_samples_in_batch(&self) -> usize {
        self.num_samples_in_batch
    }

    pub fn local_data_valid(&self) -> bool {
        self.local_data_valid
    }

    /// Is this rank the current broadcast source?
    pub fn is_current_root(&self) -> bool {
        self.comm.rank_in_model() == self.root
    }

    pub fn reader(&self, mode: ExecutionMode) -> Option<&dyn DataReader> {
        self.readers.get(&mode).map(|r| r.as_ref())
    }

    pub fn reader_mut(&mut self, mode: ExecutionMode) -> Option<&mut (dyn DataReader + '_)> {
        match self.readers.get_mut(&mode) {
            Some(r) => Some(r.as_mut()),
            None => None,
        }
    }

    /// Pull this rank's shard of the next minibatch. Reader ranks that
    /// still have data fetch through their data reader; the rest
    /// contribute zero samples. A single failing reader is logged and
    /// dropped from the current rotation; losing more than half the
    /// readers fails the step.
    pub fn fetch_to_local_matrix(&mut self, mat: &mut Mat) -> Result<usize> {
        let npr = self.num_parallel_readers();
        let rank_in_model = self.comm.rank_in_model();
        self.local_data_valid = false;
        self.num_samples_in_batch = 0;

        let mut failed = 0u8;
        if rank_in_model < npr && !self.local_reader_done {
            let reader = self.readers.get_mut(&self.mode).ok_or_else(|| {
                CohortError::MissingConfiguration(format!(
                    "no data reader registered for {:?}",
                    self.mode
                ))
            })?;
            mat.fill(0.0);
            match reader.fetch_batch(mat) {
                Ok(count) => {
                    self.num_samples_in_batch = count;
                    self.local_data_valid = count > 0;
                }
                Err(err) => {
                    warn!(rank_in_model, error = %err, "reader failed to fetch; excluded from this rotation");
                    failed = 1;
                }
            }
        }

        // Every rank learns which readers hold data and which dropped out.
        let status = [self.local_data_valid as u8, failed];
        let flags = self.comm.model_comm().allgather(&status)?;
        self.valid_readers = (0..npr).map(|r| flags[r][0] == 1).collect();
        let failures = (0..npr).filter(|&r| flags[r][1] == 1).count();
        if failures * 2 > npr {
            return Err(CohortError::InsufficientReaders(format!(
                "{} of {} parallel readers failed in one minibatch",
                failures, npr
            )));
        }
        self.num_valid_readers = self.valid_readers.iter().filter(|&&v| v).count();

        Ok(self.num_samples_in_batch)
    }

    /// Rotate each valid reader's local tile into the staging matrix. On
    /// step `k` the current root broadcasts its sample count and tile
    /// over the model communicator as the `k`-th column block; the root
    /// pointer then advances to the next reader rank. Column order after
    /// the rotations is reader 0's samples, reader 1's, and so on.
    pub fn distribute_from_local_matrix(&mut self, mat: &Mat, circ: &mut CircMat) -> Result<()> {
        let npr = self.num_parallel_readers();
        if npr == 0 {
            return Ok(());
        }
        circ.reset();
        if !self.valid_readers.iter().any(|&v| v) {
            return Ok(());
        }
        let rank_in_model = self.comm.rank_in_model();
        let height = circ.local_height();
        let mut root = self.root;

        for _ in 0..self.num_valid_readers {
            while !self.valid_readers.get(root).copied().unwrap_or(false) {
                root = (root + 1) % npr;
            }

            let mut header = [0u8; 8];
            if rank_in_model == root {
                header = (self.num_samples_in_batch as u64).to_le_bytes();
            }
            self.comm.model_comm().broadcast(&mut header, root)?;
            let count = u64::from_le_bytes(header) as usize;

            let tile_bytes = height * count * std::mem::size_of::<DataType>();
            let mut bytes = vec![0u8; tile_bytes];
            if rank_in_model == root {
                bytes.clear();
                for v in mat.cols(0..count).iter() {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                self.comm.add_bytes_sent(tile_bytes);
            }
            self.comm.model_comm().broadcast(&mut bytes, root)?;
            if rank_in_model != root {
                self.comm.add_bytes_received(tile_bytes);
            }

            let mut tile = Mat::zeros(height, count);
            tile.copy_from_bytes(&bytes);
            circ.place_block(&tile, count);

            root = (root + 1) % npr;
        }

        self.root = root;
        self.local_data_valid = false;
        debug!(
            filled_cols = circ.filled_cols(),
            next_root = self.root,
            "minibatch assembled"
        );
        Ok(())
    }

    /// Advance this rank's reader past the minibatch that just finished.
    /// Returns whether more minibatches remain locally; an exhausted
    /// reader marks itself done for [`Self::is_data_set_processed`].
    pub fn update_reader(&mut self) -> Result<bool> {
        if self.comm.rank_in_model() >= self.num_parallel_readers() || self.local_reader_done {
            return Ok(false);
        }
        let mode = self.mode;
        let reader = self.readers.get_mut(&mode).ok_or_else(|| {
            CohortError::MissingConfiguration(format!("no data reader registered for {:?}", mode))
        })?;
        let more = reader.update();
        if !more {
            self.local_reader_done = true;
        }
        Ok(more)
    }

    /// Collective over the model: true once every reader of this phase
    /// has walked off the end of its epoch. Resets the rotation for the
    /// next epoch.
    pub fn is_data_set_processed(&mut self) -> Result<bool> {
        let mut done_flags = [self.local_reader_done as u64];
        self.comm.model_comm().allreduce_sum_u64(&mut done_flags)?;
        let done = done_flags[0] as usize == self.num_parallel_readers();
        if done {
            self.local_reader_done = false;
            self.local_data_valid = false;
            self.root = 0;
        }
        Ok(done)
    }

    fn iteration_plan(
        comm: &Communicator,
        batch: usize,
        npr: usize,
        total: usize,
    ) -> IterationPlan {
        let rank_in_model = comm.rank_in_model();
        let num_models = comm.num_models();
        let stride = (num_models * npr.max(1) * batch).max(1);
        let base_offset = rank_in_model * num_models * batch;
        let model_offset = comm.model_rank() * batch;
        let first_pos = base_offset + model_offset;

        let (num_mini_batches, last_mini_batch_size) =
            if rank_in_model >= npr || first_pos >= total {
                (0, batch)
            } else {
                let num_mini_batches = (total - first_pos).div_ceil(stride);
                let last_start = first_pos + (num_mini_batches - 1) * stride;
                (num_mini_batches, batch.min(total - last_start))
            };

        IterationPlan {
            base_offset,
            model_offset,
            stride,
            num_mini_batches,
            last_mini_batch_size,
        }
    }

    fn apply_plan(core: &mut ReaderCore, plan: &IterationPlan, batch: usize, comm: &Communicator) {
        core.set_batch_size(batch);
        core.set_num_mini_batches_per_reader(plan.num_mini_batches);
        core.set_last_mini_batch_size(plan.last_mini_batch_size);
        core.setup(
            plan.base_offset,
            plan.stride,
            1,
            plan.model_offset,
            Some(comm),
        );
    }

    /// Derive this rank's minibatch plan for `mode` and wire it into an
    /// externally owned reader core: leapfrogging readers stride
    /// `num_models × readers × batch` through the shared index space, and
    /// the rank landing on the ragged tail gets the alternate last
    /// minibatch size.
    pub fn calculate_num_iterations_per_epoch(&self, mode: ExecutionMode, core: &mut ReaderCore) {
        let batch = self.max_mini_batch_size;
        let plan = Self::iteration_plan(
            &self.comm,
            batch,
            self.num_parallel_readers_for(mode),
            core.num_samples(),
        );
        Self::apply_plan(core, &plan, batch, &self.comm);
    }

    /// [`Self::calculate_num_iterations_per_epoch`] for the registered
    /// reader of `mode`.
    pub fn setup_reader(&mut self, mode: ExecutionMode) -> Result<()> {
        let comm = self.comm.clone();
        let batch = self.max_mini_batch_size;
        let npr = self.num_parallel_readers_for(mode);
        let reader = self.readers.get_mut(&mode).ok_or_else(|| {
            CohortError::MissingConfiguration(format!("no data reader registered for {:?}", mode))
        })?;
        let core = reader.core_mut();
        let plan = Self::iteration_plan(&comm, batch, npr, core.num_samples());
        Self::apply_plan(core, &plan, batch, &comm);
        Ok(())
    }
}
