use cohort::transport::local::LocalWorld;
use cohort::utils::config::ReaderConfig;
use cohort::{
    CircMat, CohortError, Communicator, DataReader, DistributedMinibatch, ExecutionMode, Mat,
    MatrixData, ReaderCore, Result,
};
use std::collections::HashMap;
use std::rc::Rc;

/// Reader whose sample value is its index, so assembled minibatches are
/// easy to check.
struct StubReader {
    core: ReaderCore,
    fail: bool,
}

impl StubReader {
    fn new(num_samples: usize, batch_size: usize) -> Self {
        let config = ReaderConfig {
            batch_size,
            first_n: true,
            ..Default::default()
        };
        let mut core = ReaderCore::new("stub", config);
        core.init_indices(num_samples);
        Self { core, fail: false }
    }
}

impl DataReader for StubReader {
    fn core(&self) -> &ReaderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReaderCore {
        &mut self.core
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Training
    }

    fn fetch_batch(&mut self, mat: &mut Mat) -> Result<usize> {
        if self.fail {
            return Err(CohortError::Config("simulated corrupt sample".into()));
        }
        let indices = self.core.fetch_indices();
        for (col, &idx) in indices.iter().enumerate() {
            for row in 0..mat.height() {
                mat.set(row, col, idx as f32);
            }
        }
        Ok(indices.len())
    }
}

fn coordinator(
    comm: &Rc<Communicator>,
    num_samples: usize,
    batch_size: usize,
    requested_readers: usize,
) -> DistributedMinibatch {
    let mut readers: HashMap<ExecutionMode, Box<dyn DataReader>> = HashMap::new();
    readers.insert(
        ExecutionMode::Training,
        Box::new(StubReader::new(num_samples, batch_size)),
    );
    let mut io = DistributedMinibatch::new(comm.clone(), requested_readers, batch_size, readers);
    io.setup_reader(ExecutionMode::Training).unwrap();
    io
}

#[test]
fn two_readers_assemble_ordered_minibatch() {
    LocalWorld::run(4, |t| {
        let comm = Rc::new(Communicator::new(t, 4).unwrap());
        let mut io = coordinator(&comm, 10, 2, 2);
        assert_eq!(io.num_parallel_readers(), 2);

        let mut local = Mat::zeros(3, 2);
        let fetched = io.fetch_to_local_matrix(&mut local).unwrap();
        match comm.rank_in_model() {
            0 | 1 => assert_eq!(fetched, 2),
            _ => assert_eq!(fetched, 0),
        }
        assert_eq!(io.num_valid_readers(), 2);

        let mut circ = CircMat::zeros(3, 4, comm.procs_per_model());
        io.distribute_from_local_matrix(&local, &mut circ).unwrap();

        // Reader 0 contributed samples 0..2, reader 1 samples 2..4.
        assert_eq!(circ.filled_cols(), 4);
        for col in 0..4 {
            assert_eq!(circ.local().get(0, col), col as f32);
            assert_eq!(circ.local().get(2, col), col as f32);
        }
    });
}

#[test]
fn epoch_walk_covers_every_sample_once() {
    LocalWorld::run(2, |t| {
        let comm = Rc::new(Communicator::new(t, 2).unwrap());
        let mut io = coordinator(&comm, 10, 2, 2);

        let mut seen = Vec::new();
        let mut guard = 0;
        loop {
            let mut local = Mat::zeros(1, 2);
            io.fetch_to_local_matrix(&mut local).unwrap();
            let mut circ = CircMat::zeros(1, 4, comm.procs_per_model());
            io.distribute_from_local_matrix(&local, &mut circ).unwrap();
            for col in 0..circ.filled_cols() {
                seen.push(circ.local().get(0, col) as i32);
            }
            io.update_reader().unwrap();
            if io.is_data_set_processed().unwrap() {
                break;
            }
            guard += 1;
            assert!(guard < 20, "epoch never completed");
        }

        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<i32>>());
    });
}

#[test]
fn models_consume_disjoint_shards() {
    LocalWorld::run(4, |t| {
        // Two models of two ranks, one reader each.
        let comm = Rc::new(Communicator::new(t, 2).unwrap());
        let mut io = coordinator(&comm, 10, 2, 1);

        let mut local = Mat::zeros(1, 2);
        io.fetch_to_local_matrix(&mut local).unwrap();
        let mut circ = CircMat::zeros(1, 2, comm.procs_per_model());
        io.distribute_from_local_matrix(&local, &mut circ).unwrap();

        let expected = (comm.model_rank() * 2) as f32;
        assert_eq!(circ.local().get(0, 0), expected);
        assert_eq!(circ.local().get(0, 1), expected + 1.0);
    });
}

#[test]
fn single_failed_reader_is_excluded_from_rotation() {
    LocalWorld::run(4, |t| {
        let comm = Rc::new(Communicator::new(t, 4).unwrap());
        let mut readers: HashMap<ExecutionMode, Box<dyn DataReader>> = HashMap::new();
        let mut reader = StubReader::new(12, 2);
        reader.fail = comm.rank_in_model() == 1;
        readers.insert(ExecutionMode::Training, Box::new(reader));
        let mut io = DistributedMinibatch::new(comm.clone(), 3, 2, readers);
        io.setup_reader(ExecutionMode::Training).unwrap();

        let mut local = Mat::zeros(1, 2);
        io.fetch_to_local_matrix(&mut local).unwrap();
        assert_eq!(io.num_valid_readers(), 2);

        let mut circ = CircMat::zeros(1, 6, comm.procs_per_model());
        io.distribute_from_local_matrix(&local, &mut circ).unwrap();

        // Readers 0 and 2 contribute their shards; the failed reader's
        // block is skipped entirely.
        assert_eq!(circ.filled_cols(), 4);
        let values: Vec<f32> = (0..4).map(|c| circ.local().get(0, c)).collect();
        assert_eq!(values, vec![0.0, 1.0, 4.0, 5.0]);
    });
}

#[test]
fn failed_majority_aborts_the_step() {
    LocalWorld::run(2, |t| {
        let comm = Rc::new(Communicator::new(t, 2).unwrap());
        let mut readers: HashMap<ExecutionMode, Box<dyn DataReader>> = HashMap::new();
        let mut reader = StubReader::new(10, 2);
        reader.fail = true;
        readers.insert(ExecutionMode::Training, Box::new(reader));
        let mut io = DistributedMinibatch::new(comm.clone(), 2, 2, readers);
        io.setup_reader(ExecutionMode::Training).unwrap();

        let mut local = Mat::zeros(1, 2);
        let err = io.fetch_to_local_matrix(&mut local).unwrap_err();
        assert!(matches!(err, CohortError::InsufficientReaders(_)));
    });
}

#[test]
fn reader_count_capped_by_data_and_model() {
    LocalWorld::run(4, |t| {
        let comm = Rc::new(Communicator::new(t, 4).unwrap());
        let io = coordinator(&comm, 10, 2, 2);

        // Requested 8 readers but only 4 ranks in the model.
        assert_eq!(io.compute_max_num_parallel_readers(10, 2, 8), 4);
        // Three samples at batch size 2 keep two readers busy at most.
        assert_eq!(io.compute_max_num_parallel_readers(3, 2, 8), 2);
        assert_eq!(io.compute_max_num_parallel_readers(100, 10, 3), 3);
    });
}

#[test]
fn root_rotates_across_distributions() {
    LocalWorld::run(2, |t| {
        let comm = Rc::new(Communicator::new(t, 2).unwrap());
        let mut io = coordinator(&comm, 16, 2, 2);
        assert!(comm.rank_in_model() != 0 || io.is_current_root());

        let mut local = Mat::zeros(1, 2);
        io.fetch_to_local_matrix(&mut local).unwrap();
        let mut circ = CircMat::zeros(1, 4, comm.procs_per_model());
        io.distribute_from_local_matrix(&local, &mut circ).unwrap();

        // Two full rotations land the pointer back on reader 0.
        assert!(comm.rank_in_model() != 0 || io.is_current_root());
    });
}
