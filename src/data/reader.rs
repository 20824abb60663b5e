//! Shuffled sample scheduling shared by every data reader.
//!
//! Format-specific readers (image, text, …) implement [`DataReader`] and
//! delegate bookkeeping to an embedded [`ReaderCore`]: the shuffled index
//! vector, the per-epoch position, the ragged last minibatch, and the
//! validation hold-out split all live here.

use crate::comm::Communicator;
use crate::data::ExecutionMode;
use crate::mat::Mat;
use crate::utils::config::ReaderConfig;
use crate::utils::error::{CohortError, Result};
use rand::seq::SliceRandom;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

/// Mixes the epoch into the configured seed so each reshuffle draws a
/// fresh but reproducible permutation.
const EPOCH_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Index and position state for one data reader.
///
/// `shuffled_indices` is the working sample set; `unused_indices` holds
/// the carved-off validation samples. The two never overlap. Positions
/// advance by `batch_stride` per minibatch, switching to
/// `last_mini_batch_stride` when the minibatch about to finish is the
/// penultimate one of the reader's epoch.
#[derive(Debug, Clone)]
pub struct ReaderCore {
    name: String,
    config: ReaderConfig,
    shuffled_indices: Vec<i32>,
    unused_indices: Vec<i32>,
    batch_size: usize,
    base_offset: usize,
    model_offset: usize,
    batch_stride: usize,
    sample_stride: usize,
    last_mini_batch_stride: usize,
    last_mini_batch_size: usize,
    current_pos: usize,
    current_mini_batch_idx: usize,
    num_mini_batches_per_reader: usize,
    use_alt_last_mini_batch_size: bool,
    epoch: u64,
}

impl ReaderCore {
    pub fn new(name: impl Into<String>, config: ReaderConfig) -> Self {
        let batch_size = config.batch_size;
        Self {
            name: name.into(),
            config,
            shuffled_indices: Vec::new(),
            unused_indices: Vec::new(),
            batch_size,
            base_offset: 0,
            model_offset: 0,
            batch_stride: batch_size,
            sample_stride: 1,
            last_mini_batch_stride: batch_size,
            last_mini_batch_size: batch_size,
            current_pos: 0,
            current_mini_batch_idx: 0,
            num_mini_batches_per_reader: 0,
            use_alt_last_mini_batch_size: false,
            epoch: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Working sample count.
    pub fn num_samples(&self) -> usize {
        self.shuffled_indices.len()
    }

    /// Populate the working set with indices `0..n`, in order.
    pub fn init_indices(&mut self, n: usize) {
        self.shuffled_indices = (0..n as i32).collect();
        self.unused_indices.clear();
    }

    pub fn set_indices(&mut self, indices: Vec<i32>) {
        self.shuffled_indices = indices;
    }

    pub fn indices(&self) -> &[i32] {
        &self.shuffled_indices
    }

    pub fn unused_indices(&self) -> &[i32] {
        &self.unused_indices
    }

    pub fn current_pos(&self) -> usize {
        self.current_pos
    }

    pub fn current_mini_batch_idx(&self) -> usize {
        self.current_mini_batch_idx
    }

    pub fn num_mini_batches_per_reader(&self) -> usize {
        self.num_mini_batches_per_reader
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size;
    }

    pub fn set_last_mini_batch_size(&mut self, size: usize) {
        self.last_mini_batch_size = size;
    }

    pub fn set_last_mini_batch_stride(&mut self, stride: usize) {
        self.last_mini_batch_stride = stride;
    }

    pub fn set_num_mini_batches_per_reader(&mut self, n: usize) {
        self.num_mini_batches_per_reader = n;
    }

    fn shuffle_rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(
            self.config
                .shuffle_seed
                .wrapping_add(self.epoch.wrapping_mul(EPOCH_SEED_STRIDE)),
        )
    }

    fn reshuffle(&mut self) {
        let mut rng = self.shuffle_rng();
        self.shuffled_indices.shuffle(&mut rng);
    }

    /// Initialize the per-epoch counters and strides. With `comm`
    /// (distributed mode) the preconfigured `num_mini_batches_per_reader`
    /// is authoritative and the alternate tail size is honored; without
    /// it the reader plans to walk the whole data set alone.
    pub fn setup(
        &mut self,
        base_offset: usize,
        batch_stride: usize,
        sample_stride: usize,
        model_offset: usize,
        comm: Option<&Communicator>,
    ) {
        self.base_offset = base_offset;
        self.model_offset = model_offset;
        self.batch_stride = batch_stride;
        self.sample_stride = sample_stride;
        self.last_mini_batch_stride = batch_stride;
        self.current_mini_batch_idx = 0;

        if let Some(comm) = comm {
            self.use_alt_last_mini_batch_size = true;
            debug!(
                reader = %self.name,
                model_rank = comm.model_rank(),
                rank_in_model = comm.rank_in_model(),
                num_mini_batches = self.num_mini_batches_per_reader,
                "reader set up for distributed minibatches"
            );
        } else {
            self.num_mini_batches_per_reader =
                self.num_samples().div_ceil(self.batch_size.max(1));
        }

        self.current_pos = self.base_offset + self.model_offset;
        if !self.config.first_n {
            self.reshuffle();
        }
    }

    /// Single-reader setup over the full data set.
    pub fn setup_default(&mut self) {
        self.setup(0, self.batch_size, 1, 0, None);
    }

    /// Advance past the minibatch that just finished. Returns `true`
    /// while more minibatches remain in this epoch; on epoch wrap the
    /// indices reshuffle (unless `first_n`) and position and minibatch
    /// index reset.
    pub fn update(&mut self) -> bool {
        if self.use_alt_last_mini_batch_size
            && self.current_mini_batch_idx + 1 >= self.num_mini_batches_per_reader.saturating_sub(1)
        {
            self.current_pos += self.last_mini_batch_stride;
        } else {
            self.current_pos += self.batch_stride;
        }

        if self.current_pos < self.shuffled_indices.len() {
            self.current_mini_batch_idx += 1;
            true
        } else {
            self.epoch += 1;
            if !self.config.first_n {
                self.reshuffle();
            }
            self.current_mini_batch_idx = 0;
            self.current_pos = self.base_offset + self.model_offset;
            false
        }
    }

    /// Size of the minibatch at the current position: the alternate tail
    /// size at or past the reader's last minibatch, the configured batch
    /// size before it.
    pub fn current_batch_size(&self) -> usize {
        if self.use_alt_last_mini_batch_size
            && self.current_mini_batch_idx >= self.num_mini_batches_per_reader.saturating_sub(1)
        {
            self.last_mini_batch_size
        } else {
            self.batch_size
        }
    }

    /// Position the next `update` will move to.
    pub fn next_position(&self) -> usize {
        if self.use_alt_last_mini_batch_size
            && self.current_mini_batch_idx + 1 >= self.num_mini_batches_per_reader.saturating_sub(1)
        {
            self.current_pos + self.last_mini_batch_stride
        } else {
            self.current_pos + self.batch_stride
        }
    }

    /// Sample indices of the current minibatch, honoring the sample
    /// stride. Clipped to the end of the working set.
    pub fn fetch_indices(&self) -> Vec<i32> {
        let size = self.current_batch_size();
        (0..size)
            .map(|k| self.current_pos + k * self.sample_stride)
            .take_while(|&pos| pos < self.shuffled_indices.len())
            .map(|pos| self.shuffled_indices[pos])
            .collect()
    }

    /// Reduce the working set: truncate to `max_sample_count` or
    /// `use_percent` of the data, then carve the validation hold-out out
    /// of what remains. Both vectors re-sort afterwards unless `first_n`
    /// keeps the original order.
    pub fn select_subset_of_data(&mut self) -> Result<()> {
        if !self.config.first_n {
            self.reshuffle();
        }

        if self.config.max_sample_count.is_none()
            && self.config.use_percent.is_none()
            && self.config.validation_percent.is_none()
        {
            return Ok(());
        }

        let total = self.num_samples();
        if let Some(count) = self.config.max_sample_count {
            if count > total {
                return Err(CohortError::SubsetTooLarge(format!(
                    "max_sample_count {} exceeds data set size {}",
                    count, total
                )));
            }
            self.shuffled_indices.truncate(count);
        } else if let Some(percent) = self.config.use_percent {
            validate_percent(percent)?;
            self.shuffled_indices
                .truncate((percent * total as f64) as usize);
        }

        if let Some(percent) = self.config.validation_percent {
            validate_percent(percent)?;
            let pool = self.num_samples();
            let unused = (percent * pool as f64) as usize;
            if unused > 0 {
                self.unused_indices = self.shuffled_indices.split_off(pool - unused);
            }
        }

        if !self.config.first_n {
            self.shuffled_indices.sort_unstable();
            self.unused_indices.sort_unstable();
        }
        Ok(())
    }

    /// Swap the validation hold-out in as the working set, releasing the
    /// old working set's storage.
    pub fn use_unused_index_set(&mut self) {
        std::mem::swap(&mut self.shuffled_indices, &mut self.unused_indices);
        self.unused_indices = Vec::new();
    }

    // Configuration accessors. The filename accessors fail rather than
    // hand back an empty path a reader would then try to open.

    pub fn set_file_dir(&mut self, dir: impl Into<String>) {
        self.config.file_dir = Some(dir.into());
    }

    pub fn file_dir(&self) -> Result<&str> {
        self.config
            .file_dir
            .as_deref()
            .ok_or_else(|| CohortError::MissingConfiguration("file_dir was never set".into()))
    }

    pub fn set_data_filename(&mut self, name: impl Into<String>) {
        self.config.data_filename = Some(name.into());
    }

    pub fn data_filename(&self) -> Result<&str> {
        self.config.data_filename.as_deref().ok_or_else(|| {
            CohortError::MissingConfiguration("data_filename was never set".into())
        })
    }

    pub fn set_label_filename(&mut self, name: impl Into<String>) {
        self.config.label_filename = Some(name.into());
    }

    pub fn label_filename(&self) -> Result<&str> {
        self.config.label_filename.as_deref().ok_or_else(|| {
            CohortError::MissingConfiguration("label_filename was never set".into())
        })
    }

    pub fn set_max_sample_count(&mut self, count: usize) {
        self.config.max_sample_count = Some(count);
    }

    pub fn set_first_n(&mut self, first_n: bool) {
        self.config.first_n = first_n;
    }

    pub fn first_n(&self) -> bool {
        self.config.first_n
    }

    pub fn set_use_percent(&mut self, percent: f64) -> Result<()> {
        validate_percent(percent)?;
        self.config.use_percent = Some(percent);
        Ok(())
    }

    pub fn use_percent(&self) -> Result<f64> {
        self.config.use_percent.ok_or_else(|| {
            CohortError::MissingConfiguration("use_percent was never set".into())
        })
    }

    pub fn set_validation_percent(&mut self, percent: f64) -> Result<()> {
        validate_percent(percent)?;
        self.config.validation_percent = Some(percent);
        Ok(())
    }

    pub fn validation_percent(&self) -> Option<f64> {
        self.config.validation_percent
    }

    // Checkpoint restore plumbing; the checkpoint module drives these.

    pub(crate) fn restore_position(&mut self, pos: usize, mini_batch_idx: usize) {
        self.current_pos = pos;
        self.current_mini_batch_idx = mini_batch_idx;
    }

    pub(crate) fn resize_indices(&mut self, n: usize) {
        self.shuffled_indices.resize(n, 0);
    }

    pub(crate) fn indices_mut(&mut self) -> &mut [i32] {
        &mut self.shuffled_indices
    }
}

fn validate_percent(percent: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&percent) {
        return Err(CohortError::InvalidPercent(percent));
    }
    Ok(())
}

/// One source of samples, implemented per storage format. The core
/// schedules; `fetch_batch` pulls the scheduled samples into the columns
/// of the staging matrix and returns how many it placed.
pub trait DataReader {
    fn core(&self) -> &ReaderCore;
    fn core_mut(&mut self) -> &mut ReaderCore;

    fn mode(&self) -> ExecutionMode;

    fn num_samples(&self) -> usize {
        self.core().num_samples()
    }

    fn fetch_batch(&mut self, mat: &mut Mat) -> Result<usize>;

    fn update(&mut self) -> bool {
        self.core_mut().update()
    }

    fn name(&self) -> String {
        self.core().name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_with(n: usize, config: ReaderConfig) -> ReaderCore {
        let mut core = ReaderCore::new("test", config);
        core.init_indices(n);
        core
    }

    fn distributed_core(n: usize, batch: usize, nmb: usize, last: usize) -> ReaderCore {
        let config = ReaderConfig {
            batch_size: batch,
            first_n: true,
            ..Default::default()
        };
        let mut core = core_with(n, config);
        core.set_num_mini_batches_per_reader(nmb);
        core.set_last_mini_batch_size(last);
        core
    }

    #[test]
    fn epoch_with_ragged_tail() {
        // 23 samples, batch 10, tail of 3 over 3 minibatches.
        let mut core = distributed_core(23, 10, 3, 3);
        core.setup(0, 10, 1, 0, None);
        core.use_alt_last_mini_batch_size = true;

        let mut consumed = 0;
        let mut updates = Vec::new();
        for _ in 0..3 {
            consumed += core.current_batch_size();
            updates.push(core.update());
        }
        assert_eq!(consumed, 23);
        assert_eq!(updates, vec![true, true, false]);

        // Epoch wrap resets the walk.
        assert_eq!(core.current_pos(), 0);
        assert_eq!(core.current_mini_batch_idx(), 0);
        assert_eq!(core.current_batch_size(), 10);
    }

    #[test]
    fn update_without_tail() {
        let config = ReaderConfig {
            batch_size: 5,
            first_n: true,
            ..Default::default()
        };
        let mut core = core_with(20, config);
        core.setup_default();
        assert_eq!(core.num_mini_batches_per_reader(), 4);

        let mut seen = 0;
        loop {
            seen += core.current_batch_size();
            if !core.update() {
                break;
            }
        }
        assert_eq!(seen, 20);
    }

    #[test]
    fn subset_selection_truncates_then_splits() {
        let config = ReaderConfig {
            batch_size: 10,
            use_percent: Some(0.5),
            validation_percent: Some(0.2),
            ..Default::default()
        };
        let mut core = core_with(100, config);
        core.select_subset_of_data().unwrap();

        // 100 -> 50 via use_percent, then 20% of the 50 held out.
        assert_eq!(core.num_samples(), 40);
        assert_eq!(core.unused_indices().len(), 10);

        // Disjoint and sorted after the re-sort.
        for pair in core.indices().windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for idx in core.unused_indices() {
            assert!(!core.indices().contains(idx));
        }
    }

    #[test]
    fn subset_selection_rejects_oversized_count() {
        let config = ReaderConfig {
            batch_size: 10,
            max_sample_count: Some(101),
            ..Default::default()
        };
        let mut core = core_with(100, config);
        let err = core.select_subset_of_data().unwrap_err();
        assert!(matches!(err, CohortError::SubsetTooLarge(_)));
    }

    #[test]
    fn first_n_keeps_order() {
        let config = ReaderConfig {
            batch_size: 4,
            first_n: true,
            max_sample_count: Some(6),
            ..Default::default()
        };
        let mut core = core_with(10, config);
        core.select_subset_of_data().unwrap();
        assert_eq!(core.indices(), &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn swap_in_validation_set() {
        let config = ReaderConfig {
            batch_size: 10,
            validation_percent: Some(0.3),
            ..Default::default()
        };
        let mut core = core_with(10, config);
        core.select_subset_of_data().unwrap();
        let holdout: Vec<i32> = core.unused_indices().to_vec();
        assert_eq!(holdout.len(), 3);

        core.use_unused_index_set();
        assert_eq!(core.indices(), holdout.as_slice());
        assert!(core.unused_indices().is_empty());
    }

    #[test]
    fn shuffle_is_deterministic_per_seed_and_epoch() {
        let config = ReaderConfig {
            batch_size: 4,
            shuffle_seed: 42,
            ..Default::default()
        };
        let mut a = core_with(32, config.clone());
        let mut b = core_with(32, config);
        a.setup_default();
        b.setup_default();
        assert_eq!(a.indices(), b.indices());

        // Run both through an epoch wrap; the reshuffle stays aligned
        // and differs from the epoch-zero order.
        let before = a.indices().to_vec();
        while a.update() {}
        while b.update() {}
        assert_eq!(a.indices(), b.indices());
        assert_ne!(a.indices(), before.as_slice());
    }

    #[test]
    fn percent_setters_validate_range() {
        let mut core = core_with(10, ReaderConfig::default());
        assert!(core.set_use_percent(1.5).is_err());
        assert!(core.set_validation_percent(-0.1).is_err());
        assert!(core.set_use_percent(0.5).is_ok());
        assert!(matches!(
            core.label_filename(),
            Err(CohortError::MissingConfiguration(_))
        ));
    }

    #[test]
    fn fetch_indices_respects_stride_and_clip() {
        let config = ReaderConfig {
            batch_size: 4,
            first_n: true,
            ..Default::default()
        };
        let mut core = core_with(10, config);
        core.setup(0, 8, 2, 0, None);
        assert_eq!(core.fetch_indices(), vec![0, 2, 4, 6]);

        core.update();
        // Position 8, stride 2: only 8 remains in range.
        assert_eq!(core.fetch_indices(), vec![8]);
    }
}
