//! Dense matrices used to stage minibatches and gradients.
//!
//! Columns are samples. `Mat` is a plain local matrix; `CircMat` is the
//! staging matrix assembled from parallel readers, whose columns are laid
//! out cyclically across the ranks of a model (column `j` is owned by rank
//! `j % nprocs`).

use ndarray::{s, Array2, ArrayView2, ArrayViewMut2};
use std::ops::Range;

/// Element type for all staged data.
pub type DataType = f32;

/// Local dense matrix, `height` rows by `width` columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Mat {
    data: Array2<DataType>,
}

impl Mat {
    pub fn zeros(height: usize, width: usize) -> Self {
        Self {
            data: Array2::zeros((height, width)),
        }
    }

    pub fn from_array(data: Array2<DataType>) -> Self {
        Self { data }
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn get(&self, row: usize, col: usize) -> DataType {
        self.data[(row, col)]
    }

    pub fn set(&mut self, row: usize, col: usize, value: DataType) {
        self.data[(row, col)] = value;
    }

    pub fn fill(&mut self, value: DataType) {
        self.data.fill(value);
    }

    /// View of the column range `cols`.
    pub fn cols(&self, cols: Range<usize>) -> ArrayView2<'_, DataType> {
        self.data.slice(s![.., cols])
    }

    /// View of the given row and column ranges.
    pub fn slice(&self, rows: Range<usize>, cols: Range<usize>) -> ArrayView2<'_, DataType> {
        self.data.slice(s![rows, cols])
    }

    /// Mutable view of the given row and column ranges.
    pub fn slice_mut(
        &mut self,
        rows: Range<usize>,
        cols: Range<usize>,
    ) -> ArrayViewMut2<'_, DataType> {
        self.data.slice_mut(s![rows, cols])
    }

    /// Mutable view of the column range `cols`.
    pub fn cols_mut(&mut self, cols: Range<usize>) -> ArrayViewMut2<'_, DataType> {
        self.data.slice_mut(s![.., cols])
    }

    pub fn view(&self) -> ArrayView2<'_, DataType> {
        self.data.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMut2<'_, DataType> {
        self.data.view_mut()
    }

    /// Number of elements in the matrix.
    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    /// Serialize the whole matrix to little-endian bytes, row-major.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.element_count() * std::mem::size_of::<DataType>());
        for v in self.data.iter() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Overwrite the matrix from bytes produced by [`Mat::to_bytes`].
    /// The byte count must match the matrix shape exactly.
    pub fn copy_from_bytes(&mut self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.element_count() * std::mem::size_of::<DataType>());
        for (v, chunk) in self
            .data
            .iter_mut()
            .zip(bytes.chunks_exact(std::mem::size_of::<DataType>()))
        {
            *v = DataType::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }
}

/// Anything the communicator facade can move: a local matrix or the local
/// tile of a distributed one. Byte accounting uses local dimensions.
pub trait MatrixData {
    fn local_height(&self) -> usize;
    fn local_width(&self) -> usize;
    fn local(&self) -> &Mat;
    fn local_mut(&mut self) -> &mut Mat;

    fn local_element_count(&self) -> usize {
        self.local_height() * self.local_width()
    }

    fn local_byte_count(&self) -> usize {
        self.local_element_count() * std::mem::size_of::<DataType>()
    }
}

impl MatrixData for Mat {
    fn local_height(&self) -> usize {
        self.height()
    }

    fn local_width(&self) -> usize {
        self.width()
    }

    fn local(&self) -> &Mat {
        self
    }

    fn local_mut(&mut self) -> &mut Mat {
        self
    }
}

/// Minibatch staging matrix with a column-cyclic ownership map.
///
/// Every rank of the model holds the full assembled matrix after
/// distribution; the cyclic map records which rank owns which column for
/// the consuming layer. Column blocks are appended in reader order as the
/// rotation progresses.
#[derive(Debug, Clone)]
pub struct CircMat {
    local: Mat,
    grid_size: usize,
    filled_cols: usize,
}

impl CircMat {
    /// `grid_size` is the number of ranks in the owning model.
    pub fn zeros(height: usize, width: usize, grid_size: usize) -> Self {
        Self {
            local: Mat::zeros(height, width),
            grid_size,
            filled_cols: 0,
        }
    }

    pub fn grid_size(&self) -> usize {
        self.grid_size
    }

    /// Rank owning column `col` under the cyclic distribution.
    pub fn owner_of_col(&self, col: usize) -> usize {
        col % self.grid_size
    }

    /// Columns assembled so far in the current minibatch.
    pub fn filled_cols(&self) -> usize {
        self.filled_cols
    }

    /// Forget the assembled columns so the next minibatch starts fresh.
    pub fn reset(&mut self) {
        self.filled_cols = 0;
    }

    /// Append `count` columns from the first `count` columns of `tile` at
    /// the current fill position. Panics if the block does not fit; callers
    /// size the staging matrix for the maximum minibatch.
    pub fn place_block(&mut self, tile: &Mat, count: usize) {
        assert!(self.filled_cols + count <= self.local.width());
        let start = self.filled_cols;
        self.local
            .cols_mut(start..start + count)
            .assign(&tile.cols(0..count));
        self.filled_cols += count;
    }
}

impl MatrixData for CircMat {
    fn local_height(&self) -> usize {
        self.local.height()
    }

    fn local_width(&self) -> usize {
        self.local.width()
    }

    fn local(&self) -> &Mat {
        &self.local
    }

    fn local_mut(&mut self) -> &mut Mat {
        &mut self.local
    }
}
