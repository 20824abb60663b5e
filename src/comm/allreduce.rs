//! Transform-aware allreduce across model replicas.
//!
//! Payloads pass through a caller-supplied [`AllreduceTransform`] before
//! the wire and after it, so quantized or sparsified encodings slot in
//! without touching the reduction skeleton. Two algorithms carry the
//! traffic: recursive doubling for a power-of-two replica count with
//! small matrices, and a pairwise-exchange ring otherwise. A plain ring
//! variant is kept as an experimental alternative; the dispatcher never
//! selects it.

use super::Communicator;
use crate::mat::{DataType, Mat};
use crate::transport::Transport;
use crate::utils::error::{CohortError, Result};
use ndarray::ArrayViewMut2;
use std::ops::Range;
use std::sync::Arc;

/// Tag for allreduce pairwise exchanges; keeps them out of the facade's
/// point-to-point stream.
const TAG_ALLREDUCE: u64 = 1;

/// Encoder/decoder pair threaded through the allreduce skeleton.
///
/// `encode` borrows its output from transform-owned scratch, so steady
/// state makes no allocations. The decode half comes in two forms: into
/// an empty destination, or reducing into already-accumulated data with
/// the transform's own arithmetic. The reduction must be associative for
/// the allreduce result to be rank-independent.
pub trait AllreduceTransform {
    /// Serialize the `rows` × `cols` slice of `mat`. `is_partial` marks
    /// reduce-scatter chunks as opposed to whole-slice payloads.
    fn encode(
        &mut self,
        mat: &Mat,
        rows: Range<usize>,
        cols: Range<usize>,
        is_partial: bool,
    ) -> Result<&[u8]>;

    /// Decode `bytes` into an empty destination slice; returns the
    /// number of bytes consumed.
    fn decode(&mut self, bytes: &[u8], view: &mut ArrayViewMut2<'_, DataType>) -> Result<usize>;

    /// Decode `bytes` and reduce into an existing slice; returns the
    /// number of bytes consumed.
    fn decode_apply(
        &mut self,
        bytes: &[u8],
        view: &mut ArrayViewMut2<'_, DataType>,
    ) -> Result<usize>;
}

/// Raw little-endian f32 payloads with elementwise SUM.
#[derive(Default)]
pub struct IdentityTransform {
    scratch: Vec<u8>,
}

impl IdentityTransform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AllreduceTransform for IdentityTransform {
    fn encode(
        &mut self,
        mat: &Mat,
        rows: Range<usize>,
        cols: Range<usize>,
        _is_partial: bool,
    ) -> Result<&[u8]> {
        self.scratch.clear();
        for v in mat.slice(rows, cols).iter() {
            self.scratch.extend_from_slice(&v.to_le_bytes());
        }
        Ok(&self.scratch)
    }

    fn decode(&mut self, bytes: &[u8], view: &mut ArrayViewMut2<'_, DataType>) -> Result<usize> {
        let needed = view.len() * std::mem::size_of::<DataType>();
        if bytes.len() < needed {
            return Err(CohortError::Transport(format!(
                "encoded payload of {} bytes for a slice of {}",
                bytes.len(),
                needed
            )));
        }
        for (dst, chunk) in view.iter_mut().zip(bytes.chunks_exact(4)) {
            *dst = DataType::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(needed)
    }

    fn decode_apply(
        &mut self,
        bytes: &[u8],
        view: &mut ArrayViewMut2<'_, DataType>,
    ) -> Result<usize> {
        let needed = view.len() * std::mem::size_of::<DataType>();
        if bytes.len() < needed {
            return Err(CohortError::Transport(format!(
                "encoded payload of {} bytes for a slice of {}",
                bytes.len(),
                needed
            )));
        }
        for (dst, chunk) in view.iter_mut().zip(bytes.chunks_exact(4)) {
            *dst += DataType::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(needed)
    }
}

/// Column slice boundaries for a ring over `nprocs` ranks: the remainder
/// of `width / nprocs` is spread over the lowest ranks.
fn column_slices(width: usize, nprocs: usize) -> (Vec<usize>, Vec<usize>) {
    let per_proc = width / nprocs;
    let remainder = width % nprocs;
    let mut lengths = vec![per_proc; nprocs];
    for length in lengths.iter_mut().take(remainder) {
        *length += 1;
    }
    let mut ends = vec![0usize; nprocs];
    let mut acc = 0;
    for (end, length) in ends.iter_mut().zip(&lengths) {
        acc += length;
        *end = acc;
    }
    (lengths, ends)
}

impl Communicator {
    /// Reduce `mat` elementwise across model replicas through the given
    /// transform. `max_recv_count` bounds the encoded size of any single
    /// exchanged payload.
    pub fn intermodel_allreduce(
        &self,
        mat: &mut Mat,
        max_recv_count: usize,
        transform: &mut dyn AllreduceTransform,
    ) -> Result<()> {
        let nprocs = self.num_models();
        if !nprocs.is_power_of_two() {
            self.pe_ring_allreduce(self.intermodel_comm().clone(), mat, max_recv_count, transform)
        } else if mat.height() <= 64 && mat.width() <= 64 {
            self.recursive_doubling_allreduce_pow2(
                self.intermodel_comm().clone(),
                mat,
                max_recv_count,
                transform,
            )
        } else {
            self.pe_ring_allreduce(self.intermodel_comm().clone(), mat, max_recv_count, transform)
        }
    }

    /// Recursive-doubling allreduce. Each round pairs rank with
    /// `rank ^ mask` and exchanges the transformed whole matrix; after
    /// `log2(nprocs)` rounds every rank holds the reduction. Requires a
    /// power-of-two group; otherwise returns without action (the
    /// dispatcher is responsible for routing such groups elsewhere).
    pub fn recursive_doubling_allreduce_pow2(
        &self,
        comm: Arc<dyn Transport>,
        mat: &mut Mat,
        max_recv_count: usize,
        transform: &mut dyn AllreduceTransform,
    ) -> Result<()> {
        let rank = comm.rank();
        let nprocs = comm.size();
        if !nprocs.is_power_of_two() {
            return Ok(());
        }
        let height = mat.height();
        let width = mat.width();
        let recv_buf = self.get_collective_buffer(max_recv_count, 0)?;

        let mut mask = 1;
        while mask < nprocs {
            let partner = rank ^ mask;
            let send_len;
            let received;
            {
                let send_buf = transform.encode(mat, 0..height, 0..width, false)?;
                if send_buf.len() > max_recv_count {
                    return Err(CohortError::BufferOverflow {
                        produced: send_buf.len(),
                        max: max_recv_count,
                    });
                }
                send_len = send_buf.len();
                let mut rb = recv_buf.borrow_mut();
                received = comm.send_recv(send_buf, partner, &mut rb, partner, TAG_ALLREDUCE)?;
            }
            self.add_bytes_sent(send_len);
            let recv_len = {
                let rb = recv_buf.borrow();
                transform.decode_apply(&rb[..received], &mut mat.view_mut())?
            };
            self.add_bytes_received(recv_len);
            mask <<= 1;
        }
        Ok(())
    }

    /// Pairwise-exchange ring allreduce: a reduce-scatter in which step
    /// `s` exchanges directly with ranks `±s`, followed by a ring
    /// allgather that forwards already-encoded payloads without
    /// re-encoding, alternating the two pool buffers.
    pub fn pe_ring_allreduce(
        &self,
        comm: Arc<dyn Transport>,
        mat: &mut Mat,
        max_recv_count: usize,
        transform: &mut dyn AllreduceTransform,
    ) -> Result<()> {
        let rank = comm.rank();
        let nprocs = comm.size();
        if nprocs == 1 {
            return Ok(());
        }
        let height = mat.height();
        let (lengths, ends) = column_slices(mat.width(), nprocs);
        let start = |i: usize| ends[i] - lengths[i];

        let recv_buf = self.get_collective_buffer(max_recv_count, 0)?;

        // Reduce-scatter: no chunk of data is looked at twice.
        for step in 1..nprocs {
            let dst = (rank + step) % nprocs;
            let src = (rank + nprocs - step) % nprocs;
            let send_len;
            let received;
            {
                let send_buf = transform.encode(mat, 0..height, start(dst)..ends[dst], true)?;
                if send_buf.len() > max_recv_count {
                    return Err(CohortError::BufferOverflow {
                        produced: send_buf.len(),
                        max: max_recv_count,
                    });
                }
                send_len = send_buf.len();
                let mut rb = recv_buf.borrow_mut();
                received = comm.send_recv(send_buf, dst, &mut rb, src, TAG_ALLREDUCE)?;
            }
            self.add_bytes_sent(send_len);
            let recv_len = {
                let rb = recv_buf.borrow();
                let mut own = mat.slice_mut(0..height, start(rank)..ends[rank]);
                transform.decode_apply(&rb[..received], &mut own)?
            };
            self.add_bytes_received(recv_len);
        }

        // Ring allgather. Source and destination are fixed neighbors.
        let src = (rank + nprocs - 1) % nprocs;
        let dst = (rank + 1) % nprocs;
        let mut send_size;
        {
            // First step forwards our locally reduced slice.
            let data_src = (rank + nprocs - 1) % nprocs;
            let received;
            {
                let send_buf = transform.encode(mat, 0..height, start(rank)..ends[rank], false)?;
                if send_buf.len() > max_recv_count {
                    return Err(CohortError::BufferOverflow {
                        produced: send_buf.len(),
                        max: max_recv_count,
                    });
                }
                send_size = send_buf.len();
                let mut rb = recv_buf.borrow_mut();
                received = comm.send_recv(send_buf, dst, &mut rb, src, TAG_ALLREDUCE)?;
            }
            self.add_bytes_sent(send_size);
            let recv_len = {
                let rb = recv_buf.borrow();
                let mut view = mat.slice_mut(0..height, start(data_src)..ends[data_src]);
                transform.decode(&rb[..received], &mut view)?
            };
            self.add_bytes_received(recv_len);
            send_size = recv_len;
        }

        // Remaining nprocs - 2 steps forward the just-received encoding,
        // swapping the primary and alternate buffers instead of copying.
        let mut fwd_buf = recv_buf;
        let mut alt_buf = self.get_collective_buffer(max_recv_count, 1)?;
        for step in 1..nprocs - 1 {
            let data_src = (rank + nprocs - step - 1) % nprocs;
            let received;
            {
                let outgoing = fwd_buf.borrow();
                let mut rb = alt_buf.borrow_mut();
                received = comm.send_recv(&outgoing[..send_size], dst, &mut rb, src, TAG_ALLREDUCE)?;
            }
            self.add_bytes_sent(send_size);
            let recv_len = {
                let rb = alt_buf.borrow();
                let mut view = mat.slice_mut(0..height, start(data_src)..ends[data_src]);
                transform.decode(&rb[..received], &mut view)?
            };
            self.add_bytes_received(recv_len);
            std::mem::swap(&mut fwd_buf, &mut alt_buf);
            send_size = recv_len;
        }
        Ok(())
    }

    /// Ring allreduce with cycled slices: instead of rank `i`
    /// accumulating only slice `i`, slices travel around the ring and
    /// pick up each rank's contribution as they pass through. Retained
    /// as an experimental alternative to the pairwise-exchange ring; the
    /// dispatcher never selects it.
    pub fn ring_allreduce(
        &self,
        comm: Arc<dyn Transport>,
        mat: &mut Mat,
        max_recv_count: usize,
        transform: &mut dyn AllreduceTransform,
    ) -> Result<()> {
        let rank = comm.rank();
        let nprocs = comm.size();
        if nprocs == 1 {
            return Ok(());
        }
        let height = mat.height();
        let (lengths, ends) = column_slices(mat.width(), nprocs);
        let start = |i: usize| ends[i] - lengths[i];

        let recv_buf = self.get_collective_buffer(max_recv_count, 0)?;
        let src = (rank + nprocs - 1) % nprocs;
        let dst = (rank + 1) % nprocs;

        // Cycled reduce-scatter: after nprocs - 1 steps slice k has been
        // fully accumulated on rank (k + nprocs - 1) % nprocs.
        for step in 0..nprocs - 1 {
            let send_slice = (rank + nprocs - step) % nprocs;
            let recv_slice = (rank + nprocs - step - 1) % nprocs;
            let send_len;
            let received;
            {
                let send_buf =
                    transform.encode(mat, 0..height, start(send_slice)..ends[send_slice], false)?;
                if send_buf.len() > max_recv_count {
                    return Err(CohortError::BufferOverflow {
                        produced: send_buf.len(),
                        max: max_recv_count,
                    });
                }
                send_len = send_buf.len();
                let mut rb = recv_buf.borrow_mut();
                received = comm.send_recv(send_buf, dst, &mut rb, src, TAG_ALLREDUCE)?;
            }
            self.add_bytes_sent(send_len);
            let recv_len = {
                let rb = recv_buf.borrow();
                let mut view = mat.slice_mut(0..height, start(recv_slice)..ends[recv_slice]);
                transform.decode_apply(&rb[..received], &mut view)?
            };
            self.add_bytes_received(recv_len);
        }

        // Ring allgather, first applying the transform to local data.
        let mut send_size;
        {
            let send_slice = (rank + 1) % nprocs;
            let recv_slice = rank;
            let received;
            {
                let send_buf =
                    transform.encode(mat, 0..height, start(send_slice)..ends[send_slice], false)?;
                if send_buf.len() > max_recv_count {
                    return Err(CohortError::BufferOverflow {
                        produced: send_buf.len(),
                        max: max_recv_count,
                    });
                }
                send_size = send_buf.len();
                let mut rb = recv_buf.borrow_mut();
                received = comm.send_recv(send_buf, dst, &mut rb, src, TAG_ALLREDUCE)?;
            }
            self.add_bytes_sent(send_size);
            let recv_len = {
                let rb = recv_buf.borrow();
                let mut view = mat.slice_mut(0..height, start(recv_slice)..ends[recv_slice]);
                transform.decode(&rb[..received], &mut view)?
            };
            self.add_bytes_received(recv_len);
            send_size = recv_len;
        }
        let mut fwd_buf = recv_buf;
        let mut alt_buf = self.get_collective_buffer(max_recv_count, 1)?;
        for step in 1..nprocs - 1 {
            let recv_slice = (rank + nprocs - step) % nprocs;
            let received;
            {
                let outgoing = fwd_buf.borrow();
                let mut rb = alt_buf.borrow_mut();
                received = comm.send_recv(&outgoing[..send_size], dst, &mut rb, src, TAG_ALLREDUCE)?;
            }
            self.add_bytes_sent(send_size);
            let recv_len = {
                let rb = alt_buf.borrow();
                let mut view = mat.slice_mut(0..height, start(recv_slice)..ends[recv_slice]);
                transform.decode(&rb[..received], &mut view)?
            };
            self.add_bytes_received(recv_len);
            std::mem::swap(&mut fwd_buf, &mut alt_buf);
            send_size = recv_len;
        }
        Ok(())
    }
}
