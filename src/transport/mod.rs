//! Message-passing substrate underneath the communicator.
//!
//! The training core is SPMD: every rank runs the same program and talks
//! to its peers through a [`Transport`]. Implementations include
//! [`local::LocalTransport`], an in-process substrate backed by threads
//! that tests and single-node runs use.
//!
//! All calls block. Collectives on one transport are ordered by
//! invocation; every rank must issue the same collective sequence on a
//! given transport, otherwise behavior is undefined.

use crate::utils::error::Result;
use std::sync::Arc;

pub mod local;

/// Blocking point-to-point and collective operations over a fixed group
/// of ranks.
pub trait Transport: Send + Sync {
    /// Rank of this process within the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Send `bytes` to `dst`. Buffered; returns once the payload is
    /// handed to the substrate.
    fn send(&self, bytes: &[u8], dst: usize, tag: u64) -> Result<()>;

    /// Receive a message from `src` into `buf`; returns the received
    /// length. A message longer than `buf` is a transport error.
    fn recv(&self, buf: &mut [u8], src: usize, tag: u64) -> Result<usize>;

    /// Combined exchange: the send to `dst` and the receive from `src`
    /// post atomically with respect to other steps on this transport.
    fn send_recv(
        &self,
        send: &[u8],
        dst: usize,
        recv: &mut [u8],
        src: usize,
        tag: u64,
    ) -> Result<usize> {
        self.send(send, dst, tag)?;
        self.recv(recv, src, tag)
    }

    /// Byte broadcast from `root`; `buf` must be sized identically on
    /// every rank.
    fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<()>;

    /// Gather every rank's payload, returned in rank order on all ranks.
    fn allgather(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Elementwise SUM across ranks, replacing `data` everywhere.
    fn allreduce_sum_f32(&self, data: &mut [f32]) -> Result<()> {
        let mut bytes = Vec::with_capacity(data.len() * 4);
        for v in data.iter() {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let all = self.allgather(&bytes)?;
        for v in data.iter_mut() {
            *v = 0.0;
        }
        for payload in &all {
            for (v, chunk) in data.iter_mut().zip(payload.chunks_exact(4)) {
                *v += f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
        Ok(())
    }

    /// Elementwise SUM of u64 counters across ranks.
    fn allreduce_sum_u64(&self, data: &mut [u64]) -> Result<()> {
        let mut bytes = Vec::with_capacity(data.len() * 8);
        for v in data.iter() {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let all = self.allgather(&bytes)?;
        for v in data.iter_mut() {
            *v = 0;
        }
        for payload in &all {
            for (v, chunk) in data.iter_mut().zip(payload.chunks_exact(8)) {
                *v += u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
            }
        }
        Ok(())
    }

    /// Block until every rank in the group has arrived.
    fn barrier(&self) -> Result<()>;

    /// Collective split into sub-groups by `color`; ranks within a group
    /// are ordered by `(key, old_rank)`.
    fn split(&self, color: usize, key: usize) -> Result<Arc<dyn Transport>>;

    /// Host identity of this rank.
    fn processor_name(&self) -> String;
}
