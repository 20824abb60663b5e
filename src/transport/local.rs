//! In-process transport backed by threads.
//!
//! One [`LocalWorld`] hands out a [`LocalTransport`] per rank; the
//! handles share mailboxes, a reusable barrier, and a split rendezvous.
//! Multi-rank tests run each rank on its own thread via
//! [`LocalWorld::run`].

use super::Transport;
use crate::utils::error::{CohortError, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

const KIND_P2P: u8 = 0;
const KIND_COLL: u8 = 1;

type MsgKey = (usize, usize, u8, u64); // (src, dst, kind, tag)

#[derive(Default)]
struct BarrierGen {
    count: usize,
    generation: u64,
}

struct SplitSync {
    entries: Vec<Option<(usize, usize)>>, // (color, key) per rank
    arrived: usize,
    // One slot per rank: the sub-world handle and the new rank within it.
    result: Vec<Option<(Arc<Shared>, usize)>>,
    taken: usize,
}

struct Shared {
    size: usize,
    hosts: Vec<String>,
    mail: Mutex<HashMap<MsgKey, VecDeque<Vec<u8>>>>,
    mail_cv: Condvar,
    barrier: Mutex<BarrierGen>,
    barrier_cv: Condvar,
    split: Mutex<SplitSync>,
    split_cv: Condvar,
}

impl Shared {
    fn new(hosts: Vec<String>) -> Arc<Self> {
        let size = hosts.len();
        Arc::new(Self {
            size,
            hosts,
            mail: Mutex::new(HashMap::new()),
            mail_cv: Condvar::new(),
            barrier: Mutex::new(BarrierGen::default()),
            barrier_cv: Condvar::new(),
            split: Mutex::new(SplitSync {
                entries: vec![None; size],
                arrived: 0,
                result: (0..size).map(|_| None).collect(),
                taken: 0,
            }),
            split_cv: Condvar::new(),
        })
    }
}

/// Factory for the rank handles of one in-process world.
pub struct LocalWorld;

impl LocalWorld {
    /// `n` ranks, all reporting the same host.
    pub fn new(n: usize) -> Vec<LocalTransport> {
        Self::with_hosts(&vec!["localhost"; n])
    }

    /// One rank per entry of `hosts`; the host string is what
    /// `processor_name` reports, so node-communicator construction
    /// groups ranks with equal entries.
    pub fn with_hosts(hosts: &[&str]) -> Vec<LocalTransport> {
        let shared = Shared::new(hosts.iter().map(|h| h.to_string()).collect());
        (0..hosts.len())
            .map(|rank| LocalTransport {
                rank,
                shared: shared.clone(),
                coll_seq: AtomicU64::new(0),
            })
            .collect()
    }

    /// Run `f` once per rank, each on its own thread. Panics in any rank
    /// propagate to the caller.
    pub fn run<F>(n: usize, f: F)
    where
        F: Fn(Arc<dyn Transport>) + Send + Sync + 'static,
    {
        let hosts = vec!["localhost"; n];
        Self::run_with_hosts(&hosts, f)
    }

    /// Like [`LocalWorld::run`] with per-rank host names.
    pub fn run_with_hosts<F>(hosts: &[&str], f: F)
    where
        F: Fn(Arc<dyn Transport>) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = Self::with_hosts(hosts)
            .into_iter()
            .map(|t| {
                let f = f.clone();
                thread::spawn(move || f(Arc::new(t) as Arc<dyn Transport>))
            })
            .collect();
        for h in handles {
            h.join().expect("rank thread panicked");
        }
    }
}

/// One rank's handle into a [`LocalWorld`].
pub struct LocalTransport {
    rank: usize,
    shared: Arc<Shared>,
    // Collectives stamp a per-handle sequence number so that identical
    // call sequences pair up across ranks without clashing with p2p tags.
    coll_seq: AtomicU64,
}

impl LocalTransport {
    fn post(&self, bytes: &[u8], dst: usize, kind: u8, tag: u64) -> Result<()> {
        if dst >= self.shared.size {
            return Err(CohortError::Transport(format!(
                "send to rank {} in a group of {}",
                dst, self.shared.size
            )));
        }
        let key = (self.rank, dst, kind, tag);
        let mut mail = self.shared.mail.lock().unwrap();
        mail.entry(key).or_default().push_back(bytes.to_vec());
        self.shared.mail_cv.notify_all();
        Ok(())
    }

    fn take(&self, src: usize, kind: u8, tag: u64) -> Result<Vec<u8>> {
        if src >= self.shared.size {
            return Err(CohortError::Transport(format!(
                "receive from rank {} in a group of {}",
                src, self.shared.size
            )));
        }
        let key = (src, self.rank, kind, tag);
        let mut mail = self.shared.mail.lock().unwrap();
        loop {
            if let Some(queue) = mail.get_mut(&key) {
                if let Some(msg) = queue.pop_front() {
                    return Ok(msg);
                }
            }
            mail = self.shared.mail_cv.wait(mail).unwrap();
        }
    }

    fn next_coll_tag(&self) -> u64 {
        self.coll_seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn send(&self, bytes: &[u8], dst: usize, tag: u64) -> Result<()> {
        self.post(bytes, dst, KIND_P2P, tag)
    }

    fn recv(&self, buf: &mut [u8], src: usize, tag: u64) -> Result<usize> {
        let msg = self.take(src, KIND_P2P, tag)?;
        if msg.len() > buf.len() {
            return Err(CohortError::Transport(format!(
                "message of {} bytes exceeds receive buffer of {}",
                msg.len(),
                buf.len()
            )));
        }
        buf[..msg.len()].copy_from_slice(&msg);
        Ok(msg.len())
    }

    fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<()> {
        let tag = self.next_coll_tag();
        if self.rank == root {
            for dst in 0..self.shared.size {
                if dst != self.rank {
                    self.post(buf, dst, KIND_COLL, tag)?;
                }
            }
            Ok(())
        } else {
            let msg = self.take(root, KIND_COLL, tag)?;
            if msg.len() != buf.len() {
                return Err(CohortError::Transport(format!(
                    "broadcast payload of {} bytes into buffer of {}",
                    msg.len(),
                    buf.len()
                )));
            }
            buf.copy_from_slice(&msg);
            Ok(())
        }
    }

    fn allgather(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
        let tag = self.next_coll_tag();
        for dst in 0..self.shared.size {
            if dst != self.rank {
                self.post(mine, dst, KIND_COLL, tag)?;
            }
        }
        let mut all = Vec::with_capacity(self.shared.size);
        for src in 0..self.shared.size {
            if src == self.rank {
                all.push(mine.to_vec());
            } else {
                all.push(self.take(src, KIND_COLL, tag)?);
            }
        }
        Ok(all)
    }

    fn barrier(&self) -> Result<()> {
        let mut gate = self.shared.barrier.lock().unwrap();
        gate.count += 1;
        if gate.count == self.shared.size {
            gate.count = 0;
            gate.generation += 1;
            self.shared.barrier_cv.notify_all();
        } else {
            let generation = gate.generation;
            while gate.generation == generation {
                gate = self.shared.barrier_cv.wait(gate).unwrap();
            }
        }
        Ok(())
    }

    fn split(&self, color: usize, key: usize) -> Result<Arc<dyn Transport>> {
        let mut sync = self.shared.split.lock().unwrap();

        // Wait out a previous split that has not been fully drained.
        while sync.entries[self.rank].is_some() {
            sync = self.shared.split_cv.wait(sync).unwrap();
        }
        sync.entries[self.rank] = Some((color, key));
        sync.arrived += 1;

        if sync.arrived == self.shared.size {
            // Last to arrive: carve the world into sub-worlds.
            let mut groups: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
            for (rank, entry) in sync.entries.iter().enumerate() {
                let (c, k) = entry.expect("all ranks deposited");
                groups.entry(c).or_default().push((k, rank));
            }
            for members in groups.values_mut() {
                members.sort();
                let hosts = members
                    .iter()
                    .map(|&(_, rank)| self.shared.hosts[rank].clone())
                    .collect();
                let sub = Shared::new(hosts);
                for (new_rank, &(_, rank)) in members.iter().enumerate() {
                    sync.result[rank] = Some((sub.clone(), new_rank));
                }
            }
            self.shared.split_cv.notify_all();
        } else {
            while sync.result[self.rank].is_none() {
                sync = self.shared.split_cv.wait(sync).unwrap();
            }
        }

        let (sub, new_rank) = sync.result[self.rank].take().expect("split result present");
        sync.taken += 1;
        if sync.taken == self.shared.size {
            sync.arrived = 0;
            sync.taken = 0;
            for entry in sync.entries.iter_mut() {
                *entry = None;
            }
            self.shared.split_cv.notify_all();
        }

        Ok(Arc::new(LocalTransport {
            rank: new_rank,
            shared: sub,
            coll_seq: AtomicU64::new(0),
        }))
    }

    fn processor_name(&self) -> String {
        self.shared.hosts[self.rank].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_recv_round_trip() {
        LocalWorld::run(2, |t| {
            if t.rank() == 0 {
                t.send(b"ping", 1, 7).unwrap();
                let mut buf = [0u8; 8];
                let n = t.recv(&mut buf, 1, 7).unwrap();
                assert_eq!(&buf[..n], b"pong");
            } else {
                let mut buf = [0u8; 8];
                let n = t.recv(&mut buf, 0, 7).unwrap();
                assert_eq!(&buf[..n], b"ping");
                t.send(b"pong", 0, 7).unwrap();
            }
        });
    }

    #[test]
    fn send_recv_exchange() {
        LocalWorld::run(4, |t| {
            let partner = t.rank() ^ 1;
            let mine = [t.rank() as u8; 4];
            let mut theirs = [0u8; 4];
            let n = t.send_recv(&mine, partner, &mut theirs, partner, 0).unwrap();
            assert_eq!(n, 4);
            assert_eq!(theirs, [partner as u8; 4]);
        });
    }

    #[test]
    fn broadcast_from_root() {
        LocalWorld::run(3, |t| {
            let mut buf = if t.rank() == 1 { [9u8; 4] } else { [0u8; 4] };
            t.broadcast(&mut buf, 1).unwrap();
            assert_eq!(buf, [9u8; 4]);
        });
    }

    #[test]
    fn allgather_rank_order() {
        LocalWorld::run(3, |t| {
            let mine = [t.rank() as u8];
            let all = t.allgather(&mine).unwrap();
            assert_eq!(all, vec![vec![0u8], vec![1u8], vec![2u8]]);
        });
    }

    #[test]
    fn allreduce_sums_everywhere() {
        LocalWorld::run(4, |t| {
            let mut data = [t.rank() as f32 + 1.0, 10.0];
            t.allreduce_sum_f32(&mut data).unwrap();
            assert_eq!(data, [10.0, 40.0]);
        });
    }

    #[test]
    fn split_groups_by_color() {
        LocalWorld::run(6, |t| {
            let color = t.rank() % 2;
            let sub = t.split(color, t.rank()).unwrap();
            assert_eq!(sub.size(), 3);
            assert_eq!(sub.rank(), t.rank() / 2);

            let mut sum = [1.0f32];
            sub.allreduce_sum_f32(&mut sum).unwrap();
            assert_eq!(sum, [3.0]);
        });
    }

    #[test]
    fn barrier_reusable() {
        LocalWorld::run(3, |t| {
            for _ in 0..10 {
                t.barrier().unwrap();
            }
        });
    }
}
