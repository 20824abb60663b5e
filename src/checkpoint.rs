//! Checkpoint persistence of reader shuffling state.
//!
//! The backend is a typed key-value writer: flat fields inside a `train`
//! bucket, scalars as little-endian u64, index arrays as little-endian
//! i32. No framing or checksums at this layer. [`FilePersist`] maps each
//! field to one file for tests and single-node runs.

use crate::comm::Communicator;
use crate::data::reader::ReaderCore;
use crate::utils::error::{CohortError, Result};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Persistence namespace a field lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistType {
    Train,
}

impl PersistType {
    fn bucket(&self) -> &'static str {
        match self {
            PersistType::Train => "train",
        }
    }
}

/// Typed key-value writer the checkpoint layer talks to.
pub trait Persist {
    fn write_u64(&mut self, bucket: PersistType, field: &str, value: u64) -> Result<()>;
    fn read_u64(&self, bucket: PersistType, field: &str) -> Result<u64>;
    fn write_i32_array(&mut self, bucket: PersistType, field: &str, values: &[i32]) -> Result<()>;
    fn read_i32_array(&self, bucket: PersistType, field: &str, out: &mut [i32]) -> Result<()>;
}

/// One file per field under `<root>/<bucket>/<field>`.
pub struct FilePersist {
    root: PathBuf,
}

impl FilePersist {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, bucket: PersistType, field: &str) -> PathBuf {
        self.root.join(bucket.bucket()).join(field)
    }
}

impl Persist for FilePersist {
    fn write_u64(&mut self, bucket: PersistType, field: &str, value: u64) -> Result<()> {
        let path = self.path(bucket, field);
        fs::create_dir_all(path.parent().expect("bucket parent"))?;
        fs::write(path, value.to_le_bytes())?;
        Ok(())
    }

    fn read_u64(&self, bucket: PersistType, field: &str) -> Result<u64> {
        let path = self.path(bucket, field);
        let bytes = fs::read(&path)?;
        let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            CohortError::Checkpoint(format!("field {} is not a u64", path.display()))
        })?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn write_i32_array(&mut self, bucket: PersistType, field: &str, values: &[i32]) -> Result<()> {
        let path = self.path(bucket, field);
        fs::create_dir_all(path.parent().expect("bucket parent"))?;
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    fn read_i32_array(&self, bucket: PersistType, field: &str, out: &mut [i32]) -> Result<()> {
        let path = self.path(bucket, field);
        let bytes = fs::read(&path)?;
        if bytes.len() != out.len() * 4 {
            return Err(CohortError::Checkpoint(format!(
                "field {} holds {} bytes, expected {}",
                path.display(),
                bytes.len(),
                out.len() * 4
            )));
        }
        for (v, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
            *v = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }
}

impl ReaderCore {
    /// Write this reader's shuffling state. Only the checkpoint root
    /// (world rank 0) touches the backend; peers return immediately.
    pub fn save_to_checkpoint(
        &self,
        persist: &mut dyn Persist,
        name: &str,
        comm: &Communicator,
    ) -> Result<()> {
        if comm.world_rank() != 0 {
            return Ok(());
        }
        persist.write_u64(
            PersistType::Train,
            &format!("{}_current_mini_batch_idx", name),
            self.current_mini_batch_idx() as u64,
        )?;
        persist.write_u64(
            PersistType::Train,
            &format!("{}_data_size", name),
            self.num_samples() as u64,
        )?;
        persist.write_u64(
            PersistType::Train,
            &format!("{}_data_position", name),
            self.current_pos() as u64,
        )?;
        persist.write_i32_array(
            PersistType::Train,
            &format!("{}_data_indices", name),
            self.indices(),
        )?;
        info!(reader = name, samples = self.num_samples(), "reader state checkpointed");
        Ok(())
    }

    /// Restore shuffling state written by [`Self::save_to_checkpoint`].
    /// The root reads, then every rank receives the position counters and
    /// the index array over the world communicator; afterwards all ranks
    /// hold identical state.
    pub fn load_from_checkpoint(
        &mut self,
        persist: &dyn Persist,
        name: &str,
        comm: &Communicator,
    ) -> Result<()> {
        let mut header = [0u64; 3];
        if comm.world_rank() == 0 {
            header[0] = persist.read_u64(
                PersistType::Train,
                &format!("{}_current_mini_batch_idx", name),
            )?;
            header[1] =
                persist.read_u64(PersistType::Train, &format!("{}_data_size", name))?;
            header[2] =
                persist.read_u64(PersistType::Train, &format!("{}_data_position", name))?;
        }
        let mut header_bytes = [0u8; 24];
        for (chunk, v) in header_bytes.chunks_exact_mut(8).zip(&header) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        comm.world_comm().broadcast(&mut header_bytes, 0)?;
        let mini_batch_idx =
            u64::from_le_bytes(header_bytes[0..8].try_into().expect("u64")) as usize;
        let data_size = u64::from_le_bytes(header_bytes[8..16].try_into().expect("u64")) as usize;
        let position = u64::from_le_bytes(header_bytes[16..24].try_into().expect("u64")) as usize;

        // Every rank resizes before the array lands.
        self.resize_indices(data_size);
        let mut index_bytes = vec![0u8; data_size * 4];
        if comm.world_rank() == 0 {
            persist.read_i32_array(
                PersistType::Train,
                &format!("{}_data_indices", name),
                self.indices_mut(),
            )?;
            for (chunk, v) in index_bytes.chunks_exact_mut(4).zip(self.indices()) {
                chunk.copy_from_slice(&v.to_le_bytes());
            }
        }
        comm.world_comm().broadcast(&mut index_bytes, 0)?;
        for (v, chunk) in self.indices_mut().iter_mut().zip(index_bytes.chunks_exact(4)) {
            *v = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        self.restore_position(position, mini_batch_idx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn u64_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = FilePersist::new(dir.path());
        p.write_u64(PersistType::Train, "reader_data_position", 17).unwrap();
        assert_eq!(
            p.read_u64(PersistType::Train, "reader_data_position").unwrap(),
            17
        );
    }

    #[test]
    fn i32_array_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = FilePersist::new(dir.path());
        let values = vec![5, -3, 0, 1 << 20];
        p.write_i32_array(PersistType::Train, "reader_data_indices", &values)
            .unwrap();

        let mut out = vec![0i32; 4];
        p.read_i32_array(PersistType::Train, "reader_data_indices", &mut out)
            .unwrap();
        assert_eq!(out, values);
    }

    #[test]
    fn missing_field_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = FilePersist::new(dir.path());
        match p.read_u64(PersistType::Train, "nope") {
            Err(CohortError::Io(e)) => assert_eq!(e.kind(), ErrorKind::NotFound),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn mis_sized_array_is_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = FilePersist::new(dir.path());
        p.write_i32_array(PersistType::Train, "reader_data_indices", &[1, 2, 3])
            .unwrap();
        let mut out = vec![0i32; 5];
        let err = p
            .read_i32_array(PersistType::Train, "reader_data_indices", &mut out)
            .unwrap_err();
        assert!(matches!(err, CohortError::Checkpoint(_)));
    }
}
