use thiserror::Error;

#[derive(Error, Debug)]
pub enum CohortError {
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("collective buffer slot out of sequence: requested {requested}, bucket holds {len}")]
    InvalidBufferIndex { requested: usize, len: usize },

    #[error("transform produced {produced} bytes but the receiver accepts at most {max}")]
    BufferOverflow { produced: usize, max: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("subset too large: {0}")]
    SubsetTooLarge(String),

    #[error("percentage out of range: {0} (must be in [0, 1])")]
    InvalidPercent(f64),

    #[error("missing configuration: {0}")]
    MissingConfiguration(String),

    #[error("insufficient readers: {0}")]
    InsufficientReaders(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CohortError>;
