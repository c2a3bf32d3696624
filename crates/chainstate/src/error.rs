use arbor_storage::StoreError;

use crate::context::ArchiveError;

#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    Archive(ArchiveError),
    CorruptRecord(&'static str),
    MissingHeader,
    UnknownParent,
    MissingSegment,
    MultipleRoots,
    NoRootSegment,
    CheckpointMismatch { height: u32 },
    OutOfOrderBatch,
    OutOfOrderApply { expected: u32, actual: u32 },
    BranchMismatch,
    MissingBlock,
    MissingTransaction,
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::Archive(err) => write!(f, "{err}"),
            ChainStateError::CorruptRecord(message) => write!(f, "{message}"),
            ChainStateError::MissingHeader => write!(f, "missing header"),
            ChainStateError::UnknownParent => write!(f, "unknown parent header"),
            ChainStateError::MissingSegment => write!(f, "missing segment"),
            ChainStateError::MultipleRoots => write!(f, "root segment already exists"),
            ChainStateError::NoRootSegment => write!(f, "no root segment"),
            ChainStateError::CheckpointMismatch { height } => {
                write!(f, "checkpoint mismatch at height {height}")
            }
            ChainStateError::OutOfOrderBatch => write!(f, "headers out of order in batch"),
            ChainStateError::OutOfOrderApply { expected, actual } => {
                write!(f, "block applied out of order (expected {expected}, got {actual})")
            }
            ChainStateError::BranchMismatch => {
                write!(f, "block does not extend the staged branch")
            }
            ChainStateError::MissingBlock => write!(f, "block bytes unavailable"),
            ChainStateError::MissingTransaction => write!(f, "source transaction unavailable"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<ArchiveError> for ChainStateError {
    fn from(err: ArchiveError) -> Self {
        ChainStateError::Archive(err)
    }
}
