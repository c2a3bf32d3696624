//! Collaborator traits injected into the chain-state core.
//!
//! Proof-of-work arithmetic, consensus validation, block downloads, raw
//! block storage and transaction lookups all live outside this crate; the
//! core only depends on these seams.

use arbor_primitives::block::Block;
use arbor_primitives::transaction::Transaction;
use arbor_primitives::Hash256;
use primitive_types::U256;

#[derive(Debug)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub struct ArchiveError(pub String);

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArchiveError {}

/// Converts a header's encoded difficulty target into block proof.
pub trait WorkSource: Send + Sync {
    fn block_work(&self, bits: u32) -> U256;
}

/// Full consensus validation of an inflated block at a known height.
pub trait BlockValidator: Send + Sync {
    fn validate(&self, block: &Block, height: u32) -> Result<(), ValidationError>;
}

/// Fire-and-forget block download request. `previous` carries the hash of
/// the last connected block so the downloader can prioritize contiguous
/// work; lower priority values are served first.
pub trait BlockRequester: Send + Sync {
    fn request_block(&self, hash: Hash256, previous: Option<Hash256>, priority: i64);
}

/// Durable raw-block storage (flat files in a full node).
pub trait BlockArchive: Send + Sync {
    fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ArchiveError>;
    fn write_block(&self, block: &Block) -> Result<(), ArchiveError>;
}

/// Indexed transaction lookup, used as the legacy fallback when an output
/// is not present in the UTXO set.
pub trait TransactionSource: Send + Sync {
    fn transaction(&self, txid: &Hash256) -> Result<Option<Transaction>, ArchiveError>;
}
