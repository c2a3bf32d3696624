//! Chain parameters consumed by the chain-state core.

use arbor_primitives::Hash256;

/// Blocks with a recorded failure count at or above this value are treated
/// as invalid and skipped by the assembler.
pub const INVALID_PROCESS_THRESHOLD: u32 = 3;

/// Default block-height interval between durable UTXO commits.
pub const UTXO_COMMIT_FREQUENCY: u32 = 2016;

/// Default bound on staged (uncommitted) UTXO entries before a commit is
/// attempted opportunistically.
pub const UTXO_STAGING_CAPACITY: usize = 500_000;

#[derive(Clone, Copy, Debug)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub genesis_hash: Hash256,
    pub checkpoints: Vec<Checkpoint>,
    pub invalid_process_threshold: u32,
    pub utxo_commit_frequency: u32,
    pub utxo_staging_capacity: usize,
}

impl ChainParams {
    pub fn new(genesis_hash: Hash256) -> Self {
        Self {
            genesis_hash,
            checkpoints: Vec::new(),
            invalid_process_threshold: INVALID_PROCESS_THRESHOLD,
            utxo_commit_frequency: UTXO_COMMIT_FREQUENCY,
            utxo_staging_capacity: UTXO_STAGING_CAPACITY,
        }
    }

    pub fn checkpoint_at(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }
}
