#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arbor_chainstate::assembler::ChainAssembler;
use arbor_chainstate::context::{
    ArchiveError, BlockArchive, BlockRequester, BlockValidator, TransactionSource,
    ValidationError, WorkSource,
};
use arbor_chainstate::headers::HeaderStore;
use arbor_chainstate::lock::ChainLock;
use arbor_chainstate::params::ChainParams;
use arbor_chainstate::pending::{DeletionQueue, PendingBlockStore};
use arbor_chainstate::utxo::UtxoManager;
use arbor_primitives::block::{Block, BlockHeader};
use arbor_primitives::outpoint::OutPoint;
use arbor_primitives::transaction::{Transaction, TxIn, TxOut};
use arbor_primitives::Hash256;
use arbor_storage::memory::MemoryStore;
use primitive_types::U256;

/// Every header carries bits = 1, so chain work equals chain length.
pub struct UnitWork;

impl WorkSource for UnitWork {
    fn block_work(&self, bits: u32) -> U256 {
        U256::from(bits as u64)
    }
}

pub struct AcceptAll;

impl BlockValidator for AcceptAll {
    fn validate(&self, _block: &Block, _height: u32) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Rejects a single block by hash, accepts everything else.
pub struct RejectHash(pub Hash256);

impl BlockValidator for RejectHash {
    fn validate(&self, block: &Block, _height: u32) -> Result<(), ValidationError> {
        if block.hash() == self.0 {
            Err(ValidationError("rejected by fixture".into()))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
pub struct RecordingRequester {
    pub requests: Mutex<Vec<(Hash256, Option<Hash256>, i64)>>,
}

impl BlockRequester for RecordingRequester {
    fn request_block(&self, hash: Hash256, previous: Option<Hash256>, priority: i64) {
        self.requests
            .lock()
            .unwrap()
            .push((hash, previous, priority));
    }
}

#[derive(Default)]
pub struct MemoryArchive {
    blocks: Mutex<HashMap<Hash256, Block>>,
}

impl BlockArchive for MemoryArchive {
    fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ArchiveError> {
        Ok(self.blocks.lock().unwrap().get(hash).cloned())
    }

    fn write_block(&self, block: &Block) -> Result<(), ArchiveError> {
        self.blocks.lock().unwrap().insert(block.hash(), block.clone());
        Ok(())
    }
}

impl MemoryArchive {
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.lock().unwrap().contains_key(hash)
    }
}

pub struct NoTransactions;

impl TransactionSource for NoTransactions {
    fn transaction(&self, _txid: &Hash256) -> Result<Option<Transaction>, ArchiveError> {
        Ok(None)
    }
}

/// Builds a block with a single coinbase whose script is tagged by the
/// nonce, so every mined block has a distinct hash and txid.
pub fn mine(prev: Hash256, time: u32, nonce: u32) -> Block {
    Block {
        header: BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time,
            bits: 1,
            nonce,
        },
        transactions: vec![Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![nonce as u8, (nonce >> 8) as u8],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value: 50_000,
                script_pubkey: vec![0x51, nonce as u8],
            }],
            lock_time: 0,
        }],
    }
}

pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}

type Store = Arc<MemoryStore>;

pub struct Harness {
    pub store: Store,
    pub headers: Arc<HeaderStore<Store>>,
    pub utxo: Arc<UtxoManager<Store>>,
    pub pending: Arc<PendingBlockStore<Store>>,
    pub deletions: Arc<DeletionQueue>,
    pub lock: Arc<ChainLock>,
    pub requester: Arc<RecordingRequester>,
    pub archive: Arc<MemoryArchive>,
    pub assembler: ChainAssembler<Store>,
}

pub fn harness(params: ChainParams, validator: Arc<dyn BlockValidator>) -> Harness {
    harness_on(Arc::new(MemoryStore::new()), params, validator)
}

/// Builds the full component stack over an existing store, so tests can
/// simulate a restart by rebuilding the stack over the same data.
pub fn harness_on(
    store: Store,
    params: ChainParams,
    validator: Arc<dyn BlockValidator>,
) -> Harness {
    let headers = Arc::new(
        HeaderStore::open(Arc::clone(&store), params.clone(), Arc::new(UnitWork)).unwrap(),
    );
    let utxo = Arc::new(
        UtxoManager::open(Arc::clone(&store), &params, Arc::new(NoTransactions)).unwrap(),
    );
    let pending = Arc::new(PendingBlockStore::new(Arc::clone(&store)));
    let deletions = Arc::new(DeletionQueue::start(Arc::clone(&store)));
    let lock = Arc::new(ChainLock::default());
    let requester = Arc::new(RecordingRequester::default());
    let archive = Arc::new(MemoryArchive::default());
    let assembler = ChainAssembler::new(
        Arc::clone(&headers),
        Arc::clone(&utxo),
        Arc::clone(&pending),
        Arc::clone(&deletions),
        validator,
        Arc::clone(&requester) as Arc<dyn BlockRequester>,
        Arc::clone(&archive) as Arc<dyn BlockArchive>,
        Arc::clone(&lock),
    );
    Harness {
        store,
        headers,
        utxo,
        pending,
        deletions,
        lock,
        requester,
        archive,
        assembler,
    }
}

impl Harness {
    pub fn insert_headers(&self, headers: &[BlockHeader]) {
        let mut token = self.lock.write();
        for header in headers {
            self.headers.insert_header(&mut token, header).unwrap();
        }
    }
}
