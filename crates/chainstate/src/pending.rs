//! Downloaded-but-unprocessed block staging.
//!
//! Block bodies arrive out of band and wait here until the assembler walks
//! past them. Metadata (parentage, download priority, failure count) lives
//! in one column, raw bytes in another, so metadata scans never touch block
//! payloads. Processed bodies are deleted off the hot path by a dedicated
//! drain thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use arbor_primitives::block::Block;
use arbor_primitives::encoding::{decode, encode, DecodeError, Decoder, Encoder};
use arbor_primitives::Hash256;
use arbor_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainStateError;

const DELETE_BATCH_SIZE: usize = 256;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingBlock {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub priority: i64,
    pub failure_count: u32,
    pub has_bytes: bool,
}

fn encode_pending(pending: &PendingBlock) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_bytes(&pending.prev_hash);
    encoder.write_i64_le(pending.priority);
    encoder.write_u32_le(pending.failure_count);
    encoder.write_u8(if pending.has_bytes { 1 } else { 0 });
    encoder.into_inner()
}

fn decode_pending(hash: Hash256, bytes: &[u8]) -> Result<PendingBlock, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let prev_hash = decoder.read_fixed::<32>()?;
    let priority = decoder.read_i64_le()?;
    let failure_count = decoder.read_u32_le()?;
    let has_bytes = decoder.read_u8()? != 0;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(PendingBlock {
        hash,
        prev_hash,
        priority,
        failure_count,
        has_bytes,
    })
}

pub struct PendingBlockStore<S> {
    store: S,
}

impl<S: KeyValueStore + Clone> PendingBlockStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Records that a block has been requested. A placeholder keeps the
    /// failure count and priority across repeated downloads; an existing
    /// entry is left untouched.
    pub fn register(
        &self,
        hash: Hash256,
        prev_hash: Hash256,
        priority: i64,
    ) -> Result<(), ChainStateError> {
        if self.store.get(Column::PendingBlock, &hash)?.is_some() {
            return Ok(());
        }
        let pending = PendingBlock {
            hash,
            prev_hash,
            priority,
            failure_count: 0,
            has_bytes: false,
        };
        self.store
            .put(Column::PendingBlock, &hash, &encode_pending(&pending))?;
        Ok(())
    }

    /// Stores a downloaded block body plus its metadata in one batch.
    pub fn store_block(&self, block: &Block, priority: i64) -> Result<Hash256, ChainStateError> {
        let hash = block.hash();
        let failure_count = self
            .pending(&hash)?
            .map(|existing| existing.failure_count)
            .unwrap_or(0);
        let pending = PendingBlock {
            hash,
            prev_hash: block.header.prev_block,
            priority,
            failure_count,
            has_bytes: true,
        };
        let mut batch = WriteBatch::new();
        batch.put(Column::PendingBlock, hash, encode_pending(&pending));
        batch.put(Column::PendingBlockData, hash, encode(block));
        self.store.write_batch(&batch)?;
        Ok(hash)
    }

    pub fn pending(&self, hash: &Hash256) -> Result<Option<PendingBlock>, ChainStateError> {
        match self.store.get(Column::PendingBlock, hash)? {
            Some(bytes) => Ok(Some(decode_pending(*hash, &bytes).map_err(|_| {
                ChainStateError::CorruptRecord("corrupt pending block record")
            })?)),
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, ChainStateError> {
        Ok(self
            .pending(hash)?
            .map(|pending| pending.has_bytes)
            .unwrap_or(false))
    }

    pub fn block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        match self.store.get(Column::PendingBlockData, hash)? {
            Some(bytes) => Ok(Some(decode::<Block>(&bytes).map_err(|_| {
                ChainStateError::CorruptRecord("corrupt pending block bytes")
            })?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        let mut batch = WriteBatch::new();
        batch.delete(Column::PendingBlock, hash);
        batch.delete(Column::PendingBlockData, hash);
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Removes only the raw bytes, keeping the metadata (and its failure
    /// count) for blocks that failed validation.
    pub fn remove_block_data(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        if let Some(mut pending) = self.pending(hash)? {
            pending.has_bytes = false;
            let mut batch = WriteBatch::new();
            batch.put(Column::PendingBlock, *hash, encode_pending(&pending));
            batch.delete(Column::PendingBlockData, hash);
            self.store.write_batch(&batch)?;
        }
        Ok(())
    }

    pub fn increment_failure(&self, hash: &Hash256) -> Result<u32, ChainStateError> {
        let mut pending = match self.pending(hash)? {
            Some(pending) => pending,
            None => PendingBlock {
                hash: *hash,
                prev_hash: [0u8; 32],
                priority: 0,
                failure_count: 0,
                has_bytes: false,
            },
        };
        pending.failure_count = pending.failure_count.saturating_add(1);
        self.store
            .put(Column::PendingBlock, hash, &encode_pending(&pending))?;
        Ok(pending.failure_count)
    }

    pub fn children_of(&self, prev_hash: &Hash256) -> Result<Vec<PendingBlock>, ChainStateError> {
        let mut children = Vec::new();
        let rows = self.store.scan_prefix(Column::PendingBlock, &[])?;
        for (key, value) in rows {
            let hash: Hash256 = key
                .as_slice()
                .try_into()
                .map_err(|_| ChainStateError::CorruptRecord("corrupt pending block key"))?;
            let pending = decode_pending(hash, &value)
                .map_err(|_| ChainStateError::CorruptRecord("corrupt pending block record"))?;
            if &pending.prev_hash == prev_hash {
                children.push(pending);
            }
        }
        children.sort_by_key(|pending| pending.priority);
        Ok(children)
    }

    pub fn count(&self) -> Result<usize, ChainStateError> {
        Ok(self.store.scan_prefix(Column::PendingBlock, &[])?.len())
    }
}

/// Deletes processed pending blocks off the assembler's hot path. Hashes
/// are queued and a drain thread batches the deletes; dropping the queue
/// drains whatever is left and joins the thread.
pub struct DeletionQueue {
    sender: Option<Sender<Hash256>>,
    queued: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

impl DeletionQueue {
    pub fn start<S: KeyValueStore + Clone + Send + 'static>(store: S) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Hash256>();
        let queued = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&queued);
        let worker = thread::Builder::new()
            .name("pending-deletes".into())
            .spawn(move || Self::drain(store, receiver, counter))
            .expect("spawn pending-deletes thread");
        Self {
            sender: Some(sender),
            queued,
            worker: Some(worker),
        }
    }

    fn drain<S: KeyValueStore>(store: S, receiver: Receiver<Hash256>, counter: Arc<AtomicUsize>) {
        let mut hashes: Vec<Hash256> = Vec::with_capacity(DELETE_BATCH_SIZE);
        loop {
            match receiver.recv() {
                Ok(hash) => hashes.push(hash),
                Err(_) => break,
            }
            while hashes.len() < DELETE_BATCH_SIZE {
                match receiver.try_recv() {
                    Ok(hash) => hashes.push(hash),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
            let mut batch = WriteBatch::new();
            batch.reserve(hashes.len() * 2);
            for hash in &hashes {
                batch.delete(Column::PendingBlock, hash);
                batch.delete(Column::PendingBlockData, hash);
            }
            if let Err(err) = store.write_batch(&batch) {
                arbor_log::log_error!("pending block delete batch failed: {err}");
            }
            counter.fetch_sub(hashes.len(), Ordering::Release);
            hashes.clear();
        }
    }

    pub fn enqueue(&self, hash: Hash256) {
        if let Some(sender) = &self.sender {
            self.queued.fetch_add(1, Ordering::Release);
            if sender.send(hash).is_err() {
                self.queued.fetch_sub(1, Ordering::Release);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for queued deletes to land. Returns false on timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_primitives::block::BlockHeader;
    use arbor_primitives::outpoint::OutPoint;
    use arbor_primitives::transaction::{Transaction, TxIn, TxOut};
    use arbor_storage::memory::MemoryStore;

    fn sample_block(prev: Hash256, nonce: u32) -> Block {
        Block {
            header: BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time: 1_000 + nonce,
                bits: 1,
                nonce,
            },
            transactions: vec![Transaction {
                version: 1,
                inputs: vec![TxIn {
                    prevout: OutPoint::null(),
                    script_sig: vec![nonce as u8],
                    sequence: u32::MAX,
                }],
                outputs: vec![TxOut {
                    value: 50_000,
                    script_pubkey: vec![0x51],
                }],
                lock_time: 0,
            }],
        }
    }

    #[test]
    fn store_and_reload_block() {
        let store = Arc::new(MemoryStore::new());
        let pending = PendingBlockStore::new(Arc::clone(&store));
        let block = sample_block([0x01; 32], 7);
        let hash = pending.store_block(&block, 12).unwrap();

        let record = pending.pending(&hash).unwrap().unwrap();
        assert_eq!(record.prev_hash, [0x01; 32]);
        assert_eq!(record.priority, 12);
        assert!(record.has_bytes);
        assert_eq!(pending.block(&hash).unwrap().unwrap(), block);
    }

    #[test]
    fn failure_count_survives_redownload() {
        let store = Arc::new(MemoryStore::new());
        let pending = PendingBlockStore::new(Arc::clone(&store));
        let block = sample_block([0x01; 32], 7);
        let hash = block.hash();

        pending.register(hash, [0x01; 32], 5).unwrap();
        assert_eq!(pending.increment_failure(&hash).unwrap(), 1);
        assert_eq!(pending.increment_failure(&hash).unwrap(), 2);

        pending.store_block(&block, 5).unwrap();
        assert_eq!(pending.pending(&hash).unwrap().unwrap().failure_count, 2);
    }

    #[test]
    fn remove_block_data_keeps_metadata() {
        let store = Arc::new(MemoryStore::new());
        let pending = PendingBlockStore::new(Arc::clone(&store));
        let block = sample_block([0x01; 32], 7);
        let hash = pending.store_block(&block, 0).unwrap();

        pending.remove_block_data(&hash).unwrap();
        assert!(pending.block(&hash).unwrap().is_none());
        let record = pending.pending(&hash).unwrap().unwrap();
        assert!(!record.has_bytes);
    }

    #[test]
    fn children_sorted_by_priority() {
        let store = Arc::new(MemoryStore::new());
        let pending = PendingBlockStore::new(Arc::clone(&store));
        let prev = [0x02; 32];
        let a = sample_block(prev, 1);
        let b = sample_block(prev, 2);
        pending.store_block(&a, 9).unwrap();
        pending.store_block(&b, 3).unwrap();
        pending.register([0xee; 32], [0x03; 32], 1).unwrap();

        let children = pending.children_of(&prev).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].hash, b.hash());
        assert_eq!(children[1].hash, a.hash());
    }

    #[test]
    fn deletion_queue_drains() {
        let store = Arc::new(MemoryStore::new());
        let pending = PendingBlockStore::new(Arc::clone(&store));
        let block = sample_block([0x01; 32], 7);
        let hash = pending.store_block(&block, 0).unwrap();

        let queue = DeletionQueue::start(Arc::clone(&store));
        queue.enqueue(hash);
        assert!(queue.flush(Duration::from_secs(5)));
        assert!(pending.pending(&hash).unwrap().is_none());
        assert!(pending.block(&hash).unwrap().is_none());
    }
}
