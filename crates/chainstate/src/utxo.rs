//! Staged UTXO set with per-height durable commits.
//!
//! Block application stages created outputs (`Fresh`) and spend tombstones
//! (`Spent`) in memory, grouped by block height. A commit flushes whole
//! heights in order; each height is one atomic batch that also advances the
//! committed-height marker, so a crash mid-commit re-runs cleanly.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use arbor_primitives::block::Block;
use arbor_primitives::encoding::{DecodeError, Decoder, Encoder};
use arbor_primitives::outpoint::OutPoint;
use arbor_primitives::Hash256;
use arbor_storage::{Column, KeyValueStore, WriteBatch};

use crate::context::{BlockArchive, TransactionSource};
use crate::error::ChainStateError;
use crate::headers::HeaderStore;
use crate::params::ChainParams;
use crate::HeaderId;

const META_UTXO_COMMITTED_HEIGHT_KEY: &[u8] = b"utxo_committed_height";
const META_UTXO_COMMITTED_TIP_KEY: &[u8] = b"utxo_committed_tip";

const REBUILD_DELETE_BATCH: usize = 10_000;

pub const OUTPOINT_KEY_LEN: usize = 36;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnspentOutput {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
}

impl UnspentOutput {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(if self.is_coinbase { 1 } else { 0 });
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(outpoint: &OutPoint) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(&outpoint.hash);
        bytes[32..].copy_from_slice(&outpoint.index.to_le_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

#[derive(Clone, Debug)]
enum Staged {
    Fresh(UnspentOutput),
    Spent,
}

#[derive(Clone, Debug, Default)]
struct HeightDelta {
    tip: Hash256,
    created: Vec<(OutPointKey, UnspentOutput)>,
    spent: Vec<OutPointKey>,
}

struct Staging {
    by_key: HashMap<OutPointKey, Staged>,
    by_height: BTreeMap<u32, HeightDelta>,
    staged_height: u32,
    staged_tip: Option<Hash256>,
    consistent: bool,
}

fn check_position(staging: &mut Staging, block: &Block, height: u32) -> Result<(), ChainStateError> {
    let expected = staging.staged_height + 1;
    if height != expected {
        staging.consistent = false;
        return Err(ChainStateError::OutOfOrderApply {
            expected,
            actual: height,
        });
    }
    if let Some(tip) = staging.staged_tip {
        if block.header.prev_block != tip {
            staging.consistent = false;
            return Err(ChainStateError::BranchMismatch);
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommitMode {
    Blocking,
    SkipIfBusy,
}

pub struct UtxoManager<S> {
    store: S,
    staging: Mutex<Staging>,
    commit_lock: Mutex<()>,
    commit_frequency: u32,
    staging_capacity: usize,
    transactions: Arc<dyn TransactionSource>,
}

impl<S: KeyValueStore + Clone> UtxoManager<S> {
    pub fn open(
        store: S,
        params: &ChainParams,
        transactions: Arc<dyn TransactionSource>,
    ) -> Result<Self, ChainStateError> {
        let committed = match store.get(Column::Meta, META_UTXO_COMMITTED_HEIGHT_KEY)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainStateError::CorruptRecord("corrupt utxo height"))?;
                u32::from_le_bytes(raw)
            }
            None => 0,
        };
        let tip = match store.get(Column::Meta, META_UTXO_COMMITTED_TIP_KEY)? {
            Some(bytes) => {
                let raw: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainStateError::CorruptRecord("corrupt utxo tip"))?;
                Some(raw)
            }
            None => None,
        };
        Ok(Self {
            store,
            staging: Mutex::new(Staging {
                by_key: HashMap::new(),
                by_height: BTreeMap::new(),
                staged_height: committed,
                staged_tip: tip,
                consistent: true,
            }),
            commit_lock: Mutex::new(()),
            commit_frequency: params.utxo_commit_frequency,
            staging_capacity: params.utxo_staging_capacity,
            transactions,
        })
    }

    pub fn committed_height(&self) -> Result<u32, ChainStateError> {
        match self.store.get(Column::Meta, META_UTXO_COMMITTED_HEIGHT_KEY)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainStateError::CorruptRecord("corrupt utxo height"))?;
                Ok(u32::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    pub fn staged_height(&self) -> u32 {
        self.staging.lock().expect("utxo staging").staged_height
    }

    pub fn staging_len(&self) -> usize {
        self.staging.lock().expect("utxo staging").by_key.len()
    }

    pub fn is_consistent(&self) -> bool {
        self.staging.lock().expect("utxo staging").consistent
    }

    /// Anchors the set below the first applicable block. Used once the
    /// genesis block is stored: its outputs stay out of the set, so the
    /// committed height is 0 with the genesis hash as tip.
    pub fn set_base(&self, height: u32, tip: Hash256) -> Result<(), ChainStateError> {
        let mut batch = WriteBatch::new();
        batch.put(
            Column::Meta,
            META_UTXO_COMMITTED_HEIGHT_KEY,
            height.to_le_bytes(),
        );
        batch.put(Column::Meta, META_UTXO_COMMITTED_TIP_KEY, tip);
        self.store.write_batch(&batch)?;
        let mut staging = self.staging.lock().expect("utxo staging");
        staging.staged_height = height;
        staging.staged_tip = Some(tip);
        staging.consistent = true;
        Ok(())
    }

    pub fn find(&self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>, ChainStateError> {
        let key = OutPointKey::new(outpoint);
        {
            let staging = self.staging.lock().expect("utxo staging");
            match staging.by_key.get(&key) {
                Some(Staged::Fresh(entry)) => return Ok(Some(entry.clone())),
                Some(Staged::Spent) => return Ok(None),
                None => {}
            }
        }
        if let Some(bytes) = self.store.get(Column::Utxo, key.as_bytes())? {
            let entry = UnspentOutput::decode(&bytes)
                .map_err(|_| ChainStateError::CorruptRecord("corrupt utxo entry"))?;
            return Ok(Some(entry));
        }
        // Legacy fallback: outputs never indexed into the set (genesis and
        // pre-index blocks) are resolved through the transaction source.
        if let Some(tx) = self.transactions.transaction(&outpoint.hash)? {
            if (outpoint.index as usize) < tx.outputs.len() {
                let output = &tx.outputs[outpoint.index as usize];
                return Ok(Some(UnspentOutput {
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    height: 0,
                    is_coinbase: tx.is_coinbase(),
                }));
            }
        }
        Ok(None)
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> Result<bool, ChainStateError> {
        let key = OutPointKey::new(outpoint);
        {
            let staging = self.staging.lock().expect("utxo staging");
            match staging.by_key.get(&key) {
                Some(Staged::Fresh(_)) => return Ok(false),
                Some(Staged::Spent) => return Ok(true),
                None => {}
            }
        }
        Ok(self.find(outpoint)?.is_none())
    }

    /// Stages freshly created outputs for `height`.
    pub fn insert_outputs(
        &self,
        outputs: &[(OutPoint, UnspentOutput)],
        height: u32,
    ) -> Result<(), ChainStateError> {
        let mut staging = self.staging.lock().expect("utxo staging");
        let delta = staging.by_height.entry(height).or_default();
        let mut keys = Vec::with_capacity(outputs.len());
        for (outpoint, entry) in outputs {
            let key = OutPointKey::new(outpoint);
            delta.created.push((key, entry.clone()));
            keys.push((key, entry.clone()));
        }
        for (key, entry) in keys {
            staging.by_key.insert(key, Staged::Fresh(entry));
        }
        Ok(())
    }

    /// Stages spend tombstones for `height`. A staged tombstone answers
    /// lookups as "not found" immediately; the durable delete happens at
    /// commit.
    pub fn mark_spent(&self, outpoints: &[OutPoint], height: u32) -> Result<(), ChainStateError> {
        let mut staging = self.staging.lock().expect("utxo staging");
        let keys: Vec<OutPointKey> = outpoints.iter().map(OutPointKey::new).collect();
        let delta = staging.by_height.entry(height).or_default();
        delta.spent.extend(keys.iter().copied());
        for key in keys {
            staging.by_key.insert(key, Staged::Spent);
        }
        Ok(())
    }

    /// Applies a block's UTXO diff. Blocks must arrive in height order along
    /// one branch; anything else marks the staging layer inconsistent and
    /// reports a structural error for the caller to resolve by rebuilding.
    pub fn apply_block(&self, block: &Block, height: u32) -> Result<(), ChainStateError> {
        // Position checks come first: a mispositioned apply must not force
        // a durable commit.
        {
            let mut staging = self.staging.lock().expect("utxo staging");
            check_position(&mut staging, block, height)?;
        }

        if self.commit_frequency > 0 && height % self.commit_frequency == 0 {
            self.commit(CommitMode::Blocking)?;
        } else if self.staging_len() > self.staging_capacity {
            self.commit(CommitMode::SkipIfBusy)?;
        }

        let block_hash = block.header.hash();

        // Diff: all created outputs minus the ones consumed within the same
        // block; those never leave staging.
        let mut created: HashMap<OutPointKey, UnspentOutput> = HashMap::new();
        let mut order: Vec<OutPointKey> = Vec::new();
        for tx in &block.transactions {
            let txid = tx.txid();
            let is_coinbase = tx.is_coinbase();
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, index as u32);
                let key = OutPointKey::new(&outpoint);
                created.insert(
                    key,
                    UnspentOutput {
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height,
                        is_coinbase,
                    },
                );
                order.push(key);
            }
        }
        let mut spent: Vec<OutPointKey> = Vec::new();
        for tx in &block.transactions {
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                let key = OutPointKey::new(&input.prevout);
                if created.remove(&key).is_none() {
                    spent.push(key);
                }
            }
        }

        let mut staging = self.staging.lock().expect("utxo staging");
        check_position(&mut staging, block, height)?;

        let mut delta = HeightDelta {
            tip: block_hash,
            created: Vec::with_capacity(created.len()),
            spent: spent.clone(),
        };
        for key in order {
            if let Some(entry) = created.remove(&key) {
                delta.created.push((key, entry));
            }
        }
        for (key, entry) in &delta.created {
            staging.by_key.insert(*key, Staged::Fresh(entry.clone()));
        }
        for key in spent {
            staging.by_key.insert(key, Staged::Spent);
        }
        staging.by_height.insert(height, delta);
        staging.staged_height = height;
        staging.staged_tip = Some(block_hash);
        Ok(())
    }

    /// Unwinds the topmost staged block. Only valid for the block at the
    /// current staged height.
    pub fn undo_block(&self, block: &Block, height: u32) -> Result<(), ChainStateError> {
        let mut staging = self.staging.lock().expect("utxo staging");
        if height != staging.staged_height {
            staging.consistent = false;
            return Err(ChainStateError::OutOfOrderApply {
                expected: staging.staged_height,
                actual: height,
            });
        }

        if let Some(delta) = staging.by_height.remove(&height) {
            // Uncommitted: pure staging surgery.
            for (key, _) in &delta.created {
                staging.by_key.remove(key);
            }
            for key in &delta.spent {
                staging.by_key.remove(key);
                // A spend of an output staged at a lower height must surface
                // the Fresh entry again.
                let restored = staging.by_height.values().rev().find_map(|earlier| {
                    earlier
                        .created
                        .iter()
                        .find(|(created_key, _)| created_key == key)
                        .map(|(_, entry)| entry.clone())
                });
                if let Some(entry) = restored {
                    staging.by_key.insert(*key, Staged::Fresh(entry));
                }
            }
        } else {
            // Already committed: rewrite the durable set.
            let mut batch = WriteBatch::new();
            for tx in &block.transactions {
                let txid = tx.txid();
                for index in 0..tx.outputs.len() {
                    let outpoint = OutPoint::new(txid, index as u32);
                    batch.delete(Column::Utxo, OutPointKey::new(&outpoint).as_bytes());
                }
            }
            for tx in &block.transactions {
                if tx.is_coinbase() {
                    continue;
                }
                for input in &tx.inputs {
                    let source = self
                        .transactions
                        .transaction(&input.prevout.hash)?
                        .ok_or_else(|| {
                            staging.consistent = false;
                            ChainStateError::MissingTransaction
                        })?;
                    let output = source
                        .outputs
                        .get(input.prevout.index as usize)
                        .ok_or(ChainStateError::MissingTransaction)?;
                    let entry = UnspentOutput {
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height: 0,
                        is_coinbase: source.is_coinbase(),
                    };
                    batch.put(
                        Column::Utxo,
                        OutPointKey::new(&input.prevout).as_bytes(),
                        entry.encode(),
                    );
                }
            }
            batch.put(
                Column::Meta,
                META_UTXO_COMMITTED_HEIGHT_KEY,
                (height - 1).to_le_bytes(),
            );
            batch.put(
                Column::Meta,
                META_UTXO_COMMITTED_TIP_KEY,
                block.header.prev_block,
            );
            self.store.write_batch(&batch)?;
        }

        staging.staged_height = height - 1;
        staging.staged_tip = Some(block.header.prev_block);
        Ok(())
    }

    /// Flushes staged heights in ascending order. Returns false when
    /// `SkipIfBusy` found a commit already in flight.
    pub fn commit(&self, mode: CommitMode) -> Result<bool, ChainStateError> {
        let _guard = match mode {
            CommitMode::Blocking => self.commit_lock.lock().expect("utxo commit lock"),
            CommitMode::SkipIfBusy => match self.commit_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    arbor_log::log_debug!("utxo commit already in flight; skipping");
                    return Ok(false);
                }
            },
        };

        let deltas = {
            let mut staging = self.staging.lock().expect("utxo staging");
            if staging.by_height.is_empty() {
                return Ok(true);
            }
            mem::take(&mut staging.by_height)
        };

        let start = Instant::now();
        let mut flushed = 0usize;
        let mut last_height = 0u32;
        let mut iter = deltas.into_iter();
        while let Some((height, delta)) = iter.next() {
            let mut batch = WriteBatch::new();
            batch.reserve(delta.created.len() + delta.spent.len() + 2);
            for (key, entry) in &delta.created {
                batch.put(Column::Utxo, key.as_bytes(), entry.encode());
            }
            for key in &delta.spent {
                batch.delete(Column::Utxo, key.as_bytes());
            }
            batch.put(
                Column::Meta,
                META_UTXO_COMMITTED_HEIGHT_KEY,
                height.to_le_bytes(),
            );
            batch.put(Column::Meta, META_UTXO_COMMITTED_TIP_KEY, delta.tip);
            if let Err(err) = self.store.write_batch(&batch) {
                let mut staging = self.staging.lock().expect("utxo staging");
                staging.by_height.insert(height, delta);
                for (height, delta) in iter {
                    staging.by_height.insert(height, delta);
                }
                staging.consistent = false;
                return Err(err.into());
            }
            flushed += 1;
            last_height = height;
        }

        {
            let mut staging = self.staging.lock().expect("utxo staging");
            let live: HashSet<OutPointKey> = staging
                .by_height
                .values()
                .flat_map(|delta| {
                    delta
                        .created
                        .iter()
                        .map(|(key, _)| *key)
                        .chain(delta.spent.iter().copied())
                })
                .collect();
            staging.by_key.retain(|key, _| live.contains(key));
        }

        arbor_log::log_debug!(
            "utxo commit: {flushed} height(s) through {last_height} in {}ms",
            start.elapsed().as_millis()
        );
        Ok(true)
    }

    /// Clears the staged (and optionally committed) set and replays blocks
    /// along the branch ending at `head` from the block archive.
    pub fn rebuild(
        &self,
        headers: &HeaderStore<S>,
        archive: &dyn BlockArchive,
        head: HeaderId,
        from_scratch: bool,
    ) -> Result<(), ChainStateError> {
        {
            let _guard = self.commit_lock.lock().expect("utxo commit lock");
            let mut staging = self.staging.lock().expect("utxo staging");
            staging.by_key.clear();
            staging.by_height.clear();

            if from_scratch {
                let mut keys: Vec<Vec<u8>> = Vec::new();
                self.store
                    .for_each_prefix(Column::Utxo, &[], &mut |key, _| {
                        keys.push(key.to_vec());
                        Ok(())
                    })?;
                for chunk in keys.chunks(REBUILD_DELETE_BATCH) {
                    let mut batch = WriteBatch::new();
                    for key in chunk {
                        batch.delete(Column::Utxo, key.clone());
                    }
                    self.store.write_batch(&batch)?;
                }
                let genesis = headers.params().genesis_hash;
                let mut batch = WriteBatch::new();
                batch.put(Column::Meta, META_UTXO_COMMITTED_HEIGHT_KEY, 0u32.to_le_bytes());
                batch.put(Column::Meta, META_UTXO_COMMITTED_TIP_KEY, genesis);
                self.store.write_batch(&batch)?;
                staging.staged_height = 0;
                staging.staged_tip = Some(genesis);
            } else {
                let committed = match self.store.get(Column::Meta, META_UTXO_COMMITTED_HEIGHT_KEY)? {
                    Some(bytes) => {
                        let raw: [u8; 4] = bytes
                            .as_slice()
                            .try_into()
                            .map_err(|_| ChainStateError::CorruptRecord("corrupt utxo height"))?;
                        u32::from_le_bytes(raw)
                    }
                    None => 0,
                };
                let tip = self
                    .store
                    .get(Column::Meta, META_UTXO_COMMITTED_TIP_KEY)?
                    .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok());
                staging.staged_height = committed;
                staging.staged_tip = tip;
            }
            staging.consistent = true;
        }

        let base_height = self.staged_height();
        let head_record = headers.record(head)?.ok_or(ChainStateError::MissingHeader)?;
        let mut replay: Vec<HeaderId> = Vec::new();
        let mut current = Some(head);
        let mut current_height = head_record.height;
        while let Some(id) = current {
            if current_height <= base_height {
                break;
            }
            replay.push(id);
            let record = headers.record(id)?.ok_or(ChainStateError::MissingHeader)?;
            current = record.parent_id;
            current_height = record.height.saturating_sub(1);
        }
        replay.reverse();

        let replayed = replay.len();
        for id in replay {
            let record = headers.record(id)?.ok_or(ChainStateError::MissingHeader)?;
            let hash = record.header.hash();
            let block = archive
                .read_block(&hash)?
                .ok_or(ChainStateError::MissingBlock)?;
            self.apply_block(&block, record.height)?;
        }
        self.commit(CommitMode::Blocking)?;
        arbor_log::log_info!(
            "utxo rebuild: replayed {replayed} block(s) to height {}",
            self.staged_height()
        );
        Ok(())
    }
}
