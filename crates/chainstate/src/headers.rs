//! Header store: insertion under the write token, segment assignment,
//! ancestor walks, invalid-header counters and head pointers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arbor_primitives::block::BlockHeader;
use arbor_primitives::encoding::{Decodable, Decoder, Encodable, Encoder};
use arbor_primitives::Hash256;
use arbor_storage::{Column, KeyValueStore, WriteBatch};
use primitive_types::U256;

use crate::cache::StoreCache;
use crate::context::WorkSource;
use crate::error::ChainStateError;
use crate::lock::WriteToken;
use crate::params::ChainParams;
use crate::segment::{SegmentForest, SegmentRelation};
use crate::{HeaderId, SegmentId};

const META_NEXT_HEADER_ID_KEY: &[u8] = b"next_header_id";
const META_BEST_HEADER_KEY: &[u8] = b"best_header";
const META_HEAD_BLOCK_KEY: &[u8] = b"head_block";

const HEADER_CACHE_CAPACITY: usize = 100_000;
const HEADER_ID_CACHE_CAPACITY: usize = 100_000;

/// Number of timestamps (the header itself plus its ancestors) feeding the
/// median-time-past calculation.
const MTP_WINDOW_SIZE: usize = 11;

#[derive(Clone, Debug)]
pub struct HeaderRecord {
    pub header: BlockHeader,
    pub height: u32,
    pub chain_work: [u8; 32],
    pub median_time: u32,
    pub segment_id: SegmentId,
    pub parent_id: Option<HeaderId>,
    pub has_block: bool,
    pub byte_count: u32,
}

impl HeaderRecord {
    pub fn chain_work_value(&self) -> U256 {
        U256::from_big_endian(&self.chain_work)
    }
}

pub fn header_key(id: HeaderId) -> [u8; 8] {
    id.to_be_bytes()
}

pub fn segment_height_key(segment: SegmentId, height: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&segment.to_be_bytes());
    key[8..].copy_from_slice(&height.to_be_bytes());
    key
}

fn encode_record(record: &HeaderRecord) -> Vec<u8> {
    let mut encoder = Encoder::new();
    record.header.consensus_encode(&mut encoder);
    encoder.write_u32_le(record.height);
    encoder.write_bytes(&record.chain_work);
    encoder.write_u32_le(record.median_time);
    encoder.write_u64_le(record.segment_id);
    match record.parent_id {
        Some(parent) => {
            encoder.write_u8(1);
            encoder.write_u64_le(parent);
        }
        None => encoder.write_u8(0),
    }
    encoder.write_u8(record.has_block as u8);
    encoder.write_u32_le(record.byte_count);
    encoder.into_inner()
}

fn decode_record(bytes: &[u8]) -> Result<HeaderRecord, ChainStateError> {
    let corrupt = |_| ChainStateError::CorruptRecord("corrupt header record");
    let mut decoder = Decoder::new(bytes);
    let header = BlockHeader::consensus_decode(&mut decoder).map_err(corrupt)?;
    let height = decoder.read_u32_le().map_err(corrupt)?;
    let chain_work = decoder.read_fixed::<32>().map_err(corrupt)?;
    let median_time = decoder.read_u32_le().map_err(corrupt)?;
    let segment_id = decoder.read_u64_le().map_err(corrupt)?;
    let parent_id = if decoder.read_u8().map_err(corrupt)? != 0 {
        Some(decoder.read_u64_le().map_err(corrupt)?)
    } else {
        None
    };
    let has_block = decoder.read_u8().map_err(corrupt)? != 0;
    let byte_count = decoder.read_u32_le().map_err(corrupt)?;
    if !decoder.is_empty() {
        return Err(ChainStateError::CorruptRecord("corrupt header record"));
    }
    Ok(HeaderRecord {
        header,
        height,
        chain_work,
        median_time,
        segment_id,
        parent_id,
        has_block,
        byte_count,
    })
}

fn decode_id(bytes: &[u8]) -> Result<HeaderId, ChainStateError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ChainStateError::CorruptRecord("corrupt header id"))?;
    Ok(u64::from_le_bytes(raw))
}

pub struct HeaderStore<S> {
    store: S,
    forest: SegmentForest<S>,
    params: ChainParams,
    work: Arc<dyn WorkSource>,
    next_id: AtomicU64,
    records: Mutex<StoreCache<HeaderId, HeaderRecord>>,
    ids: Mutex<StoreCache<Hash256, HeaderId>>,
}

impl<S: KeyValueStore + Clone> HeaderStore<S> {
    pub fn open(
        store: S,
        params: ChainParams,
        work: Arc<dyn WorkSource>,
    ) -> Result<Self, ChainStateError> {
        let forest = SegmentForest::open(store.clone())?;
        let next_id = match store.get(Column::Meta, META_NEXT_HEADER_ID_KEY)? {
            Some(bytes) => decode_id(&bytes)?,
            None => 1,
        };
        Ok(Self {
            store,
            forest,
            params,
            work,
            next_id: AtomicU64::new(next_id),
            records: Mutex::new(StoreCache::new(HEADER_CACHE_CAPACITY)),
            ids: Mutex::new(StoreCache::new(HEADER_ID_CACHE_CAPACITY)),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn forest(&self) -> &SegmentForest<S> {
        &self.forest
    }

    pub fn record(&self, id: HeaderId) -> Result<Option<HeaderRecord>, ChainStateError> {
        if let Some(record) = self.records.lock().expect("header cache").get(&id) {
            return Ok(Some(record));
        }
        let Some(bytes) = self.store.get(Column::Header, &header_key(id))? else {
            return Ok(None);
        };
        let record = decode_record(&bytes)?;
        self.records
            .lock()
            .expect("header cache")
            .insert(id, record.clone());
        Ok(Some(record))
    }

    pub fn header_id(&self, hash: &Hash256) -> Result<Option<HeaderId>, ChainStateError> {
        if let Some(id) = self.ids.lock().expect("header id cache").get(hash) {
            return Ok(Some(id));
        }
        let Some(bytes) = self.store.get(Column::HeaderHash, hash)? else {
            return Ok(None);
        };
        let id = decode_id(&bytes)?;
        self.ids.lock().expect("header id cache").insert(*hash, id);
        Ok(Some(id))
    }

    /// Looks a header up by hash, verifying that the stored fields still
    /// hash to the requested value. A mismatch is reported as absent.
    pub fn header_by_hash(&self, hash: &Hash256) -> Result<Option<HeaderRecord>, ChainStateError> {
        let Some(id) = self.header_id(hash)? else {
            return Ok(None);
        };
        let Some(record) = self.record(id)? else {
            return Ok(None);
        };
        if record.header.hash() != *hash {
            arbor_log::log_warn!(
                "header record {id} does not hash to its index entry; treating as missing"
            );
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub fn header(&self, id: HeaderId) -> Result<Option<BlockHeader>, ChainStateError> {
        Ok(self.record(id)?.map(|record| record.header))
    }

    pub fn hash(&self, id: HeaderId) -> Result<Option<Hash256>, ChainStateError> {
        Ok(self.record(id)?.map(|record| record.header.hash()))
    }

    pub fn height(&self, id: HeaderId) -> Result<Option<u32>, ChainStateError> {
        Ok(self.record(id)?.map(|record| record.height))
    }

    pub fn chain_work(&self, id: HeaderId) -> Result<Option<U256>, ChainStateError> {
        Ok(self.record(id)?.map(|record| record.chain_work_value()))
    }

    pub fn median_time(&self, id: HeaderId) -> Result<Option<u32>, ChainStateError> {
        Ok(self.record(id)?.map(|record| record.median_time))
    }

    /// Walks `n` parent links up from `id`.
    pub fn ancestor(&self, id: HeaderId, n: u32) -> Result<Option<HeaderId>, ChainStateError> {
        let mut current = id;
        for _ in 0..n {
            let Some(record) = self.record(current)? else {
                return Ok(None);
            };
            let Some(parent) = record.parent_id else {
                return Ok(None);
            };
            current = parent;
        }
        Ok(Some(current))
    }

    pub fn header_at(
        &self,
        segment: SegmentId,
        height: u32,
    ) -> Result<Option<HeaderId>, ChainStateError> {
        let key = segment_height_key(segment, height);
        match self.store.get(Column::SegmentHeight, &key)? {
            Some(bytes) => Ok(Some(decode_id(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn max_height_of_segment(
        &self,
        segment: SegmentId,
    ) -> Result<Option<u32>, ChainStateError> {
        let entries = self
            .store
            .scan_prefix(Column::SegmentHeight, &segment.to_be_bytes())?;
        let Some((key, _)) = entries.last() else {
            return Ok(None);
        };
        let raw: [u8; 4] = key[8..]
            .try_into()
            .map_err(|_| ChainStateError::CorruptRecord("corrupt segment height key"))?;
        Ok(Some(u32::from_be_bytes(raw)))
    }

    pub fn first_of_segment(&self, segment: SegmentId) -> Result<Option<HeaderId>, ChainStateError> {
        let entries = self
            .store
            .scan_prefix(Column::SegmentHeight, &segment.to_be_bytes())?;
        match entries.first() {
            Some((_, value)) => Ok(Some(decode_id(value)?)),
            None => Ok(None),
        }
    }

    /// Highest header stored within `segment` itself.
    pub fn head_of_segment(&self, segment: SegmentId) -> Result<Option<HeaderId>, ChainStateError> {
        match self.max_height_of_segment(segment)? {
            Some(height) => self.header_at(segment, height),
            None => Ok(None),
        }
    }

    /// Tip of the branch ending in `segment`: the highest header of the
    /// nearest ancestor segment that holds any headers.
    pub fn head_of_branch(&self, segment: SegmentId) -> Result<Option<HeaderId>, ChainStateError> {
        let mut current = Some(segment);
        while let Some(segment_id) = current {
            if let Some(id) = self.head_of_segment(segment_id)? {
                return Ok(Some(id));
            }
            current = self
                .forest
                .get(segment_id)
                .ok_or(ChainStateError::MissingSegment)?
                .parent;
        }
        Ok(None)
    }

    pub fn branch_work(&self, segment: SegmentId) -> Result<U256, ChainStateError> {
        match self.head_of_branch(segment)? {
            Some(id) => Ok(self.chain_work(id)?.unwrap_or_default()),
            None => Ok(U256::zero()),
        }
    }

    /// The child of `parent` leading toward `segment`: a child whose segment
    /// is `segment` itself or an ancestor of it.
    pub fn child_along_segment(
        &self,
        segment: SegmentId,
        parent: HeaderId,
    ) -> Result<Option<HeaderId>, ChainStateError> {
        for child in self.children_of(parent)? {
            let Some(record) = self.record(child)? else {
                continue;
            };
            if self
                .forest
                .are_connected(record.segment_id, segment, SegmentRelation::Ancestor)
            {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// Direct children of `parent`: the next header along its own segment
    /// plus the first header of each child segment forking off at that
    /// height.
    pub fn children_of(&self, parent: HeaderId) -> Result<Vec<HeaderId>, ChainStateError> {
        let parent_record = self.record(parent)?.ok_or(ChainStateError::MissingHeader)?;
        let child_height = parent_record.height + 1;
        let mut children = Vec::new();
        let mut consider = |store: &Self, id: HeaderId| -> Result<(), ChainStateError> {
            if let Some(record) = store.record(id)? {
                if record.parent_id == Some(parent) {
                    children.push(id);
                }
            }
            Ok(())
        };
        if let Some(id) = self.header_at(parent_record.segment_id, child_height)? {
            consider(self, id)?;
        }
        for segment in self.forest.children_of(parent_record.segment_id) {
            if let Some(id) = self.header_at(segment, child_height)? {
                consider(self, id)?;
            }
        }
        Ok(children)
    }

    pub fn best_header_id(&self) -> Result<Option<HeaderId>, ChainStateError> {
        match self.store.get(Column::Meta, META_BEST_HEADER_KEY)? {
            Some(bytes) => Ok(Some(decode_id(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn head_block_id(&self) -> Result<Option<HeaderId>, ChainStateError> {
        match self.store.get(Column::Meta, META_HEAD_BLOCK_KEY)? {
            Some(bytes) => Ok(Some(decode_id(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Hash of the deepest block-connected header, when one exists.
    pub fn head_hash(&self) -> Result<Option<Hash256>, ChainStateError> {
        match self.head_block_id()? {
            Some(id) => self.hash(id),
            None => Ok(None),
        }
    }

    pub fn set_head_block(
        &self,
        _token: &mut WriteToken,
        id: HeaderId,
    ) -> Result<(), ChainStateError> {
        self.store
            .put(Column::Meta, META_HEAD_BLOCK_KEY, &id.to_le_bytes())?;
        Ok(())
    }

    pub fn set_has_block(
        &self,
        _token: &mut WriteToken,
        id: HeaderId,
        byte_count: u32,
    ) -> Result<(), ChainStateError> {
        let mut record = self.record(id)?.ok_or(ChainStateError::MissingHeader)?;
        record.has_block = true;
        record.byte_count = byte_count;
        self.store
            .put(Column::Header, &header_key(id), &encode_record(&record))?;
        self.records.lock().expect("header cache").insert(id, record);
        Ok(())
    }

    /// Overwrites the stored header fields for `hash`. The replacement must
    /// hash to the same value; identity never changes.
    pub fn repair_header(
        &self,
        _token: &mut WriteToken,
        hash: &Hash256,
        header: &BlockHeader,
    ) -> Result<(), ChainStateError> {
        if header.hash() != *hash {
            return Err(ChainStateError::CorruptRecord(
                "replacement header does not match hash",
            ));
        }
        let id = self.header_id(hash)?.ok_or(ChainStateError::MissingHeader)?;
        let mut record = self.record(id)?.ok_or(ChainStateError::MissingHeader)?;
        record.header = *header;
        self.store
            .put(Column::Header, &header_key(id), &encode_record(&record))?;
        self.records.lock().expect("header cache").insert(id, record);
        Ok(())
    }

    pub fn insert_header(
        &self,
        token: &mut WriteToken,
        header: &BlockHeader,
    ) -> Result<HeaderId, ChainStateError> {
        self.insert_header_inner(token, header, None)
            .map(|(id, _)| id)
    }

    /// Returns the id plus the assigned segment when the header was newly
    /// inserted (None for a duplicate). `inherited_segment` short-circuits
    /// segment resolution for a header known to be the sole child of its
    /// parent.
    fn insert_header_inner(
        &self,
        token: &mut WriteToken,
        header: &BlockHeader,
        inherited_segment: Option<SegmentId>,
    ) -> Result<(HeaderId, Option<SegmentId>), ChainStateError> {
        let hash = header.hash();
        if let Some(id) = self.header_id(&hash)? {
            return Ok((id, None));
        }

        let is_genesis = hash == self.params.genesis_hash;
        if self.forest.is_empty() && !is_genesis {
            return Err(ChainStateError::NoRootSegment);
        }

        let (height, parent_id, parent_record) = if is_genesis {
            (0u32, None, None)
        } else {
            let parent_id = self
                .header_id(&header.prev_block)?
                .ok_or(ChainStateError::UnknownParent)?;
            let parent_record = self
                .record(parent_id)?
                .ok_or(ChainStateError::MissingHeader)?;
            (parent_record.height + 1, Some(parent_id), Some(parent_record))
        };

        if let Some(checkpoint) = self.params.checkpoint_at(height) {
            if checkpoint.hash != hash {
                return Err(ChainStateError::CheckpointMismatch { height });
            }
        }

        let parent_work = parent_record
            .as_ref()
            .map(|record| record.chain_work_value())
            .unwrap_or_default();
        let chain_work = (parent_work + self.work.block_work(header.bits)).to_big_endian();
        let median_time = self.median_time_past(header, parent_id)?;

        let segment_id = match (parent_id, parent_record.as_ref(), inherited_segment) {
            (None, _, _) => self.forest.create_segment(token, None)?,
            (Some(_), Some(_), Some(segment)) => segment,
            (Some(parent_id), Some(parent_record), None) => {
                let siblings = self.children_of(parent_id)?;
                if siblings.is_empty() {
                    parent_record.segment_id
                } else {
                    let parent_segment = parent_record.segment_id;
                    let segment_tip = self.max_height_of_segment(parent_segment)?;
                    if segment_tip.map_or(false, |tip| tip > parent_record.height) {
                        self.split_segment_at(token, parent_segment, parent_record.height + 1)?;
                    }
                    arbor_log::log_debug!(
                        "fork at height {height}: new segment under {parent_segment}"
                    );
                    self.forest.create_segment(token, Some(parent_segment))?
                }
            }
            (Some(_), None, _) => unreachable!("parent record loaded with parent id"),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = HeaderRecord {
            header: *header,
            height,
            chain_work,
            median_time,
            segment_id,
            parent_id,
            has_block: false,
            byte_count: 0,
        };

        let mut batch = WriteBatch::new();
        batch.put(Column::Header, header_key(id), encode_record(&record));
        batch.put(Column::HeaderHash, hash, id.to_le_bytes());
        batch.put(
            Column::SegmentHeight,
            segment_height_key(segment_id, height),
            id.to_le_bytes(),
        );
        batch.put(Column::Meta, META_NEXT_HEADER_ID_KEY, (id + 1).to_le_bytes());

        let best_work = match self.best_header_id()? {
            Some(best) => self.chain_work(best)?.unwrap_or_default(),
            None => U256::zero(),
        };
        if record.chain_work_value() > best_work {
            batch.put(Column::Meta, META_BEST_HEADER_KEY, id.to_le_bytes());
        }

        self.store.write_batch(&batch)?;
        self.records.lock().expect("header cache").insert(id, record);
        self.ids.lock().expect("header id cache").insert(hash, id);
        Ok((id, Some(segment_id)))
    }

    /// Inserts a pre-connected run of headers. Each header after the first
    /// must extend its predecessor. Segment resolution runs once: a header
    /// following a newly inserted predecessor is that predecessor's only
    /// child and inherits its segment directly, skipping the sibling and
    /// split checks.
    pub fn insert_header_batch(
        &self,
        token: &mut WriteToken,
        headers: &[BlockHeader],
    ) -> Result<Vec<HeaderId>, ChainStateError> {
        for pair in headers.windows(2) {
            if pair[1].prev_block != pair[0].hash() {
                return Err(ChainStateError::OutOfOrderBatch);
            }
        }
        let mut ids = Vec::with_capacity(headers.len());
        let mut inherited: Option<SegmentId> = None;
        for header in headers {
            let (id, segment) = self.insert_header_inner(token, header, inherited)?;
            inherited = segment;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn invalid_count(&self, hash: &Hash256) -> Result<u32, ChainStateError> {
        match self.store.get(Column::InvalidHeader, hash)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainStateError::CorruptRecord("corrupt invalid counter"))?;
                Ok(u32::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    pub fn is_invalid(&self, hash: &Hash256) -> Result<bool, ChainStateError> {
        Ok(self.invalid_count(hash)? >= self.params.invalid_process_threshold)
    }

    pub fn mark_invalid(&self, hash: &Hash256, delta: u32) -> Result<u32, ChainStateError> {
        let count = self.invalid_count(hash)?.saturating_add(delta);
        self.store
            .put(Column::InvalidHeader, hash, &count.to_le_bytes())?;
        Ok(count)
    }

    pub fn clear_invalid(&self, hash: &Hash256, delta: u32) -> Result<u32, ChainStateError> {
        let count = self.invalid_count(hash)?.saturating_sub(delta);
        if count == 0 {
            self.store.delete(Column::InvalidHeader, hash)?;
        } else {
            self.store
                .put(Column::InvalidHeader, hash, &count.to_le_bytes())?;
        }
        Ok(count)
    }

    fn median_time_past(
        &self,
        header: &BlockHeader,
        parent_id: Option<HeaderId>,
    ) -> Result<u32, ChainStateError> {
        let mut times = Vec::with_capacity(MTP_WINDOW_SIZE);
        times.push(header.time);
        let mut current = parent_id;
        while times.len() < MTP_WINDOW_SIZE {
            let Some(id) = current else {
                break;
            };
            let record = self.record(id)?.ok_or(ChainStateError::MissingHeader)?;
            times.push(record.header.time);
            current = record.parent_id;
        }
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }

    /// Moves the header rows of `segment` at or above `at_height` into a
    /// freshly split child segment.
    fn split_segment_at(
        &self,
        token: &mut WriteToken,
        segment: SegmentId,
        at_height: u32,
    ) -> Result<SegmentId, ChainStateError> {
        let new_segment = self.forest.split_segment(token, segment)?;
        let entries = self
            .store
            .scan_prefix(Column::SegmentHeight, &segment.to_be_bytes())?;
        let mut batch = WriteBatch::new();
        let mut moved = Vec::new();
        for (key, value) in entries {
            let raw: [u8; 4] = key[8..]
                .try_into()
                .map_err(|_| ChainStateError::CorruptRecord("corrupt segment height key"))?;
            let height = u32::from_be_bytes(raw);
            if height < at_height {
                continue;
            }
            let id = decode_id(&value)?;
            let mut record = self.record(id)?.ok_or(ChainStateError::MissingHeader)?;
            record.segment_id = new_segment;
            batch.put(Column::Header, header_key(id), encode_record(&record));
            batch.delete(Column::SegmentHeight, key);
            batch.put(
                Column::SegmentHeight,
                segment_height_key(new_segment, height),
                id.to_le_bytes(),
            );
            moved.push(id);
        }
        self.store.write_batch(&batch)?;
        let mut cache = self.records.lock().expect("header cache");
        for id in moved {
            cache.remove(&id);
        }
        Ok(new_segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::ChainLock;
    use crate::params::Checkpoint;
    use arbor_storage::memory::MemoryStore;

    struct UnitWork;

    impl WorkSource for UnitWork {
        fn block_work(&self, bits: u32) -> U256 {
            U256::from(bits)
        }
    }

    fn make_header(prev: Hash256, time: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time,
            bits: 1,
            nonce,
        }
    }

    fn open_store(genesis: &BlockHeader) -> HeaderStore<Arc<MemoryStore>> {
        let params = ChainParams::new(genesis.hash());
        HeaderStore::open(Arc::new(MemoryStore::new()), params, Arc::new(UnitWork)).unwrap()
    }

    #[test]
    fn height_and_work_are_monotonic() {
        let genesis = make_header([0u8; 32], 1_000, 0);
        let store = open_store(&genesis);
        let lock = ChainLock::new();
        let mut token = lock.write();

        let g = store.insert_header(&mut token, &genesis).unwrap();
        let mut prev = genesis;
        let mut prev_id = g;
        for i in 1..=5u32 {
            let header = make_header(prev.hash(), 1_000 + i * 60, i);
            let id = store.insert_header(&mut token, &header).unwrap();
            let parent = store.record(prev_id).unwrap().unwrap();
            let record = store.record(id).unwrap().unwrap();
            assert_eq!(record.height, parent.height + 1);
            assert!(record.chain_work_value() > parent.chain_work_value());
            assert_eq!(record.parent_id, Some(prev_id));
            prev = header;
            prev_id = id;
        }
        assert_eq!(store.best_header_id().unwrap(), Some(prev_id));
        assert_eq!(store.ancestor(prev_id, 5).unwrap(), Some(g));
        assert_eq!(store.ancestor(g, 1).unwrap(), None);
    }

    #[test]
    fn duplicate_insert_returns_same_id() {
        let genesis = make_header([0u8; 32], 1_000, 0);
        let store = open_store(&genesis);
        let lock = ChainLock::new();
        let mut token = lock.write();
        let a = store.insert_header(&mut token, &genesis).unwrap();
        let b = store.insert_header(&mut token, &genesis).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn non_genesis_first_insert_is_fatal() {
        let genesis = make_header([0u8; 32], 1_000, 0);
        let store = open_store(&genesis);
        let lock = ChainLock::new();
        let mut token = lock.write();
        let stray = make_header([0x99; 32], 2_000, 7);
        assert!(matches!(
            store.insert_header(&mut token, &stray),
            Err(ChainStateError::NoRootSegment)
        ));
    }

    #[test]
    fn median_time_past_window() {
        let genesis = make_header([0u8; 32], 100, 0);
        let store = open_store(&genesis);
        let lock = ChainLock::new();
        let mut token = lock.write();
        let g = store.insert_header(&mut token, &genesis).unwrap();
        assert_eq!(store.median_time(g).unwrap(), Some(100));

        // Heights 1..=12 with time 100 + 10h; the window at height 12 holds
        // times for heights 2..=12, median at height 7.
        let mut prev = genesis;
        let mut last = g;
        for h in 1..=12u32 {
            let header = make_header(prev.hash(), 100 + h * 10, h);
            last = store.insert_header(&mut token, &header).unwrap();
            prev = header;
        }
        assert_eq!(store.median_time(last).unwrap(), Some(100 + 7 * 10));
    }

    #[test]
    fn fork_splits_segment_and_prefers_branch_child() {
        let genesis = make_header([0u8; 32], 1_000, 0);
        let store = open_store(&genesis);
        let lock = ChainLock::new();
        let mut token = lock.write();
        let g = store.insert_header(&mut token, &genesis).unwrap();

        // Main chain a1..a3, then a fork b2 off a1.
        let a1 = make_header(genesis.hash(), 1_060, 1);
        let a2 = make_header(a1.hash(), 1_120, 2);
        let a3 = make_header(a2.hash(), 1_180, 3);
        let a1_id = store.insert_header(&mut token, &a1).unwrap();
        let a2_id = store.insert_header(&mut token, &a2).unwrap();
        let a3_id = store.insert_header(&mut token, &a3).unwrap();

        let root_segment = store.record(g).unwrap().unwrap().segment_id;
        assert_eq!(store.record(a3_id).unwrap().unwrap().segment_id, root_segment);

        let b2 = make_header(a1.hash(), 1_121, 42);
        let b2_id = store.insert_header(&mut token, &b2).unwrap();

        let a1_segment = store.record(a1_id).unwrap().unwrap().segment_id;
        let a2_segment = store.record(a2_id).unwrap().unwrap().segment_id;
        let b2_segment = store.record(b2_id).unwrap().unwrap().segment_id;
        assert_eq!(a1_segment, root_segment);
        assert_ne!(a2_segment, root_segment);
        assert_ne!(b2_segment, root_segment);
        assert_ne!(a2_segment, b2_segment);
        assert_eq!(store.record(a3_id).unwrap().unwrap().segment_id, a2_segment);

        // Both children visible; segment-directed lookup picks the branch.
        let mut children = store.children_of(a1_id).unwrap();
        children.sort_unstable();
        assert_eq!(children, vec![a2_id, b2_id]);
        assert_eq!(
            store.child_along_segment(a2_segment, a1_id).unwrap(),
            Some(a2_id)
        );
        assert_eq!(
            store.child_along_segment(b2_segment, a1_id).unwrap(),
            Some(b2_id)
        );

        assert_eq!(store.head_of_branch(a2_segment).unwrap(), Some(a3_id));
        assert_eq!(store.head_of_branch(b2_segment).unwrap(), Some(b2_id));
        assert!(store.branch_work(a2_segment).unwrap() > store.branch_work(b2_segment).unwrap());
    }

    #[test]
    fn checkpoint_mismatch_is_fatal() {
        let genesis = make_header([0u8; 32], 1_000, 0);
        let mut params = ChainParams::new(genesis.hash());
        params.checkpoints.push(Checkpoint {
            height: 1,
            hash: [0xaa; 32],
        });
        let store =
            HeaderStore::open(Arc::new(MemoryStore::new()), params, Arc::new(UnitWork)).unwrap();
        let lock = ChainLock::new();
        let mut token = lock.write();
        store.insert_header(&mut token, &genesis).unwrap();
        let h1 = make_header(genesis.hash(), 1_060, 1);
        assert!(matches!(
            store.insert_header(&mut token, &h1),
            Err(ChainStateError::CheckpointMismatch { height: 1 })
        ));
    }

    #[test]
    fn batch_requires_connected_order() {
        let genesis = make_header([0u8; 32], 1_000, 0);
        let store = open_store(&genesis);
        let lock = ChainLock::new();
        let mut token = lock.write();
        store.insert_header(&mut token, &genesis).unwrap();

        let h1 = make_header(genesis.hash(), 1_060, 1);
        let h2 = make_header(h1.hash(), 1_120, 2);
        assert!(matches!(
            store.insert_header_batch(&mut token, &[h2, h1]),
            Err(ChainStateError::OutOfOrderBatch)
        ));
        let ids = store.insert_header_batch(&mut token, &[h1, h2]).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(store.height(ids[1]).unwrap(), Some(2));
    }

    #[test]
    fn batch_inherits_segment_from_predecessor() {
        let genesis = make_header([0u8; 32], 1_000, 0);
        let store = open_store(&genesis);
        let lock = ChainLock::new();
        let mut token = lock.write();
        let g = store.insert_header(&mut token, &genesis).unwrap();

        let h1 = make_header(genesis.hash(), 1_060, 1);
        let h2 = make_header(h1.hash(), 1_120, 2);
        let h3 = make_header(h2.hash(), 1_180, 3);
        let ids = store
            .insert_header_batch(&mut token, &[h1, h2, h3])
            .unwrap();
        let root_segment = store.record(g).unwrap().unwrap().segment_id;
        for id in &ids {
            assert_eq!(
                store.record(*id).unwrap().unwrap().segment_id,
                root_segment
            );
        }
        assert_eq!(store.forest().len(), 1);

        // A forking batch resolves its segment once; the rest follow it.
        let b2 = make_header(h1.hash(), 1_121, 42);
        let b3 = make_header(b2.hash(), 1_181, 43);
        let fork_ids = store.insert_header_batch(&mut token, &[b2, b3]).unwrap();
        let b2_segment = store.record(fork_ids[0]).unwrap().unwrap().segment_id;
        let b3_segment = store.record(fork_ids[1]).unwrap().unwrap().segment_id;
        assert_eq!(b2_segment, b3_segment);
        assert_ne!(b2_segment, root_segment);
        let h2_segment = store.record(ids[1]).unwrap().unwrap().segment_id;
        assert_ne!(b2_segment, h2_segment);
        // Root, the split-off run above h1, and the fork.
        assert_eq!(store.forest().len(), 3);
    }

    #[test]
    fn invalid_counter_threshold() {
        let genesis = make_header([0u8; 32], 1_000, 0);
        let store = open_store(&genesis);
        let hash = [0x77; 32];
        assert!(!store.is_invalid(&hash).unwrap());
        store.mark_invalid(&hash, 1).unwrap();
        store.mark_invalid(&hash, 1).unwrap();
        assert!(!store.is_invalid(&hash).unwrap());
        store.mark_invalid(&hash, 1).unwrap();
        assert!(store.is_invalid(&hash).unwrap());
        store.clear_invalid(&hash, 2).unwrap();
        assert!(!store.is_invalid(&hash).unwrap());
        store.clear_invalid(&hash, 10).unwrap();
        assert_eq!(store.invalid_count(&hash).unwrap(), 0);
    }

    #[test]
    fn corrupt_record_reads_as_missing() {
        let genesis = make_header([0u8; 32], 1_000, 0);
        let store = open_store(&genesis);
        let lock = ChainLock::new();
        let mut token = lock.write();
        let g = store.insert_header(&mut token, &genesis).unwrap();

        // Point a foreign hash at the genesis record.
        let bogus = [0x55; 32];
        store
            .store
            .put(Column::HeaderHash, &bogus, &g.to_le_bytes())
            .unwrap();
        assert!(store.header_by_hash(&bogus).unwrap().is_none());
        assert!(store.header_by_hash(&genesis.hash()).unwrap().is_some());
    }

    #[test]
    fn repair_header_keeps_identity() {
        let genesis = make_header([0u8; 32], 1_000, 0);
        let store = open_store(&genesis);
        let lock = ChainLock::new();
        let mut token = lock.write();
        store.insert_header(&mut token, &genesis).unwrap();

        let other = make_header([0u8; 32], 2_000, 9);
        assert!(store
            .repair_header(&mut token, &genesis.hash(), &other)
            .is_err());
        store
            .repair_header(&mut token, &genesis.hash(), &genesis)
            .unwrap();
    }
}
