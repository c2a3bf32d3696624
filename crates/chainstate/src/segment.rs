//! Blockchain segment forest with nested-interval numbering.
//!
//! Every header belongs to exactly one segment; segments form a tree rooted
//! at the genesis segment. Each segment carries a `(left, right)` interval
//! assigned by a pre-order renumbering walk, so ancestry between two
//! segments is a pair of integer comparisons.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use arbor_primitives::encoding::{Decoder, Encoder};
use arbor_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainStateError;
use crate::lock::WriteToken;
use crate::SegmentId;

const META_NEXT_SEGMENT_ID_KEY: &[u8] = b"next_segment_id";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentRelation {
    Ancestor,
    Descendant,
    Any,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Segment {
    pub id: SegmentId,
    pub parent: Option<SegmentId>,
    pub left: u64,
    pub right: u64,
}

impl Segment {
    /// Interval containment: `self` is `other` or an ancestor of it.
    pub fn contains(&self, other: &Segment) -> bool {
        self.left <= other.left && self.right >= other.right
    }

    pub fn is_leaf(&self) -> bool {
        self.left + 1 == self.right
    }
}

pub fn segment_key(id: SegmentId) -> [u8; 8] {
    id.to_be_bytes()
}

fn encode_segment(segment: &Segment) -> Vec<u8> {
    let mut encoder = Encoder::new();
    match segment.parent {
        Some(parent) => {
            encoder.write_u8(1);
            encoder.write_u64_le(parent);
        }
        None => encoder.write_u8(0),
    }
    encoder.write_u64_le(segment.left);
    encoder.write_u64_le(segment.right);
    encoder.into_inner()
}

fn decode_segment(id: SegmentId, bytes: &[u8]) -> Result<Segment, ChainStateError> {
    let mut decoder = Decoder::new(bytes);
    let corrupt = |_| ChainStateError::CorruptRecord("corrupt segment record");
    let parent = if decoder.read_u8().map_err(corrupt)? != 0 {
        Some(decoder.read_u64_le().map_err(corrupt)?)
    } else {
        None
    };
    let left = decoder.read_u64_le().map_err(corrupt)?;
    let right = decoder.read_u64_le().map_err(corrupt)?;
    if !decoder.is_empty() {
        return Err(ChainStateError::CorruptRecord("corrupt segment record"));
    }
    Ok(Segment {
        id,
        parent,
        left,
        right,
    })
}

pub struct SegmentForest<S> {
    store: S,
    snapshot: RwLock<HashMap<SegmentId, Segment>>,
    next_id: AtomicU64,
}

impl<S: KeyValueStore> SegmentForest<S> {
    pub fn open(store: S) -> Result<Self, ChainStateError> {
        let mut snapshot = HashMap::new();
        let mut max_id: SegmentId = 0;
        for (key, value) in store.scan_prefix(Column::Segment, &[])? {
            let id_bytes: [u8; 8] = key
                .as_slice()
                .try_into()
                .map_err(|_| ChainStateError::CorruptRecord("corrupt segment key"))?;
            let id = SegmentId::from_be_bytes(id_bytes);
            let segment = decode_segment(id, &value)?;
            max_id = max_id.max(id);
            snapshot.insert(id, segment);
        }
        let next_id = match store.get(Column::Meta, META_NEXT_SEGMENT_ID_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainStateError::CorruptRecord("corrupt segment counter"))?;
                u64::from_le_bytes(raw)
            }
            None => max_id + 1,
        };
        Ok(Self {
            store,
            snapshot: RwLock::new(snapshot),
            next_id: AtomicU64::new(next_id.max(1)),
        })
    }

    pub fn get(&self, id: SegmentId) -> Option<Segment> {
        let snapshot = self.snapshot.read().expect("segment snapshot");
        snapshot.get(&id).copied()
    }

    pub fn root(&self) -> Option<SegmentId> {
        let snapshot = self.snapshot.read().expect("segment snapshot");
        snapshot
            .values()
            .find(|segment| segment.parent.is_none())
            .map(|segment| segment.id)
    }

    pub fn len(&self) -> usize {
        let snapshot = self.snapshot.read().expect("segment snapshot");
        snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn children_of(&self, id: SegmentId) -> Vec<SegmentId> {
        let snapshot = self.snapshot.read().expect("segment snapshot");
        let mut children: Vec<SegmentId> = snapshot
            .values()
            .filter(|segment| segment.parent == Some(id))
            .map(|segment| segment.id)
            .collect();
        children.sort_unstable();
        children
    }

    pub fn create_segment(
        &self,
        token: &mut WriteToken,
        parent: Option<SegmentId>,
    ) -> Result<SegmentId, ChainStateError> {
        {
            let snapshot = self.snapshot.read().expect("segment snapshot");
            match parent {
                None => {
                    if snapshot.values().any(|segment| segment.parent.is_none()) {
                        return Err(ChainStateError::MultipleRoots);
                    }
                }
                Some(parent_id) => {
                    if !snapshot.contains_key(&parent_id) {
                        return Err(ChainStateError::MissingSegment);
                    }
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let segment = Segment {
            id,
            parent,
            left: 0,
            right: 0,
        };
        let mut batch = WriteBatch::new();
        batch.put(Column::Segment, segment_key(id), encode_segment(&segment));
        batch.put(
            Column::Meta,
            META_NEXT_SEGMENT_ID_KEY,
            (id + 1).to_le_bytes(),
        );
        self.store.write_batch(&batch)?;
        self.snapshot
            .write()
            .expect("segment snapshot")
            .insert(id, segment);
        self.renumber(token)?;
        Ok(id)
    }

    /// Splits `id` by inserting a new segment between it and all of its
    /// current children. The caller moves the header rows that belong above
    /// the split point into the returned segment.
    pub fn split_segment(
        &self,
        token: &mut WriteToken,
        id: SegmentId,
    ) -> Result<SegmentId, ChainStateError> {
        let existing_children = {
            let snapshot = self.snapshot.read().expect("segment snapshot");
            if !snapshot.contains_key(&id) {
                return Err(ChainStateError::MissingSegment);
            }
            let mut children: Vec<SegmentId> = snapshot
                .values()
                .filter(|segment| segment.parent == Some(id))
                .map(|segment| segment.id)
                .collect();
            children.sort_unstable();
            children
        };

        let new_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let new_segment = Segment {
            id: new_id,
            parent: Some(id),
            left: 0,
            right: 0,
        };

        let mut batch = WriteBatch::new();
        batch.put(
            Column::Segment,
            segment_key(new_id),
            encode_segment(&new_segment),
        );
        let mut reparented = Vec::with_capacity(existing_children.len());
        {
            let snapshot = self.snapshot.read().expect("segment snapshot");
            for child_id in &existing_children {
                let mut child = snapshot[child_id];
                child.parent = Some(new_id);
                batch.put(
                    Column::Segment,
                    segment_key(child.id),
                    encode_segment(&child),
                );
                reparented.push(child);
            }
        }
        batch.put(
            Column::Meta,
            META_NEXT_SEGMENT_ID_KEY,
            (new_id + 1).to_le_bytes(),
        );
        self.store.write_batch(&batch)?;

        {
            let mut snapshot = self.snapshot.write().expect("segment snapshot");
            snapshot.insert(new_id, new_segment);
            for child in reparented {
                snapshot.insert(child.id, child);
            }
        }
        self.renumber(token)?;
        Ok(new_id)
    }

    /// Reassigns nested-interval numbers with a single pre-order walk over a
    /// children index built once per call.
    pub fn renumber(&self, _token: &mut WriteToken) -> Result<(), ChainStateError> {
        enum Frame {
            Enter(SegmentId),
            Exit(SegmentId),
        }

        let (root, mut segments, children) = {
            let snapshot = self.snapshot.read().expect("segment snapshot");
            if snapshot.is_empty() {
                return Ok(());
            }
            let root = snapshot
                .values()
                .find(|segment| segment.parent.is_none())
                .map(|segment| segment.id)
                .ok_or(ChainStateError::NoRootSegment)?;
            let mut children: HashMap<SegmentId, Vec<SegmentId>> = HashMap::new();
            for segment in snapshot.values() {
                if let Some(parent) = segment.parent {
                    children.entry(parent).or_default().push(segment.id);
                }
            }
            for list in children.values_mut() {
                list.sort_unstable();
            }
            (root, snapshot.clone(), children)
        };

        let mut counter: u64 = 0;
        let mut stack = vec![Frame::Enter(root)];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(id) => {
                    counter += 1;
                    if let Some(segment) = segments.get_mut(&id) {
                        segment.left = counter;
                    }
                    stack.push(Frame::Exit(id));
                    if let Some(list) = children.get(&id) {
                        for child in list.iter().rev() {
                            stack.push(Frame::Enter(*child));
                        }
                    }
                }
                Frame::Exit(id) => {
                    counter += 1;
                    if let Some(segment) = segments.get_mut(&id) {
                        segment.right = counter;
                    }
                }
            }
        }

        let mut batch = WriteBatch::new();
        {
            let snapshot = self.snapshot.read().expect("segment snapshot");
            for segment in segments.values() {
                let unchanged = snapshot
                    .get(&segment.id)
                    .map(|old| old == segment)
                    .unwrap_or(false);
                if !unchanged {
                    batch.put(
                        Column::Segment,
                        segment_key(segment.id),
                        encode_segment(segment),
                    );
                }
            }
        }
        if batch.len() > 0 {
            self.store.write_batch(&batch)?;
        }
        *self.snapshot.write().expect("segment snapshot") = segments;
        Ok(())
    }

    pub fn are_connected(&self, a: SegmentId, b: SegmentId, relation: SegmentRelation) -> bool {
        let snapshot = self.snapshot.read().expect("segment snapshot");
        let (Some(a), Some(b)) = (snapshot.get(&a), snapshot.get(&b)) else {
            return false;
        };
        match relation {
            SegmentRelation::Ancestor => a.contains(b),
            SegmentRelation::Descendant => b.contains(a),
            SegmentRelation::Any => a.contains(b) || b.contains(a),
        }
    }

    pub fn leaf_segments(&self) -> Vec<SegmentId> {
        let snapshot = self.snapshot.read().expect("segment snapshot");
        let mut leaves: Vec<SegmentId> = snapshot
            .values()
            .filter(|segment| segment.is_leaf())
            .map(|segment| segment.id)
            .collect();
        leaves.sort_unstable();
        leaves
    }
}
