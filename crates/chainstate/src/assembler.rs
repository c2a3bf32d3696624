//! Extends the block chain from downloaded bodies.
//!
//! Headers arrive independently of bodies, so assembly is a walk: per pass,
//! take every leaf segment in descending branch-work order, find the last
//! body-connected header on that branch, and push forward child by child.
//! Bodies are validated and applied to the UTXO set only along the
//! heaviest branch; lighter branches have their bodies fetched and parked
//! until header work says they have overtaken.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arbor_primitives::block::Block;
use arbor_primitives::{Hash256, ZERO_HASH};
use arbor_storage::KeyValueStore;

use crate::context::{BlockArchive, BlockRequester, BlockValidator};
use crate::error::ChainStateError;
use crate::headers::HeaderStore;
use crate::lock::ChainLock;
use crate::pending::{DeletionQueue, PendingBlockStore};
use crate::utxo::{CommitMode, UtxoManager};
use crate::{HeaderId, SegmentId};

const TIMING_SAMPLES: usize = 100;

/// Outcome of one assembly pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassSummary {
    pub blocks_processed: usize,
    pub elapsed: Duration,
}

impl PassSummary {
    pub fn blocks_per_second(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds <= 0.0 {
            return 0.0;
        }
        self.blocks_processed as f64 / seconds
    }
}

pub struct ChainAssembler<S> {
    headers: Arc<HeaderStore<S>>,
    utxo: Arc<UtxoManager<S>>,
    pending: Arc<PendingBlockStore<S>>,
    deletions: Arc<DeletionQueue>,
    validator: Arc<dyn BlockValidator>,
    requester: Arc<dyn BlockRequester>,
    archive: Arc<dyn BlockArchive>,
    lock: Arc<ChainLock>,
    should_abort: Arc<AtomicBool>,
    timings: Mutex<VecDeque<Duration>>,
}

impl<S: KeyValueStore + Clone> ChainAssembler<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        headers: Arc<HeaderStore<S>>,
        utxo: Arc<UtxoManager<S>>,
        pending: Arc<PendingBlockStore<S>>,
        deletions: Arc<DeletionQueue>,
        validator: Arc<dyn BlockValidator>,
        requester: Arc<dyn BlockRequester>,
        archive: Arc<dyn BlockArchive>,
        lock: Arc<ChainLock>,
    ) -> Self {
        Self {
            headers,
            utxo,
            pending,
            deletions,
            validator,
            requester,
            archive,
            lock,
            should_abort: Arc::new(AtomicBool::new(false)),
            timings: Mutex::new(VecDeque::with_capacity(TIMING_SAMPLES)),
        }
    }

    pub fn headers(&self) -> &Arc<HeaderStore<S>> {
        &self.headers
    }

    pub fn utxo(&self) -> &Arc<UtxoManager<S>> {
        &self.utxo
    }

    pub fn pending(&self) -> &Arc<PendingBlockStore<S>> {
        &self.pending
    }

    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.should_abort)
    }

    pub fn abort(&self) {
        self.should_abort.store(true, Ordering::Release);
    }

    fn aborted(&self) -> bool {
        self.should_abort.load(Ordering::Acquire)
    }

    /// Records a failed download attempt for `hash`, reported by the block
    /// downloader. Once the failure count reaches the invalid threshold the
    /// header is marked invalid and the pending record is dropped, so
    /// assembly stops waiting for the block.
    pub fn report_download_failure(&self, hash: &Hash256) -> Result<u32, ChainStateError> {
        let count = self.pending.increment_failure(hash)?;
        let threshold = self.headers.params().invalid_process_threshold;
        if count >= threshold {
            self.headers.mark_invalid(hash, threshold)?;
            self.pending.remove(hash)?;
            arbor_log::log_warn!(
                "block {} abandoned after {count} failed download(s)",
                hex_prefix(hash)
            );
        }
        Ok(count)
    }

    /// Average per-block processing time over the recent sample window.
    pub fn average_block_time(&self) -> Option<Duration> {
        let timings = self.timings.lock().expect("assembler timings");
        if timings.is_empty() {
            return None;
        }
        let total: Duration = timings.iter().sum();
        Some(total / timings.len() as u32)
    }

    fn record_timing(&self, elapsed: Duration) {
        let mut timings = self.timings.lock().expect("assembler timings");
        if timings.len() == TIMING_SAMPLES {
            timings.pop_front();
        }
        timings.push_back(elapsed);
    }

    /// Runs one assembly pass over every branch. Returns how many bodies
    /// were connected.
    pub fn run_pass(&self) -> Result<PassSummary, ChainStateError> {
        let start = Instant::now();
        let mut processed = 0usize;

        if self.headers.head_block_id()?.is_none() {
            if !self.bootstrap_genesis()? {
                return Ok(PassSummary {
                    blocks_processed: 0,
                    elapsed: start.elapsed(),
                });
            }
            processed += 1;
        }

        let forest = self.headers.forest();
        let mut branches: Vec<(SegmentId, _)> = Vec::new();
        for leaf in forest.leaf_segments() {
            branches.push((leaf, self.headers.branch_work(leaf)?));
        }
        branches.sort_by(|a, b| b.1.cmp(&a.1));

        for (rank, (segment, _)) in branches.iter().enumerate() {
            if self.aborted() {
                break;
            }
            processed += self.process_branch(*segment, rank == 0)?;
        }

        let summary = PassSummary {
            blocks_processed: processed,
            elapsed: start.elapsed(),
        };
        if summary.blocks_processed > 0 {
            arbor_log::log_info!(
                "assembly pass: {} block(s) in {}ms ({:.1}/s)",
                summary.blocks_processed,
                summary.elapsed.as_millis(),
                summary.blocks_per_second()
            );
        }
        Ok(summary)
    }

    /// Installs the genesis block, or requests it when the body has not
    /// arrived yet. Genesis outputs stay out of the UTXO set.
    fn bootstrap_genesis(&self) -> Result<bool, ChainStateError> {
        let genesis_hash = self.headers.params().genesis_hash;
        let Some(body) = self.pending.block(&genesis_hash)? else {
            self.pending.register(genesis_hash, ZERO_HASH, 0)?;
            self.requester.request_block(genesis_hash, None, 0);
            return Ok(false);
        };

        let mut token = self.lock.write();
        let id = match self.headers.header_id(&genesis_hash)? {
            Some(id) => id,
            None => self.headers.insert_header(&mut token, &body.header)?,
        };
        self.archive
            .write_block(&body)
            .map_err(ChainStateError::from)?;
        self.headers
            .set_has_block(&mut token, id, body.byte_count() as u32)?;
        self.headers.set_head_block(&mut token, id)?;
        drop(token);

        self.utxo.set_base(0, genesis_hash)?;
        self.deletions.enqueue(genesis_hash);
        arbor_log::log_info!("stored genesis block {}", hex_prefix(&genesis_hash));
        Ok(true)
    }

    /// Walks one branch forward from its last body-connected header.
    fn process_branch(
        &self,
        segment: SegmentId,
        is_best: bool,
    ) -> Result<usize, ChainStateError> {
        let Some(mut head) = self.connected_head(segment)? else {
            return Ok(0);
        };
        let mut processed = 0usize;
        let mut adopted_at: Option<HeaderId> = None;

        loop {
            if self.aborted() {
                break;
            }
            let Some(child) = self.headers.child_along_segment(segment, head)? else {
                // A body can arrive before its header; adopt headers from
                // pending blocks claiming this head and retry the advance.
                if adopted_at != Some(head) && self.adopt_pending_children(head)? {
                    adopted_at = Some(head);
                    continue;
                }
                // Branch fully assembled.
                if is_best {
                    self.utxo.commit(CommitMode::SkipIfBusy)?;
                }
                break;
            };
            let child_record = self
                .headers
                .record(child)?
                .ok_or(ChainStateError::MissingHeader)?;
            let child_hash = child_record.header.hash();

            if child_record.has_block {
                head = child;
                continue;
            }
            if self.headers.is_invalid(&child_hash)? {
                break;
            }

            let Some(body) = self.pending.block(&child_hash)? else {
                let head_hash = self
                    .headers
                    .hash(head)?
                    .ok_or(ChainStateError::MissingHeader)?;
                let priority = child_record.height as i64;
                self.pending.register(child_hash, head_hash, priority)?;
                self.requester
                    .request_block(child_hash, Some(head_hash), priority);
                break;
            };

            if !is_best {
                // Body is parked until header work makes this branch best.
                break;
            }

            let block_start = Instant::now();
            if !self.connect_block(head, child, &child_hash, &body, child_record.height)? {
                break;
            }
            self.record_timing(block_start.elapsed());
            processed += 1;
            head = child;
        }
        Ok(processed)
    }

    /// Inserts headers for downloaded blocks that name `head` as parent but
    /// have no header record yet. Returns true when at least one header was
    /// adopted.
    fn adopt_pending_children(&self, head: HeaderId) -> Result<bool, ChainStateError> {
        let head_hash = self
            .headers
            .hash(head)?
            .ok_or(ChainStateError::MissingHeader)?;
        let mut adopted = false;
        for pending in self.pending.children_of(&head_hash)? {
            if !pending.has_bytes || self.headers.is_invalid(&pending.hash)? {
                continue;
            }
            if self.headers.header_id(&pending.hash)?.is_some() {
                continue;
            }
            let Some(body) = self.pending.block(&pending.hash)? else {
                continue;
            };
            let mut token = self.lock.write();
            self.headers.insert_header(&mut token, &body.header)?;
            adopted = true;
        }
        Ok(adopted)
    }

    /// Finds the deepest header on the branch whose body is connected.
    fn connected_head(&self, segment: SegmentId) -> Result<Option<HeaderId>, ChainStateError> {
        let mut current = self.headers.head_of_branch(segment)?;
        while let Some(id) = current {
            let record = self
                .headers
                .record(id)?
                .ok_or(ChainStateError::MissingHeader)?;
            if record.has_block {
                return Ok(Some(id));
            }
            current = record.parent_id;
        }
        Ok(None)
    }

    /// Validates and applies one body, then durably connects it. Returns
    /// false when the branch should be abandoned for this pass.
    fn connect_block(
        &self,
        head: HeaderId,
        child: HeaderId,
        child_hash: &Hash256,
        body: &Block,
        height: u32,
    ) -> Result<bool, ChainStateError> {
        if let Err(reason) = self.validator.validate(body, height) {
            let count = self.headers.mark_invalid(child_hash, 1)?;
            // The body is kept for retries until the header is officially
            // invalid; only then is re-downloading pointless.
            if self.headers.is_invalid(child_hash)? {
                self.pending.remove_block_data(child_hash)?;
            }
            arbor_log::log_warn!(
                "block {} failed validation ({count} failure(s)): {reason}",
                hex_prefix(child_hash)
            );
            return Ok(false);
        }

        self.apply_to_utxo(head, body, height)?;

        let mut token = self.lock.write();
        self.archive
            .write_block(body)
            .map_err(ChainStateError::from)?;
        self.headers
            .set_has_block(&mut token, child, body.byte_count() as u32)?;

        let child_work = self
            .headers
            .chain_work(child)?
            .ok_or(ChainStateError::MissingHeader)?;
        let head_block_work = match self.headers.head_block_id()? {
            Some(id) => self.headers.chain_work(id)?.unwrap_or_default(),
            None => Default::default(),
        };
        if child_work >= head_block_work {
            self.headers.set_head_block(&mut token, child)?;
        }
        drop(token);

        self.deletions.enqueue(*child_hash);
        Ok(true)
    }

    /// Applies the body to the UTXO set, rebuilding the set when it is not
    /// positioned at this branch tip (reorg or prior inconsistency).
    fn apply_to_utxo(
        &self,
        head: HeaderId,
        body: &Block,
        height: u32,
    ) -> Result<(), ChainStateError> {
        if !self.utxo.is_consistent() {
            self.utxo.rebuild(&self.headers, self.archive.as_ref(), head, false)?;
        }
        match self.utxo.apply_block(body, height) {
            Ok(()) => return Ok(()),
            Err(ChainStateError::OutOfOrderApply { .. }) | Err(ChainStateError::BranchMismatch) => {}
            Err(err) => return Err(err),
        }

        arbor_log::log_info!(
            "utxo set not positioned for height {height}; rebuilding along branch"
        );
        self.utxo
            .rebuild(&self.headers, self.archive.as_ref(), head, false)?;
        match self.utxo.apply_block(body, height) {
            Ok(()) => return Ok(()),
            Err(ChainStateError::OutOfOrderApply { .. }) | Err(ChainStateError::BranchMismatch) => {}
            Err(err) => return Err(err),
        }

        // Committed state diverges below the fork point; replay everything.
        self.utxo
            .rebuild(&self.headers, self.archive.as_ref(), head, true)?;
        self.utxo.apply_block(body, height)
    }
}

fn hex_prefix(hash: &Hash256) -> String {
    let mut out = String::with_capacity(16);
    for byte in hash.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
