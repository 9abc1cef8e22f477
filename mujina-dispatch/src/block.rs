//! Seen-block cache and the current block generation.
//!
//! Every staged work item is tagged with the generation that was current when
//! it was staged. A new previous-block hash bumps the generation, which makes
//! all older work stale in a single atomic step.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use bitcoin::{CompactTarget, Target};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::work::header::hash_to_display_hex;

/// Previous-block hashes remembered.
pub const SEEN_BLOCKS: usize = 6;

/// How a work item's previous block relates to what we have seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum BlockStatus {
    /// The first block seen since startup. Nothing to restart, and the work
    /// is not trusted until a second opinion arrives.
    First,
    /// A block we had not seen; all older work is stale.
    New,
    /// The block we are already working on.
    Current,
    /// The pool was behind and has now caught up with the current block.
    CaughtUp,
    /// The pool is still on an older block.
    Stale,
}

impl BlockStatus {
    pub fn is_usable(self) -> bool {
        !matches!(self, BlockStatus::First | BlockStatus::Stale)
    }

    pub fn is_new(self) -> bool {
        self == BlockStatus::New
    }
}

/// The block everything is currently being mined on top of.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentBlock {
    /// Previous-block hash, internal byte order.
    pub hash: [u8; 32],
    pub seen_at: Instant,
    /// Network difficulty from the header's compact bits.
    pub difficulty: f64,
}

impl CurrentBlock {
    /// Short display form: the last 8 bytes of the big-endian hash.
    pub fn short_hash(&self) -> String {
        let hex = hash_to_display_hex(&self.hash);
        hex[hex.len() - 16..].to_string()
    }
}

#[derive(Debug, Default)]
struct Inner {
    seen: VecDeque<[u8; 32]>,
    current: Option<CurrentBlock>,
}

/// Network difficulty encoded by compact `bits`.
pub fn network_difficulty(nbits: u32) -> f64 {
    Target::from_compact(CompactTarget::from_consensus(nbits)).difficulty_float()
}

#[derive(Debug, Default)]
pub struct BlockTracker {
    inner: Mutex<Inner>,
    work_block: AtomicU64,
}

impl BlockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current block generation.
    pub fn work_block(&self) -> u64 {
        self.work_block.load(Ordering::SeqCst)
    }

    /// Start a new generation, returning it.
    pub fn bump(&self) -> u64 {
        self.work_block.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> Option<CurrentBlock> {
        self.inner.lock().current.clone()
    }

    pub fn is_current(&self, hash: &[u8; 32]) -> bool {
        self.inner
            .lock()
            .current
            .as_ref()
            .is_some_and(|c| &c.hash == hash)
    }

    pub fn seen_count(&self) -> usize {
        self.inner.lock().seen.len()
    }

    pub fn has_seen(&self, hash: &[u8; 32]) -> bool {
        self.inner.lock().seen.contains(hash)
    }

    /// Record a previous-block hash.
    ///
    /// Returns `None` if it was already known. Otherwise it becomes the
    /// current block and the result says whether it was the first ever.
    pub fn record(&self, hash: [u8; 32], nbits: u32) -> Option<bool> {
        let mut inner = self.inner.lock();
        if inner.seen.contains(&hash) {
            return None;
        }
        let first = inner.seen.is_empty();
        inner.seen.push_back(hash);
        while inner.seen.len() > SEEN_BLOCKS {
            inner.seen.pop_front();
        }
        inner.current = Some(CurrentBlock {
            hash,
            seen_at: Instant::now(),
            difficulty: network_difficulty(nbits),
        });
        Some(first)
    }
}
