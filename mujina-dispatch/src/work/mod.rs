//! The unit of hashing work and its lifecycle helpers.
//!
//! A [`Work`] is created by a protocol client (or by rolling/cloning another
//! item), staged in the [`StagingTable`], popped by a device thread, and
//! dropped once consumed, discarded or superseded. Every item owns its buffers
//! outright; a clone shares nothing with its master except the `Arc<Pool>`.

pub mod header;
mod staging;

pub use staging::{StagingTable, StageOutcome};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use tokio::time::Instant;

use crate::pool::Pool;
use crate::types::target_to_difficulty;
use header::{HeaderFields, NONCE_OFFSET, NTIME_OFFSET, PAYLOAD_LEN, PREV_HASH_OFFSET};

/// Rolled variants stop here so ntime never drifts past what consensus rules
/// accept.
pub const MAX_ROLLS: u32 = 7000;

/// Seconds a device may roll ntime itself on locally generated work.
pub const DRIVER_ROLL_NTIME: u32 = 60;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WorkFlags: u16 {
        const STRATUM = 1 << 0;
        const GBT = 1 << 1;
        const CLONE = 1 << 2;
        /// Must be hashed even if it would otherwise be considered stale.
        const MANDATORY = 1 << 3;
        /// Known stale when submitted.
        const STALE = 1 << 4;
        /// Hash met the network target.
        const BLOCK_FOUND = 1 << 5;
        /// Delivered by longpoll or a clean stratum job.
        const LONGPOLL = 1 << 6;
        /// Handed to a device thread.
        const MINED = 1 << 7;
    }
}

/// How the work was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum WorkMode {
    #[default]
    Getwork,
    Gbt,
    #[strum(serialize = "gbt-solo")]
    GbtSolo,
    Stratum,
    Longpoll,
    Benchmark,
}

/// Lifecycle timestamps.
#[derive(Debug, Clone, Copy)]
pub struct WorkTimes {
    pub getwork: Option<Instant>,
    pub getwork_reply: Option<Instant>,
    pub staged: Instant,
    pub cloned: Option<Instant>,
    pub work_start: Option<Instant>,
    pub found: Option<Instant>,
}

impl WorkTimes {
    fn now() -> Self {
        Self {
            getwork: None,
            getwork_reply: None,
            staged: Instant::now(),
            cloned: None,
            work_start: None,
            found: None,
        }
    }
}

/// Fields needed to submit stratum work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StratumFields {
    pub job_id: String,
    pub nonce1: String,
    pub nonce2: u64,
    pub nonce2_len: usize,
    /// ntime as the big-endian hex string sent in `mining.submit`.
    pub ntime: String,
}

/// Fields needed to submit a block built from a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GbtFields {
    /// Serialized coinbase transaction (hex).
    pub coinbase: String,
    /// Transactions in the block, coinbase included.
    pub txn_count: usize,
    /// Raw non-coinbase transactions (hex), when the pool wants a full block.
    pub txn_data: Option<String>,
    pub workid: Option<String>,
}

/// One hashing job.
#[derive(Debug, Clone)]
pub struct Work {
    pub id: u64,

    /// Header in consensus serialization plus SHA-256 padding.
    pub data: [u8; PAYLOAD_LEN],
    pub midstate: [u8; 32],

    /// Share target, little-endian.
    pub target: [u8; 32],

    /// Hash of the solved header, filled in on submission.
    pub hash: [u8; 32],

    /// Difficulty of `target`.
    pub difficulty: f64,

    /// Difficulty the device was asked to find, clamped to its limits.
    pub device_diff: f64,

    /// Difficulty the solution actually achieved.
    pub share_diff: u64,

    pub pool: Arc<Pool>,
    pub mode: WorkMode,
    pub flags: WorkFlags,

    /// Times this item (or its lineage) has been rolled.
    pub rolls: u32,

    /// Seconds the pool allows rolling; 0 means not rollable.
    pub rolltime: u32,

    /// Seconds a device may roll ntime on its own.
    pub drv_rollntime: u32,

    /// Block generation this work was made for.
    pub work_block: u64,

    pub times: WorkTimes,
    pub stratum: Option<StratumFields>,
    pub gbt: Option<GbtFields>,

    /// Device thread that hashed it.
    pub thr_id: Option<usize>,
}

impl Work {
    /// Zeroed work for `pool` with the given id.
    pub fn new(id: u64, pool: Arc<Pool>) -> Self {
        let mut data = [0u8; PAYLOAD_LEN];
        header::pad_payload(&mut data);
        Self {
            id,
            data,
            midstate: [0; 32],
            target: [0; 32],
            hash: [0; 32],
            difficulty: 0.0,
            device_diff: 0.0,
            share_diff: 0,
            pool,
            mode: WorkMode::default(),
            flags: WorkFlags::empty(),
            rolls: 0,
            rolltime: 0,
            drv_rollntime: 0,
            work_block: 0,
            times: WorkTimes::now(),
            stratum: None,
            gbt: None,
            thr_id: None,
        }
    }

    /// Replace the header and recompute the midstate.
    pub fn set_header(&mut self, fields: &HeaderFields) {
        self.data = header::build_payload(fields);
        self.midstate = header::midstate(&self.data);
    }

    /// Set the share target and the difficulty it represents.
    pub fn set_target(&mut self, target: [u8; 32]) {
        self.target = target;
        self.difficulty = target_to_difficulty(&target);
    }

    pub fn prev_hash(&self) -> [u8; 32] {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&self.data[PREV_HASH_OFFSET..PREV_HASH_OFFSET + 32]);
        hash
    }

    pub fn ntime(&self) -> u32 {
        header::read_u32(&self.data, NTIME_OFFSET)
    }

    pub fn nbits(&self) -> u32 {
        header::read_u32(&self.data, header::NBITS_OFFSET)
    }

    pub fn nonce(&self) -> u32 {
        header::read_u32(&self.data, NONCE_OFFSET)
    }

    pub fn set_nonce(&mut self, nonce: u32) {
        header::write_u32(&mut self.data, NONCE_OFFSET, nonce);
    }

    pub fn is_clone(&self) -> bool {
        self.flags.contains(WorkFlags::CLONE)
    }

    pub fn is_stratum(&self) -> bool {
        self.flags.contains(WorkFlags::STRATUM)
    }

    pub fn is_gbt(&self) -> bool {
        self.flags.contains(WorkFlags::GBT)
    }

    /// A master item that can produce further rolled work.
    pub fn is_rollable(&self) -> bool {
        !self.is_clone() && self.rolltime > 0
    }

    /// Structural rolling limits; staleness is checked by the caller.
    pub fn can_roll(&self) -> bool {
        !self.is_stratum() && self.is_rollable() && self.rolls < MAX_ROLLS
    }

    /// Advance ntime by one second and take a new id.
    ///
    /// The nonce is cleared since the result is a different job.
    pub fn roll(&mut self, new_id: u64) {
        let ntime = self.ntime().wrapping_add(1);
        header::write_u32(&mut self.data, NTIME_OFFSET, ntime);
        if let Some(stratum) = &mut self.stratum {
            stratum.ntime = format!("{:08x}", ntime);
        }
        self.set_nonce(0);
        self.rolls += 1;
        self.id = new_id;
    }

    /// Deep copy with a fresh id.
    ///
    /// Clones are never rolled again and are staged as if one second older,
    /// so consumers take them before the master.
    pub fn clone_with_id(&self, new_id: u64) -> Work {
        let mut clone = self.clone();
        clone.id = new_id;
        clone.flags.insert(WorkFlags::CLONE);
        clone.flags.remove(WorkFlags::LONGPOLL | WorkFlags::MANDATORY);
        let now = Instant::now();
        clone.times.cloned = Some(now);
        clone.times.staged = self
            .times
            .staged
            .checked_sub(Duration::from_secs(1))
            .unwrap_or(self.times.staged);
        clone
    }

    /// Returned to the pool's bookkeeping when discarded unused.
    pub fn is_pristine(&self) -> bool {
        !self.is_clone() && self.rolls == 0 && !self.flags.contains(WorkFlags::MINED)
    }
}

/// Allocator for work ids. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct WorkIds(AtomicU64);

impl WorkIds {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.0.load(Ordering::Relaxed) - 1
    }
}

impl Default for WorkIds {
    fn default() -> Self {
        Self::new()
    }
}
