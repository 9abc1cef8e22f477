//! Protocol session state held by a pool.
//!
//! A session is only written by the pool's own protocol client, under the
//! pool's session write lock, and every update replaces derived bytes
//! (coinbase, merkle branches, header template) in the same critical section.
//! Work generation reads it under the shared lock.

use tokio::time::Instant;

/// Live stratum session.
#[derive(Debug, Clone, Default)]
pub struct StratumSession {
    /// Extranonce1 as sent by the pool (hex), doubling as the session id
    /// used to decide whether a share can still be resubmitted.
    pub nonce1: String,

    /// Extranonce2 size in bytes.
    pub n2size: usize,

    /// Current share difficulty from `mining.set_difficulty`.
    pub sdiff: f64,

    /// Version rolling mask from `mining.set_version_mask`.
    pub version_mask: Option<u32>,

    /// Subscription id, offered back on reconnect to resume the session.
    pub subscription_id: Option<String>,

    /// Latest job, if any has been received on this session.
    pub job: Option<StratumJob>,
}

/// A `mining.notify` job with its derived bytes.
#[derive(Debug, Clone)]
pub struct StratumJob {
    pub job_id: String,

    /// Previous block hash, internal byte order.
    pub prev_hash: [u8; 32],

    /// coinbase1 || extranonce1 || zeroed extranonce2 || coinbase2
    pub coinbase: Vec<u8>,

    /// Offset of extranonce2 within `coinbase`.
    pub nonce2_offset: usize,

    pub merkle_branches: Vec<[u8; 32]>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub clean: bool,
}

/// Coinbase construction for a block template.
#[derive(Debug, Clone)]
pub enum CoinbaseTemplate {
    /// Pool-provided coinbase transaction with room for an 8-byte
    /// extranonce2 appended to its scriptSig.
    Provided { bytes: Vec<u8>, nonce2_offset: usize },

    /// Coinbase we build ourselves when solo mining against a node.
    Solo {
        height: u32,
        value: u64,
        flags: Vec<u8>,
        signature: Vec<u8>,
        script_pubkey: Vec<u8>,
        witness_commitment: Option<Vec<u8>>,
    },
}

/// A decoded `getblocktemplate` result.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    /// Previous block hash, internal byte order.
    pub prev_hash: [u8; 32],

    /// Little-endian 256-bit target.
    pub target: [u8; 32],

    pub version: u32,
    pub curtime: u32,
    pub nbits: u32,
    pub height: u32,

    pub coinbase: CoinbaseTemplate,

    /// Branch folding the coinbase txid up to the merkle root.
    pub merkle_branches: Vec<[u8; 32]>,

    /// Number of non-coinbase transactions.
    pub txn_count: usize,

    /// Concatenated raw transactions (hex), appended on block submission.
    pub txn_data: String,

    /// Pool accepts `submitblock` with only header and coinbase.
    pub submit_coinbase_only: bool,

    pub workid: Option<String>,
    pub expires: u32,
    pub fetched_at: Instant,
}

/// Everything a protocol client keeps for one pool.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub stratum: Option<StratumSession>,
    pub template: Option<BlockTemplate>,

    /// Extranonce2 counter for locally assembled coinbases.
    pub nonce2: u64,

    /// Longpoll URL advertised with getwork's `X-Long-Polling`.
    pub lp_url: Option<String>,

    /// GBT longpoll id from the latest template.
    pub longpoll_id: Option<String>,

    /// Pool asked to receive shares even when stale.
    pub submit_old: bool,

    /// Seconds work may be rolled, from `X-Roll-NTime`; 0 disables rolling.
    pub rolltime: u32,

    /// Block height the pool is working on, when known.
    pub height: u32,

    /// Node-validated payout script for solo coinbases.
    pub payout_script: Option<Vec<u8>>,
}
