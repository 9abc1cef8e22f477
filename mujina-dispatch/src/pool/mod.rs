//! Pool endpoints and their health, statistics and session state.
//!
//! A [`Pool`] is shared (`Arc<Pool>`) between the registry, protocol tasks and
//! every work item it produced, so a removed pool stays alive while work or
//! in-flight shares still reference it. Each concern sits behind its own
//! lock; flags that need test-and-set semantics are atomics.

mod registry;
pub mod session;
pub mod strategy;

pub use registry::Registry;
pub use session::{BlockTemplate, CoinbaseTemplate, Session, StratumJob, StratumSession};
pub use strategy::Strategy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::work::Work;

bitflags! {
    /// Protocols a pool has been found to speak.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u8 {
        const STRATUM = 1 << 0;
        const GBT = 1 << 1;
        const GBT_SOLO = 1 << 2;
        const LONGPOLL = 1 << 3;
        const BENCHMARK = 1 << 4;
    }
}

/// Operator/auto-disable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PoolState {
    Enabled,
    Disabled,
    /// Demoted after a streak of rejected shares; restored on an accept.
    Rejecting,
}

/// Liveness bookkeeping.
#[derive(Debug, Default)]
pub struct Health {
    /// When the pool last went idle.
    pub idle_since: Option<Instant>,

    /// When the pool last came back after being idle. `None` means it has
    /// never been idle.
    pub alive_since: Option<Instant>,

    /// Consecutive failed work fetches.
    pub seq_getfails: u32,

    /// Last time this pool delivered work.
    pub last_work: Option<Instant>,

    /// Rolling average getwork round trip, in seconds.
    pub getwork_latency: f64,

    /// Last health probe while idle.
    pub last_probe: Option<Instant>,
}

/// Share and work counters.
#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    pub accepted: u64,
    pub rejected: u64,
    pub stale: u64,
    pub diff_accepted: f64,
    pub diff_rejected: f64,
    pub diff_stale: f64,
    pub seq_rejects: u32,
    pub works: u64,
    pub discarded: u64,
    pub getwork_requested: u64,
    pub getfail_occasions: u64,
    pub remotefail_occasions: u64,
    /// Protocol messages that failed to decode and were skipped.
    pub bad_messages: u64,
    pub diff1: f64,
    pub best_diff: u64,
    pub last_share_time: Option<Instant>,
    pub last_share_diff: f64,
}

/// A share sent to a stratum pool and awaiting its response.
#[derive(Debug)]
pub struct InflightShare {
    pub id: u64,
    pub work: Work,

    /// When the solution was handed to the send loop.
    pub submitted: Instant,

    /// When the request was written to the socket.
    pub sent: Instant,
}

/// A configured pool endpoint.
#[derive(Debug)]
pub struct Pool {
    pub url: String,
    pub user: String,
    pub pass: String,

    /// Operator asked for solo mining against this node.
    pub solo: bool,

    pool_no: AtomicUsize,
    caps: RwLock<Capabilities>,
    state: Mutex<PoolState>,

    idle: AtomicBool,
    lagging: AtomicBool,
    submit_fail: AtomicBool,
    removed: AtomicBool,

    stratum_active: AtomicBool,
    stratum_notify: AtomicBool,

    pub health: Mutex<Health>,
    pub stats: Mutex<PoolStats>,
    pub session: RwLock<Session>,

    /// The last previous-block hash this pool's work pointed at.
    pub prev_block: Mutex<Option<[u8; 32]>>,

    /// Stratum shares awaiting a response, by request id.
    pub inflight: Mutex<HashMap<u64, InflightShare>>,
    next_submit_id: AtomicU64,

    /// Queue feeding this pool's stratum send loop.
    outbound: Mutex<Option<mpsc::UnboundedSender<Work>>>,
}

impl Pool {
    pub fn new(pool_no: usize, config: &PoolConfig) -> Self {
        Self {
            url: config.url.clone(),
            user: config.user.clone(),
            pass: config.pass.clone(),
            solo: config.solo,
            pool_no: AtomicUsize::new(pool_no),
            caps: RwLock::new(Capabilities::empty()),
            state: Mutex::new(PoolState::Enabled),
            idle: AtomicBool::new(false),
            lagging: AtomicBool::new(false),
            submit_fail: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            stratum_active: AtomicBool::new(false),
            stratum_notify: AtomicBool::new(false),
            health: Mutex::new(Health::default()),
            stats: Mutex::new(PoolStats::default()),
            session: RwLock::new(Session::default()),
            prev_block: Mutex::new(None),
            inflight: Mutex::new(HashMap::new()),
            next_submit_id: AtomicU64::new(1),
            outbound: Mutex::new(None),
        }
    }

    pub fn pool_no(&self) -> usize {
        self.pool_no.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pool_no(&self, pool_no: usize) {
        self.pool_no.store(pool_no, Ordering::Relaxed);
    }

    /// Host and port without the scheme, for log lines.
    pub fn name(&self) -> &str {
        let url = self.url.as_str();
        ["stratum+tcp://", "stratum://", "tcp://", "http://", "https://"]
            .iter()
            .find_map(|prefix| url.strip_prefix(prefix))
            .unwrap_or(url)
    }

    pub fn capabilities(&self) -> Capabilities {
        *self.caps.read()
    }

    pub fn set_capabilities(&self, caps: Capabilities) {
        *self.caps.write() = caps;
    }

    pub fn has_stratum(&self) -> bool {
        self.capabilities().contains(Capabilities::STRATUM)
    }

    pub fn has_gbt(&self) -> bool {
        self.capabilities().contains(Capabilities::GBT)
    }

    pub fn gbt_solo(&self) -> bool {
        self.capabilities().contains(Capabilities::GBT_SOLO)
    }

    pub fn is_benchmark(&self) -> bool {
        self.capabilities().contains(Capabilities::BENCHMARK)
    }

    /// Pool can generate work locally without a round trip per item.
    pub fn localgen(&self) -> bool {
        self.capabilities().intersects(
            Capabilities::STRATUM
                | Capabilities::GBT
                | Capabilities::GBT_SOLO
                | Capabilities::BENCHMARK,
        )
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: PoolState) {
        *self.state.lock() = state;
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    /// Mark idle, returning whether it already was.
    pub(crate) fn tset_idle(&self) -> bool {
        self.idle.swap(true, Ordering::SeqCst)
    }

    /// Clear idle, returning whether it was set.
    pub(crate) fn tclear_idle(&self) -> bool {
        self.idle.swap(false, Ordering::SeqCst)
    }

    pub fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::SeqCst)
    }

    pub fn tset_lagging(&self) -> bool {
        self.lagging.swap(true, Ordering::SeqCst)
    }

    pub fn tclear_lagging(&self) -> bool {
        self.lagging.swap(false, Ordering::SeqCst)
    }

    pub fn tset_submit_fail(&self) -> bool {
        self.submit_fail.swap(true, Ordering::SeqCst)
    }

    pub fn tclear_submit_fail(&self) -> bool {
        self.submit_fail.swap(false, Ordering::SeqCst)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    pub fn stratum_active(&self) -> bool {
        self.stratum_active.load(Ordering::SeqCst)
    }

    pub fn stratum_notify(&self) -> bool {
        self.stratum_notify.load(Ordering::SeqCst)
    }

    pub(crate) fn set_stratum_active(&self, active: bool) {
        self.stratum_active.store(active, Ordering::SeqCst);
        if !active {
            self.stratum_notify.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn set_stratum_notify(&self, notified: bool) {
        self.stratum_notify.store(notified, Ordering::SeqCst);
    }

    /// Stratum session is up and has a job to build work from.
    pub fn stratum_ready(&self) -> bool {
        self.stratum_active() && self.stratum_notify()
    }

    /// Not selectable: idle, not enabled, or a stratum pool without a live job.
    pub fn is_unusable(&self) -> bool {
        if self.is_idle() || self.state() != PoolState::Enabled {
            return true;
        }
        self.has_stratum() && !self.stratum_ready()
    }

    pub(crate) fn next_submit_id(&self) -> u64 {
        self.next_submit_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<Work>>) {
        *self.outbound.lock() = tx;
    }

    /// Queue a solved stratum share for the send loop. Hands the work back
    /// if no send loop is running.
    pub(crate) fn queue_share(&self, work: Work) -> Result<(), Work> {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(work).map_err(|e| e.0),
            None => Err(work),
        }
    }

    /// Current stratum difficulty, or 0 before the first `set_difficulty`.
    pub fn stratum_diff(&self) -> f64 {
        self.session
            .read()
            .stratum
            .as_ref()
            .map(|s| s.sdiff)
            .unwrap_or(0.0)
    }

    /// Stratum session id (extranonce1) currently in effect.
    pub fn stratum_nonce1(&self) -> Option<String> {
        self.session
            .read()
            .stratum
            .as_ref()
            .map(|s| s.nonce1.clone())
    }

    /// Fold a getwork round trip into the rolling latency average.
    pub fn record_getwork_latency(&self, seconds: f64) {
        let mut health = self.health.lock();
        health.getwork_latency = if health.getwork_latency == 0.0 {
            seconds
        } else {
            (health.getwork_latency * 0.63 + seconds) / 1.63
        };
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use std::sync::Arc;

    pub fn pool(pool_no: usize, url: &str) -> Arc<Pool> {
        let config = PoolConfig {
            url: url.to_string(),
            user: "worker".to_string(),
            pass: "x".to_string(),
            ..Default::default()
        };
        Arc::new(Pool::new(pool_no, &config))
    }

    pub fn stratum_pool(pool_no: usize) -> Arc<Pool> {
        let pool = pool(pool_no, &format!("stratum+tcp://pool{pool_no}.example.com:3333"));
        pool.set_capabilities(Capabilities::STRATUM);
        pool
    }
}
