//! The engine: shared context for every task in the dispatcher.
//!
//! One [`Engine`] is built at startup and handed (as `Arc<Engine>`) to the
//! scheduler, protocol clients, watchers and device threads. It owns the pool
//! registry, the staging table, the block tracker and the counters, and
//! implements the operations that cut across them: staging, staleness,
//! discarding, block changes and restarts, and the device-facing
//! `get_work`/`submit_nonce` pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{CompactTarget, Target};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::benchmark;
use crate::block::{BlockStatus, BlockTracker};
use crate::config::Config;
use crate::device::HashDevice;
use crate::error::{Error, Result};
use crate::pool::{Capabilities, Pool, Registry};
use crate::rpc::RpcClient;
use crate::sharelog::ShareLog;
use crate::stats::Stats;
use crate::submit;
use crate::tracing::prelude::*;
use crate::types::{difficulty_to_target, share_difficulty};
use crate::u256::meets_target;
use crate::work::header::header_hash;
use crate::work::{StageOutcome, StagingTable, Work, WorkFlags, WorkIds};

/// Work is never considered fresh for less than this.
const MIN_EXPIRY: u64 = 5;

/// What a staleness check is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleCheck {
    /// Handing the work to a device.
    Use,
    /// Sending a solution to the pool.
    Submit,
}

#[derive(Debug)]
pub struct Engine {
    pub config: Config,
    pub registry: Registry,
    pub staging: StagingTable,
    pub blocks: BlockTracker,
    pub stats: Stats,
    pub ids: WorkIds,
    pub rpc: RpcClient,
    pub(crate) sharelog: Option<ShareLog>,

    devices: RwLock<Vec<Arc<dyn HashDevice>>>,
    restart: watch::Sender<u64>,
    work_update: AtomicBool,

    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
}

impl Engine {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let registry = Registry::new(config.strategy, config.fail_only);
        if config.benchmark {
            benchmark::add_pool(&registry);
        } else {
            for pool in &config.pools {
                registry.add_pool(pool);
            }
        }
        if registry.is_empty() {
            return Err(Error::Config("no pools configured".into()));
        }

        let sharelog = config
            .sharelog
            .as_deref()
            .map(ShareLog::open)
            .transpose()?;
        let (restart, _) = watch::channel(0);

        Ok(Arc::new(Self {
            staging: StagingTable::new(config.queue),
            registry,
            blocks: BlockTracker::new(),
            stats: Stats::new(),
            ids: WorkIds::new(),
            rpc: RpcClient::new()?,
            sharelog,
            devices: RwLock::new(Vec::new()),
            restart,
            work_update: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            config,
        }))
    }

    /// Fresh work for `pool` with the next id.
    pub fn make_work(&self, pool: &Arc<Pool>) -> Work {
        Work::new(self.ids.next(), pool.clone())
    }

    /// Register a device; its index is the thread id it mines under.
    pub fn register_device(&self, device: Arc<dyn HashDevice>) -> usize {
        let mut devices = self.devices.write();
        let thr_id = devices.len();
        self.stats
            .register_thread(thr_id, device.name(), device.device_id());
        info!(thr_id, device = device.name(), "Registered device thread");
        devices.push(device);
        thr_id
    }

    /// Threads that consume work.
    pub fn mining_threads(&self) -> usize {
        self.devices.read().len().max(1)
    }

    pub fn subscribe_restart(&self) -> watch::Receiver<u64> {
        self.restart.subscribe()
    }

    /// Flag that the current pool has fresher work than devices hold.
    pub fn signal_work_update(&self) {
        self.work_update.store(true, Ordering::SeqCst);
    }

    /// Tell every device about new work if flagged since the last call.
    pub fn propagate_work_update(&self) -> bool {
        if !self.work_update.swap(false, Ordering::SeqCst) {
            return false;
        }
        for device in self.devices.read().iter() {
            device.update_work();
        }
        true
    }

    /// Tag work with the current block, check it against the seen-block
    /// cache and stage it. Returns false if the work was dropped.
    pub fn stage_work(&self, mut work: Work) -> bool {
        work.work_block = self.blocks.work_block();
        if self.test_work_current(&mut work) == BlockStatus::Stale {
            debug!(work_id = work.id, pool = %work.pool.url, "Dropping work for an old block");
            self.discard_work(work);
            return false;
        }
        if !work.is_clone() {
            work.times.staged = Instant::now();
        }
        work.pool.stats.lock().works += 1;
        trace!(work_id = work.id, pool = work.pool.pool_no(), "Staging work");

        match self.staging.push(work) {
            StageOutcome::Staged => true,
            StageOutcome::Frozen(work) => {
                debug!(work_id = work.id, "Staging table frozen, dropping work");
                false
            }
        }
    }

    /// Classify the work's previous block and react to block changes.
    pub fn test_work_current(&self, work: &mut Work) -> BlockStatus {
        if work.flags.contains(WorkFlags::MANDATORY) {
            return BlockStatus::Current;
        }

        let pool = work.pool.clone();
        let prev = work.prev_hash();
        let longpoll = work.flags.contains(WorkFlags::LONGPOLL);

        let status = match self.blocks.record(prev, work.nbits()) {
            Some(true) => {
                *pool.prev_block.lock() = Some(prev);
                if let Some(block) = self.blocks.current() {
                    info!(block = %block.short_hash(), diff = block.difficulty, "First block seen");
                }
                BlockStatus::First
            }
            Some(false) => {
                *pool.prev_block.lock() = Some(prev);
                work.work_block = self.blocks.bump();
                let (block, diff) = self
                    .blocks
                    .current()
                    .map(|b| (b.short_hash(), b.difficulty))
                    .unwrap_or_default();
                if longpoll {
                    let source = if work.is_stratum() { "Stratum" } else { "Longpoll" };
                    info!(block = %block, diff, "{} from pool {} detected new block", source, pool.pool_no());
                } else if pool.capabilities().contains(Capabilities::LONGPOLL) {
                    info!(block = %block, diff, "New block detected on network before pool notification");
                } else {
                    info!(block = %block, diff, "New block detected on network");
                }
                self.restart_threads();
                BlockStatus::New
            }
            None => {
                let changed = {
                    let mut pool_block = pool.prev_block.lock();
                    let changed = *pool_block != Some(prev);
                    *pool_block = Some(prev);
                    changed
                };
                let status = match (self.blocks.is_current(&prev), changed) {
                    (true, false) => BlockStatus::Current,
                    (true, true) => {
                        info!(pool = %pool.url, "Pool {} now up to date", pool.pool_no());
                        BlockStatus::CaughtUp
                    }
                    (false, changed) => {
                        if changed {
                            debug!(pool = %pool.url, "Pool {} is on an old block", pool.pool_no());
                        }
                        BlockStatus::Stale
                    }
                };
                if longpoll && status != BlockStatus::Stale {
                    work.work_block = self.blocks.bump();
                    if self.registry.strategy().is_shared() || self.registry.is_current(&pool) {
                        let source = if work.is_stratum() { "Stratum" } else { "Longpoll" };
                        info!(pool = %pool.url, "{} from pool {} requested work restart", source, pool.pool_no());
                        self.restart_threads();
                    }
                }
                status
            }
        };

        work.flags.remove(WorkFlags::LONGPOLL);
        status
    }

    /// Whether work can no longer be used or submitted.
    pub fn is_stale(&self, work: &Work, check: StaleCheck) -> bool {
        if self.config.benchmark {
            return false;
        }
        if work.work_block != self.blocks.work_block() {
            trace!(work_id = work.id, "Work stale due to block mismatch");
            return true;
        }

        let pool = &work.pool;
        if check == StaleCheck::Use && pool.has_stratum() {
            if !pool.stratum_ready() {
                trace!(work_id = work.id, "Work stale due to stratum inactive");
                return true;
            }
            let same_job = {
                let session = pool.session.read();
                let live = session
                    .stratum
                    .as_ref()
                    .and_then(|s| s.job.as_ref())
                    .map(|j| j.job_id.as_str());
                let ours = work.stratum.as_ref().map(|s| s.job_id.as_str());
                live.is_some() && live == ours
            };
            if !same_job {
                trace!(work_id = work.id, "Work stale due to stratum job_id mismatch");
                return true;
            }
        }

        // Age only limits work still to be hashed, never shares.
        if check == StaleCheck::Use {
            let latency = pool.health.lock().getwork_latency.ceil() as u64;
            let expiry = self
                .config
                .scan_time
                .max(u64::from(work.rolltime))
                .saturating_sub(latency)
                .max(MIN_EXPIRY);
            if work.times.staged.elapsed() >= Duration::from_secs(expiry) {
                trace!(work_id = work.id, "Work stale due to expiry");
                return true;
            }
        }

        if self.config.fail_only
            && check == StaleCheck::Use
            && !work.flags.contains(WorkFlags::MANDATORY)
            && !self.registry.strategy().is_shared()
            && !self.registry.is_current(pool)
        {
            trace!(work_id = work.id, "Work stale due to fail only pool mismatch");
            return true;
        }
        false
    }

    /// Drop unused work, returning its pool bookkeeping if it was never
    /// rolled, cloned or mined.
    pub fn discard_work(&self, work: Work) {
        if work.is_pristine() {
            {
                let mut stats = work.pool.stats.lock();
                stats.discarded += 1;
                stats.works = stats.works.saturating_sub(1);
            }
            self.registry.return_quota(&work.pool);
            self.stats.record_discarded(1);
        }
    }

    fn discard_where(&self, mut pred: impl FnMut(&Work) -> bool) -> usize {
        let ids: Vec<u64> = self
            .staging
            .snapshot()
            .iter()
            .filter(|w| pred(w))
            .map(|w| w.id)
            .collect();
        if ids.is_empty() {
            return 0;
        }
        let removed = self.staging.remove_ids(&ids);
        let count = removed.len();
        for work in removed {
            self.discard_work(work);
        }
        count
    }

    /// Remove every staged item belonging to `pool`.
    pub fn clear_pool_work(&self, pool: &Pool) -> usize {
        let cleared = self.discard_where(|w| std::ptr::eq(Arc::as_ptr(&w.pool), pool));
        if cleared > 0 {
            debug!(pool = %pool.url, cleared, "Cleared pool work");
        }
        cleared
    }

    /// Remove staged work that has gone stale.
    pub fn discard_stale(&self) -> usize {
        let stale = self.discard_where(|w| self.is_stale(w, StaleCheck::Use));
        if stale > 0 {
            debug!(stale, "Discarded stale work");
            self.staging.wake_scheduler();
        }
        stale
    }

    /// Invalidate everything in flight after a block change.
    pub fn restart_threads(&self) {
        if let Some(current) = self.registry.get_current() {
            current.tset_lagging();
        }
        self.discard_stale();
        self.restart.send_modify(|generation| *generation += 1);
        for device in self.devices.read().iter() {
            device.flush_work();
        }
    }

    /// Recompute the current pool and clear work from the one we left.
    pub fn switch_pools(&self, selected: Option<&Arc<Pool>>) -> Arc<Pool> {
        let (previous, current) = self.registry.switch_pools(selected);
        if !Arc::ptr_eq(&previous, &current)
            && !self.registry.strategy().is_shared()
            && (previous.localgen() || self.config.fail_only)
        {
            self.clear_pool_work(&previous);
        }
        current
    }

    pub fn pool_died(&self, pool: &Arc<Pool>) {
        if self.registry.pool_died(pool) && self.registry.is_current(pool) {
            self.switch_pools(None);
        }
    }

    pub fn pool_resus(&self, pool: &Arc<Pool>) {
        self.registry.pool_resus(pool);
    }

    /// Roll work while it is young enough to be worth it.
    pub fn should_roll(&self, work: &Work) -> bool {
        if !self.registry.strategy().is_shared() && !self.registry.is_current(&work.pool) {
            return false;
        }
        let expiry = self.config.scan_time.max(u64::from(work.rolltime)) * 2 / 3;
        work.times.staged.elapsed() <= Duration::from_secs(expiry)
    }

    fn rollable_now(&self, work: &Work) -> bool {
        work.can_roll() && !self.is_stale(work, StaleCheck::Use) && self.should_roll(work)
    }

    /// Serve demand by rolling a staged master. Returns true if a clone was
    /// staged.
    pub fn clone_available(&self) -> bool {
        for master in self.staging.rollable_snapshot() {
            if !self.rollable_now(&master) {
                continue;
            }
            if let Some(clone) = self.staging.roll_and_clone(master.id, &self.ids) {
                debug!(master = master.id, work_id = clone.id, "Pushing cloned available work");
                self.stage_work(clone);
                return true;
            }
        }
        false
    }

    /// Stage longpoll work, first fanning it out into rolled clones so every
    /// thread has something from the new block.
    pub fn clone_burst(&self, mut work: Work) {
        let staged = self.staging.len();
        let mut remaining = (self.mining_threads() + self.config.queue).saturating_sub(staged);

        if remaining > 0 {
            let mut pending = work.clone_with_id(self.ids.next());
            while remaining > 0 && self.rollable_now(&work) {
                remaining -= 1;
                self.stage_work(pending);
                work.roll(self.ids.next());
                pending = work.clone_with_id(self.ids.next());
                work.roll(self.ids.next());
            }
        }
        self.stage_work(work);
    }

    /// Next usable work for a device thread, waiting if none is staged.
    pub async fn get_work(&self, thr_id: usize) -> Work {
        let mut work = loop {
            let work = self.staging.pop().await;
            if self.is_stale(&work, StaleCheck::Use) {
                self.discard_work(work);
                self.staging.wake_scheduler();
                continue;
            }
            break work;
        };

        self.stats.note_getwork(thr_id);
        trace!(thr_id, work_id = work.id, "Got work from get queue");
        work.thr_id = Some(thr_id);
        work.flags.insert(WorkFlags::MINED);
        work.times.work_start = Some(Instant::now());
        work.device_diff = work.difficulty;
        if work.pool.is_benchmark() {
            work.flags.insert(WorkFlags::MANDATORY);
        }
        work
    }

    /// Check a nonce found on `work` and submit it if it is a share.
    ///
    /// Returns false only for a hardware error (the nonce does not even meet
    /// difficulty 1).
    pub fn submit_nonce(self: &Arc<Self>, thr_id: usize, work: &Work, nonce: u32) -> bool {
        let mut work = work.clone();
        work.set_nonce(nonce);
        work.hash = header_hash(&work.data);

        if !meets_target(&work.hash, &difficulty_to_target(1.0)) {
            self.stats.record_hw_error(thr_id);
            warn!(thr_id, nonce = %format!("{nonce:08x}"), "Invalid nonce - HW error");
            return false;
        }

        self.stats.record_diff1(&work.pool, thr_id, work.device_diff.max(1.0));
        work.share_diff = share_difficulty(&work.hash);
        if self.stats.note_best_share(&work.pool, work.share_diff) {
            debug!(share_diff = work.share_diff, "New best share");
        }

        if !meets_target(&work.hash, &work.target) {
            trace!(thr_id, share_diff = work.share_diff, "Share above target");
            return true;
        }

        let network = Target::from_compact(CompactTarget::from_consensus(work.nbits())).to_le_bytes();
        if meets_target(&work.hash, &network) {
            work.flags.insert(WorkFlags::BLOCK_FOUND);
            self.stats.record_block_found();
            warn!(pool = %work.pool.url, "Found block for pool {}!", work.pool.pool_no());
        }

        submit::submit_solution(self, work);
        true
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::config::PoolConfig;
    use crate::work::header::HeaderFields;

    pub fn config(pools: usize) -> Config {
        Config {
            pools: (0..pools)
                .map(|i| PoolConfig {
                    url: format!("http://node{i}:8332"),
                    user: "worker".into(),
                    pass: "x".into(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn engine(pools: usize) -> Arc<Engine> {
        Engine::new(config(pools)).unwrap()
    }

    pub fn prev_hash(n: u8) -> [u8; 32] {
        let mut h = [0u8; 32];
        h[31] = n;
        h
    }

    /// Work on block `block` with an easy target.
    pub fn work_on(engine: &Engine, pool: &Arc<Pool>, block: u8) -> Work {
        let mut work = engine.make_work(pool);
        work.set_header(&HeaderFields {
            version: 0x2000_0000,
            prev_hash: prev_hash(block),
            merkle_root: [0x11; 32],
            ntime: 1_700_000_000,
            nbits: 0x1d00ffff,
            nonce: 0,
        });
        work.set_target(difficulty_to_target(1.0));
        work
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::pool::Strategy;

    #[tokio::test]
    async fn test_first_block_then_seen_then_new() {
        let engine = engine(1);
        let pool = engine.registry.current();

        let mut first = work_on(&engine, &pool, 1);
        assert_eq!(engine.test_work_current(&mut first), BlockStatus::First);
        let mut again = work_on(&engine, &pool, 1);
        assert_eq!(engine.test_work_current(&mut again), BlockStatus::Current);
        assert_eq!(engine.blocks.seen_count(), 1);

        let mut restart = engine.subscribe_restart();
        let mut next = work_on(&engine, &pool, 2);
        assert_eq!(engine.test_work_current(&mut next), BlockStatus::New);
        assert_eq!(next.work_block, 1);
        assert!(restart.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_lagging_pool_is_stale_then_caught_up() {
        let engine = engine(2);
        let a = engine.registry.get(0).unwrap();
        let b = engine.registry.get(1).unwrap();

        engine.stage_work(work_on(&engine, &a, 1));
        engine.stage_work(work_on(&engine, &a, 2));
        // b still reports block 1.
        let mut old = work_on(&engine, &b, 1);
        assert_eq!(engine.test_work_current(&mut old), BlockStatus::Stale);
        assert!(!engine.stage_work(work_on(&engine, &b, 1)));
        let mut caught_up = work_on(&engine, &b, 2);
        assert_eq!(engine.test_work_current(&mut caught_up), BlockStatus::CaughtUp);
    }

    #[tokio::test]
    async fn test_new_block_discards_old_work() {
        let engine = engine(1);
        let pool = engine.registry.current();
        assert!(engine.stage_work(work_on(&engine, &pool, 1)));
        assert!(engine.stage_work(work_on(&engine, &pool, 1)));
        assert_eq!(engine.staging.len(), 2);

        assert!(engine.stage_work(work_on(&engine, &pool, 2)));
        assert_eq!(engine.staging.len(), 1);
        assert_eq!(engine.stats.totals().discarded, 2);
        assert_eq!(pool.stats.lock().discarded, 2);
    }

    #[tokio::test]
    async fn test_longpoll_on_seen_block_restarts() {
        let engine = engine(1);
        let pool = engine.registry.current();
        engine.stage_work(work_on(&engine, &pool, 1));
        let mut restart = engine.subscribe_restart();

        let mut lp = work_on(&engine, &pool, 1);
        lp.flags.insert(WorkFlags::LONGPOLL);
        lp.work_block = engine.blocks.work_block();
        assert_eq!(engine.test_work_current(&mut lp), BlockStatus::Current);
        assert_eq!(lp.work_block, 1);
        assert!(!lp.flags.contains(WorkFlags::LONGPOLL));
        assert!(restart.has_changed().unwrap());
        assert!(engine.staging.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_staleness() {
        let engine = engine(1);
        let pool = engine.registry.current();
        let work = work_on(&engine, &pool, 1);
        assert!(!engine.is_stale(&work, StaleCheck::Use));
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!engine.is_stale(&work, StaleCheck::Use));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(engine.is_stale(&work, StaleCheck::Use));
        // A share on the same block is still worth submitting.
        assert!(!engine.is_stale(&work, StaleCheck::Submit));

        pool.record_getwork_latency(2.4);
        let work = work_on(&engine, &pool, 1);
        tokio::time::advance(Duration::from_secs(57)).await;
        assert!(engine.is_stale(&work, StaleCheck::Use));
    }

    #[tokio::test]
    async fn test_stratum_job_mismatch_is_stale_for_use_only() {
        let engine = engine(1);
        let pool = engine.registry.current();
        pool.set_capabilities(Capabilities::STRATUM);
        pool.set_stratum_active(true);
        pool.set_stratum_notify(true);
        {
            let mut session = pool.session.write();
            session.stratum = Some(crate::pool::StratumSession {
                job: Some(crate::pool::StratumJob {
                    job_id: "b".into(),
                    prev_hash: [0; 32],
                    coinbase: vec![],
                    nonce2_offset: 0,
                    merkle_branches: vec![],
                    version: 0,
                    nbits: 0,
                    ntime: 0,
                    clean: false,
                }),
                ..Default::default()
            });
        }
        let mut work = work_on(&engine, &pool, 1);
        work.flags.insert(WorkFlags::STRATUM);
        work.stratum = Some(crate::work::StratumFields {
            job_id: "a".into(),
            nonce1: String::new(),
            nonce2: 0,
            nonce2_len: 4,
            ntime: String::new(),
        });
        assert!(engine.is_stale(&work, StaleCheck::Use));
        assert!(!engine.is_stale(&work, StaleCheck::Submit));
    }

    #[tokio::test]
    async fn test_fail_only_backup_work_is_stale() {
        let mut config = config(2);
        config.fail_only = true;
        let engine = Engine::new(config).unwrap();
        let backup = engine.registry.get(1).unwrap();
        let mut work = work_on(&engine, &backup, 1);
        assert!(engine.is_stale(&work, StaleCheck::Use));
        assert!(!engine.is_stale(&work, StaleCheck::Submit));
        work.flags.insert(WorkFlags::MANDATORY);
        assert!(!engine.is_stale(&work, StaleCheck::Use));
    }

    #[tokio::test]
    async fn test_discard_returns_bookkeeping_only_for_pristine() {
        let engine = engine(1);
        let pool = engine.registry.current();
        pool.stats.lock().works = 2;

        let pristine = work_on(&engine, &pool, 1);
        let mut clone = pristine.clone_with_id(engine.ids.next());
        clone.flags.insert(WorkFlags::CLONE);
        engine.discard_work(clone);
        assert_eq!(engine.stats.totals().discarded, 0);

        engine.discard_work(pristine);
        assert_eq!(engine.stats.totals().discarded, 1);
        assert_eq!(pool.stats.lock().works, 1);
    }

    #[tokio::test]
    async fn test_switch_clears_localgen_work() {
        let engine = engine(2);
        let a = engine.registry.get(0).unwrap();
        a.set_capabilities(Capabilities::GBT);
        engine.stage_work(work_on(&engine, &a, 1));
        engine.stage_work(work_on(&engine, &a, 1));

        engine.pool_died(&a);
        assert_eq!(engine.registry.current().pool_no(), 1);
        assert!(engine.staging.is_empty());
    }

    #[tokio::test]
    async fn test_getwork_pool_switch_keeps_work() {
        let engine = engine(2);
        let a = engine.registry.get(0).unwrap();
        engine.stage_work(work_on(&engine, &a, 1));
        engine.pool_died(&a);
        assert_eq!(engine.registry.current().pool_no(), 1);
        assert_eq!(engine.staging.len(), 1);
    }

    #[tokio::test]
    async fn test_clone_available_rolls_master() {
        let engine = engine(1);
        let pool = engine.registry.current();
        let mut master = work_on(&engine, &pool, 1);
        master.rolltime = 60;
        let ntime = master.ntime();
        engine.stage_work(master);

        assert!(engine.clone_available());
        assert_eq!(engine.staging.len(), 2);
        // The clone is preferred since it is not rollable.
        let clone = engine.staging.try_pop().unwrap();
        assert!(clone.is_clone());
        assert_eq!(clone.ntime(), ntime + 1);
        let master = engine.staging.try_pop().unwrap();
        assert_eq!(master.ntime(), ntime + 2);
        assert_eq!(master.rolls, 2);
    }

    #[tokio::test]
    async fn test_clone_available_skips_non_current_pool() {
        let engine = engine(2);
        let backup = engine.registry.get(1).unwrap();
        let mut master = work_on(&engine, &backup, 1);
        master.rolltime = 60;
        engine.stage_work(master);
        assert!(!engine.clone_available());
    }

    #[tokio::test]
    async fn test_clone_burst_fills_threads_and_queue() {
        let mut config = config(1);
        config.queue = 3;
        config.strategy = Strategy::Failover;
        let engine = Engine::new(config).unwrap();
        let pool = engine.registry.current();
        let mut work = work_on(&engine, &pool, 1);
        work.rolltime = 60;
        engine.clone_burst(work);

        // One thread plus a queue of three, with the master staged last.
        assert_eq!(engine.staging.len(), 5);
        let mut ntimes: Vec<u32> = engine.staging.snapshot().iter().map(|w| w.ntime()).collect();
        ntimes.sort_unstable();
        ntimes.dedup();
        assert_eq!(ntimes.len(), 5);
    }

    #[tokio::test]
    async fn test_get_work_skips_stale() {
        let engine = engine(1);
        let pool = engine.registry.current();
        let good = work_on(&engine, &pool, 1);
        let mut stale = work_on(&engine, &pool, 1);
        stale.work_block = 99;
        stale.times.staged = Instant::now() - Duration::from_secs(1);
        // Push directly so the stale generation survives staging.
        engine.staging.push(stale);
        engine.stage_work(good);
        let work = engine.get_work(0).await;
        assert_eq!(work.thr_id, Some(0));
        assert!(work.flags.contains(WorkFlags::MINED));
        assert!(engine.staging.is_empty());
    }

    #[tokio::test]
    async fn test_submit_nonce_rejects_hw_error() {
        let engine = engine(1);
        let pool = engine.registry.current();
        let work = work_on(&engine, &pool, 1);
        assert!(!engine.submit_nonce(0, &work, 0x1234_5678));
        assert_eq!(engine.stats.totals().hw_errors, 1);
    }
}
