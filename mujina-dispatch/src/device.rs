//! The device-facing side of the engine.
//!
//! Hashing hardware plugs in through [`HashDevice`]. Each registered device
//! runs one [`mining_thread`] that pulls work through a [`ThreadContext`],
//! hands it to the device's `scan`, and loops. Devices never touch pools or
//! sessions; everything they need is on the context.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, StaleCheck};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::u256::meets_target;
use crate::types::difficulty_to_target;
use crate::work::header::{header_hash, write_u32, NONCE_OFFSET};
use crate::work::Work;

/// A source of hashes.
#[async_trait]
pub trait HashDevice: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn device_id(&self) -> u32;

    /// Current work is invalid; abandon it at the next safe point.
    fn flush_work(&self);

    /// Fresher work is available; switch when convenient.
    fn update_work(&self);

    /// Lowest and highest difficulty the device can be asked to find.
    fn diff_limits(&self) -> (f64, f64) {
        (1.0, f64::MAX)
    }

    /// Hash `work`, submitting nonces through `ctx`. Returns hashes done.
    async fn scan(&self, ctx: &ThreadContext, work: &Work) -> Result<u64>;
}

/// Everything a device thread may call into.
#[derive(Debug)]
pub struct ThreadContext {
    engine: Arc<Engine>,
    thr_id: usize,
    restart: watch::Receiver<u64>,
    seen_restart: AtomicU64,
}

impl ThreadContext {
    pub fn new(engine: Arc<Engine>, thr_id: usize) -> Self {
        let restart = engine.subscribe_restart();
        let seen = *restart.borrow();
        Self {
            engine,
            thr_id,
            restart,
            seen_restart: AtomicU64::new(seen),
        }
    }

    pub fn thr_id(&self) -> usize {
        self.thr_id
    }

    /// Next work, with the device difficulty clamped to `limits`.
    pub async fn get_work(&self, limits: (f64, f64)) -> Work {
        let mut work = self.engine.get_work(self.thr_id).await;
        work.device_diff = work.device_diff.clamp(limits.0, limits.1);
        work
    }

    pub fn submit_nonce(&self, work: &Work, nonce: u32) -> bool {
        self.engine.submit_nonce(self.thr_id, work, nonce)
    }

    pub fn discard_work(&self, work: Work) {
        self.engine.discard_work(work);
    }

    pub fn is_stale(&self, work: &Work) -> bool {
        self.engine.is_stale(work, StaleCheck::Use)
    }

    /// A restart was broadcast since the last [`acknowledge_restart`].
    ///
    /// [`acknowledge_restart`]: Self::acknowledge_restart
    pub fn restart_pending(&self) -> bool {
        *self.restart.borrow() != self.seen_restart.load(Ordering::SeqCst)
    }

    pub fn acknowledge_restart(&self) {
        self.seen_restart
            .store(*self.restart.borrow(), Ordering::SeqCst);
    }
}

/// Pull work and scan it until shutdown.
pub async fn mining_thread(ctx: ThreadContext, device: Arc<dyn HashDevice>, shutdown: CancellationToken) {
    info!(thr_id = ctx.thr_id(), device = device.name(), "Mining thread started");
    loop {
        let work = tokio::select! {
            _ = shutdown.cancelled() => break,
            work = ctx.get_work(device.diff_limits()) => work,
        };
        ctx.acknowledge_restart();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = device.scan(&ctx, &work) => match result {
                Ok(hashes) => trace!(thr_id = ctx.thr_id(), work_id = work.id, hashes, "Scan finished"),
                Err(e) => {
                    error!(thr_id = ctx.thr_id(), error = %e, "Scan failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }
    info!(thr_id = ctx.thr_id(), "Mining thread stopped");
}

/// Nonces scanned per blocking batch.
const CPU_BATCH: u32 = 1 << 18;

/// Reference device hashing on the CPU.
#[derive(Debug)]
pub struct CpuDevice {
    name: String,
    device_id: u32,
    first_nonce: u32,
    last_nonce: u32,
    abandon: AtomicBool,
}

impl CpuDevice {
    pub fn new(device_id: u32) -> Self {
        Self::with_range(device_id, 0, u32::MAX)
    }

    /// Scan only `first..=last` of each work item's nonce space.
    pub fn with_range(device_id: u32, first: u32, last: u32) -> Self {
        Self {
            name: "cpu".to_string(),
            device_id,
            first_nonce: first,
            last_nonce: last,
            abandon: AtomicBool::new(false),
        }
    }
}

/// Nonces in `first..=last` whose hash meets difficulty 1.
fn scan_batch(mut data: [u8; 128], first: u32, last: u32) -> Vec<u32> {
    let diff1 = difficulty_to_target(1.0);
    let mut found = Vec::new();
    let mut nonce = first;
    loop {
        write_u32(&mut data, NONCE_OFFSET, nonce);
        let hash = header_hash(&data);
        if hash[28..].iter().all(|&b| b == 0) && meets_target(&hash, &diff1) {
            found.push(nonce);
        }
        if nonce == last {
            break;
        }
        nonce += 1;
    }
    found
}

#[async_trait]
impl HashDevice for CpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn flush_work(&self) {
        self.abandon.store(true, Ordering::SeqCst);
    }

    fn update_work(&self) {
        self.abandon.store(true, Ordering::SeqCst);
    }

    async fn scan(&self, ctx: &ThreadContext, work: &Work) -> Result<u64> {
        self.abandon.store(false, Ordering::SeqCst);
        let mut hashes = 0u64;
        let mut start = self.first_nonce;

        loop {
            let end = start.saturating_add(CPU_BATCH - 1).min(self.last_nonce);
            let data = work.data;
            let found = tokio::task::spawn_blocking(move || scan_batch(data, start, end))
                .await
                .map_err(|e| Error::Other(format!("hashing task failed: {e}")))?;
            hashes += u64::from(end - start) + 1;

            for nonce in found {
                ctx.submit_nonce(work, nonce);
            }

            if end == self.last_nonce
                || self.abandon.load(Ordering::SeqCst)
                || ctx.restart_pending()
                || ctx.is_stale(work)
            {
                break;
            }
            start = end + 1;
        }
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::work::header::HeaderFields;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::hashes::Hash;
    use bitcoin::Network;

    const GENESIS_NONCE: u32 = 2_083_236_893;

    fn genesis_work(engine: &Arc<Engine>) -> Work {
        let header = genesis_block(Network::Bitcoin).header;
        let pool = engine.registry.current();
        let mut work = engine.make_work(&pool);
        work.set_header(&HeaderFields {
            version: header.version.to_consensus() as u32,
            prev_hash: header.prev_blockhash.to_byte_array(),
            merkle_root: header.merkle_root.to_byte_array(),
            ntime: header.time,
            nbits: header.bits.to_consensus(),
            nonce: 0,
        });
        work.set_target(difficulty_to_target(1.0));
        work
    }

    fn benchmark_engine() -> Arc<Engine> {
        Engine::new(Config {
            benchmark: true,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_scan_batch_finds_genesis_nonce() {
        let engine = benchmark_engine();
        let work = genesis_work(&engine);
        let found = scan_batch(work.data, GENESIS_NONCE - 50, GENESIS_NONCE + 50);
        assert_eq!(found, vec![GENESIS_NONCE]);
    }

    #[test]
    fn test_scan_batch_at_top_of_range() {
        let engine = benchmark_engine();
        let work = genesis_work(&engine);
        assert!(scan_batch(work.data, u32::MAX - 3, u32::MAX).is_empty());
    }

    #[tokio::test]
    async fn test_cpu_device_submits_found_share() {
        let engine = benchmark_engine();
        let device = Arc::new(CpuDevice::with_range(0, GENESIS_NONCE - 100, GENESIS_NONCE + 100));
        let thr_id = engine.register_device(device.clone());
        let ctx = ThreadContext::new(engine.clone(), thr_id);

        let mut work = genesis_work(&engine);
        work.thr_id = Some(thr_id);
        let hashes = device.scan(&ctx, &work).await.unwrap();
        assert_eq!(hashes, 201);

        let totals = engine.stats.totals();
        assert_eq!(totals.accepted, 1);
        assert_eq!(totals.blocks_found, 1);
        assert!(totals.best_share > 1);
        assert_eq!(engine.stats.device(thr_id).unwrap().accepted, 1);
    }

    #[tokio::test]
    async fn test_restart_is_seen_by_context() {
        let engine = benchmark_engine();
        let ctx = ThreadContext::new(engine.clone(), 0);
        assert!(!ctx.restart_pending());
        engine.restart_threads();
        assert!(ctx.restart_pending());
        ctx.acknowledge_restart();
        assert!(!ctx.restart_pending());
    }

    #[tokio::test]
    async fn test_flush_marks_device() {
        let engine = benchmark_engine();
        let device = Arc::new(CpuDevice::new(0));
        engine.register_device(device.clone());
        engine.restart_threads();
        assert!(device.abandon.load(Ordering::SeqCst));
    }
}
