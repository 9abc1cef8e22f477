//! Process-wide share and work counters.
//!
//! Per-pool counters live on the pool; this module keeps the totals, the
//! per-thread device counters, and the best share ever found. Every method
//! takes its locks for the duration of the update only.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::pool::Pool;

/// Totals across every pool and device.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Totals {
    pub accepted: u64,
    pub rejected: u64,
    pub stale: u64,
    pub diff_accepted: f64,
    pub diff_rejected: f64,
    pub diff_stale: f64,
    pub diff1: f64,
    pub hw_errors: u64,
    pub discarded: u64,
    pub getfail_occasions: u64,
    pub remotefail_occasions: u64,
    pub blocks_found: u64,
    pub best_share: u64,
}

/// Counters for one device thread.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeviceStats {
    pub device: String,
    pub device_id: u32,
    pub accepted: u64,
    pub rejected: u64,
    pub diff_accepted: f64,
    pub diff_rejected: f64,
    pub diff1: f64,
    pub hw_errors: u64,
    pub last_share: Option<Instant>,
    /// Last time the thread asked for work, watched for stalls.
    pub last_getwork: Option<Instant>,
}

#[derive(Debug)]
pub struct Stats {
    totals: Mutex<Totals>,
    devices: Mutex<BTreeMap<usize, DeviceStats>>,
    started: Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            totals: Mutex::new(Totals::default()),
            devices: Mutex::new(BTreeMap::new()),
            started: Instant::now(),
        }
    }

    pub fn totals(&self) -> Totals {
        self.totals.lock().clone()
    }

    pub fn register_thread(&self, thr_id: usize, device: &str, device_id: u32) {
        self.devices.lock().insert(
            thr_id,
            DeviceStats {
                device: device.to_string(),
                device_id,
                ..Default::default()
            },
        );
    }

    pub fn device(&self, thr_id: usize) -> Option<DeviceStats> {
        self.devices.lock().get(&thr_id).cloned()
    }

    pub fn devices(&self) -> Vec<(usize, DeviceStats)> {
        self.devices
            .lock()
            .iter()
            .map(|(&id, stats)| (id, stats.clone()))
            .collect()
    }

    /// Name and id of the device running `thr_id`.
    pub fn device_label(&self, thr_id: Option<usize>) -> (String, u32) {
        thr_id
            .and_then(|id| self.devices.lock().get(&id).map(|d| (d.device.clone(), d.device_id)))
            .unwrap_or_default()
    }

    /// Accepted shares per minute since startup.
    pub fn utility(&self) -> f64 {
        let minutes = self.started.elapsed().as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        self.totals.lock().accepted as f64 / minutes
    }

    pub fn note_getwork(&self, thr_id: usize) {
        if let Some(dev) = self.devices.lock().get_mut(&thr_id) {
            dev.last_getwork = Some(Instant::now());
        }
    }

    /// Threads that have not asked for work since `cutoff`.
    pub fn stalled_threads(&self, cutoff: Instant) -> Vec<(usize, String)> {
        self.devices
            .lock()
            .iter()
            .filter(|(_, d)| d.last_getwork.is_some_and(|t| t < cutoff))
            .map(|(&id, d)| (id, d.device.clone()))
            .collect()
    }

    pub fn record_hw_error(&self, thr_id: usize) {
        self.totals.lock().hw_errors += 1;
        if let Some(dev) = self.devices.lock().get_mut(&thr_id) {
            dev.hw_errors += 1;
        }
    }

    /// Credit a nonce that met difficulty 1.
    pub fn record_diff1(&self, pool: &Pool, thr_id: usize, diff: f64) {
        self.totals.lock().diff1 += diff;
        pool.stats.lock().diff1 += diff;
        if let Some(dev) = self.devices.lock().get_mut(&thr_id) {
            dev.diff1 += diff;
        }
    }

    /// Track the best share difficulty. Returns true on a new process best.
    pub fn note_best_share(&self, pool: &Pool, share_diff: u64) -> bool {
        {
            let mut stats = pool.stats.lock();
            if share_diff > stats.best_diff {
                stats.best_diff = share_diff;
            }
        }
        let mut totals = self.totals.lock();
        if share_diff > totals.best_share {
            totals.best_share = share_diff;
            true
        } else {
            false
        }
    }

    pub fn record_accept(&self, pool: &Pool, thr_id: Option<usize>, diff: f64) {
        {
            let mut totals = self.totals.lock();
            totals.accepted += 1;
            totals.diff_accepted += diff;
        }
        {
            let mut stats = pool.stats.lock();
            stats.accepted += 1;
            stats.diff_accepted += diff;
            stats.seq_rejects = 0;
            stats.last_share_time = Some(Instant::now());
            stats.last_share_diff = diff;
        }
        if let Some(id) = thr_id {
            if let Some(dev) = self.devices.lock().get_mut(&id) {
                dev.accepted += 1;
                dev.diff_accepted += diff;
                dev.last_share = Some(Instant::now());
            }
        }
    }

    /// Count a reject. Returns the pool's sequential reject streak.
    pub fn record_reject(&self, pool: &Pool, thr_id: Option<usize>, diff: f64) -> u32 {
        {
            let mut totals = self.totals.lock();
            totals.rejected += 1;
            totals.diff_rejected += diff;
        }
        let seq_rejects = {
            let mut stats = pool.stats.lock();
            stats.rejected += 1;
            stats.diff_rejected += diff;
            stats.seq_rejects += 1;
            stats.seq_rejects
        };
        if let Some(id) = thr_id {
            if let Some(dev) = self.devices.lock().get_mut(&id) {
                dev.rejected += 1;
                dev.diff_rejected += diff;
            }
        }
        seq_rejects
    }

    pub fn record_stale(&self, pool: &Pool, diff: f64) {
        {
            let mut totals = self.totals.lock();
            totals.stale += 1;
            totals.diff_stale += diff;
        }
        let mut stats = pool.stats.lock();
        stats.stale += 1;
        stats.diff_stale += diff;
    }

    pub fn record_discarded(&self, count: u64) {
        self.totals.lock().discarded += count;
    }

    pub fn record_getfail(&self, pool: &Pool) {
        self.totals.lock().getfail_occasions += 1;
        pool.stats.lock().getfail_occasions += 1;
    }

    pub fn record_remotefail(&self, pool: &Pool) {
        self.totals.lock().remotefail_occasions += 1;
        pool.stats.lock().remotefail_occasions += 1;
    }

    pub fn record_block_found(&self) {
        self.totals.lock().blocks_found += 1;
    }
}
