//! Background housekeeping: pool health checks and the watchdog.
//!
//! [`watch_pools`] brings dead pools back, fails back to better pools once
//! they have been stable, drives the rotate strategy and refreshes balance
//! utility. [`watchdog`] prunes stale staged work, forgets stratum shares the
//! pool never answered, and reports device threads that stopped asking for
//! work.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::engine::Engine;
use crate::pool::{Pool, PoolState, Strategy};
use crate::rpc::probe;
use crate::stratum_v1::RESUBMIT_WINDOW;
use crate::tracing::prelude::*;

const POOL_CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// Minimum spacing between probes of an idle pool.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Probe spacing when there is nothing to fail over to.
const SOLE_PROBE_INTERVAL: Duration = Duration::from_secs(3);

const BALANCE_INTERVAL: Duration = Duration::from_secs(600);

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

/// A device thread that has not asked for work for this long is reported.
const STALL_CUTOFF: Duration = Duration::from_secs(60);

fn probe_due(pool: &Pool, interval: Duration, now: Instant) -> bool {
    pool.health
        .lock()
        .last_probe
        .map_or(true, |t| now.duration_since(t) >= interval)
}

/// One pass of the pool health check.
async fn check_pools(engine: &Engine, now: Instant) {
    let interval = if engine.registry.enabled_count() <= 1 {
        SOLE_PROBE_INTERVAL
    } else {
        PROBE_INTERVAL
    };

    for pool in engine.registry.pools() {
        if pool.is_removed() || pool.state() == PoolState::Disabled {
            continue;
        }
        // Stratum pools come back through their own session.
        if pool.has_stratum() || pool.is_benchmark() {
            continue;
        }
        if pool.is_idle() && probe_due(&pool, interval, now) {
            debug!(pool = %pool.url, "Probing idle pool {}", pool.pool_no());
            if probe::pool_active(engine, &pool).await {
                engine.pool_resus(&pool);
            }
        }
    }

    let current = engine.registry.current();
    if current.is_unusable() {
        engine.switch_pools(None);
    } else if engine.registry.strategy() == Strategy::Failover {
        if let Some(better) = engine.registry.failback_candidate() {
            info!(pool = %better.url, "Failing back to pool {}", better.pool_no());
            engine.switch_pools(None);
        }
    }
}

/// Pool health-check loop.
pub async fn watch_pools(engine: Arc<Engine>) {
    let mut ticker = tokio::time::interval(POOL_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let rotate_period = Duration::from_secs(engine.config.rotate_period * 60);
    let mut last_rotate = Instant::now();
    let mut last_balance = Instant::now();

    loop {
        tokio::select! {
            _ = engine.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();

        check_pools(&engine, now).await;

        if engine.registry.strategy() == Strategy::Rotate
            && !rotate_period.is_zero()
            && now.duration_since(last_rotate) >= rotate_period
        {
            last_rotate = now;
            let current = engine.switch_pools(None);
            info!(pool = %current.url, "Rotated to pool {}", current.pool_no());
        }

        if engine.registry.strategy() == Strategy::Balance
            && now.duration_since(last_balance) >= BALANCE_INTERVAL
        {
            last_balance = now;
            engine.registry.update_balance_utility();
        }
    }
    debug!("Pool watcher stopped");
}

/// Drop in-flight stratum shares that have waited longer than the resubmit
/// window for an answer. Late answers for them are accounted as untracked.
fn expire_inflight(pool: &Pool, now: Instant) -> usize {
    let mut inflight = pool.inflight.lock();
    let before = inflight.len();
    inflight.retain(|_, share| now.duration_since(share.submitted) < RESUBMIT_WINDOW);
    before - inflight.len()
}

/// One watchdog pass. Returns the stalled threads seen.
fn watchdog_pass(engine: &Engine, now: Instant, warned: &mut HashSet<usize>) -> HashSet<usize> {
    let discarded = engine.discard_stale();
    if discarded > 0 {
        debug!(discarded, "Watchdog discarded stale work");
    }

    for pool in engine.registry.pools() {
        let expired = expire_inflight(&pool, now);
        if expired > 0 {
            warn!(
                pool = %pool.url,
                expired,
                "Pool {} never answered {} shares",
                pool.pool_no(),
                expired
            );
        }
    }

    let stalled: HashSet<usize> = match now.checked_sub(STALL_CUTOFF) {
        Some(cutoff) => engine
            .stats
            .stalled_threads(cutoff)
            .into_iter()
            .map(|(thr_id, device)| {
                if !warned.contains(&thr_id) {
                    warn!(thr_id, device = %device, "Thread {} idle for over {}s", thr_id, STALL_CUTOFF.as_secs());
                }
                thr_id
            })
            .collect(),
        None => HashSet::new(),
    };
    warned.retain(|id| stalled.contains(id));
    warned.extend(stalled.iter().copied());
    stalled
}

/// Watchdog loop.
pub async fn watchdog(engine: Arc<Engine>) {
    let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut warned = HashSet::new();

    loop {
        tokio::select! {
            _ = engine.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        watchdog_pass(&engine, Instant::now(), &mut warned);
    }
    debug!("Watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::test_util::{config, engine, work_on};
    use crate::pool::{Capabilities, InflightShare};

    #[tokio::test(start_paused = true)]
    async fn test_expire_inflight() {
        let engine = engine(1);
        let pool = engine.registry.current();
        pool.set_capabilities(Capabilities::STRATUM);
        let work = work_on(&engine, &pool, 1);

        let old = Instant::now();
        pool.inflight.lock().insert(
            4,
            InflightShare {
                id: 4,
                work: work.clone(),
                submitted: old,
                sent: old,
            },
        );
        tokio::time::advance(Duration::from_secs(100)).await;
        let recent = Instant::now();
        pool.inflight.lock().insert(
            5,
            InflightShare {
                id: 5,
                work,
                submitted: recent,
                sent: recent,
            },
        );

        assert_eq!(expire_inflight(&pool, Instant::now()), 0);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(expire_inflight(&pool, Instant::now()), 1);
        assert!(pool.inflight.lock().contains_key(&5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_thread_warned_once() {
        let engine = engine(1);
        engine.stats.register_thread(0, "cpu", 0);
        engine.stats.note_getwork(0);
        let mut warned = HashSet::new();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(watchdog_pass(&engine, Instant::now(), &mut warned).is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let stalled = watchdog_pass(&engine, Instant::now(), &mut warned);
        assert!(stalled.contains(&0));
        assert!(warned.contains(&0));

        engine.stats.note_getwork(0);
        assert!(watchdog_pass(&engine, Instant::now(), &mut warned).is_empty());
        assert!(warned.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_prunes_expired_work() {
        let engine = engine(1);
        let pool = engine.registry.current();
        engine.stage_work(work_on(&engine, &pool, 1));

        watchdog_pass(&engine, Instant::now(), &mut HashSet::new());
        assert_eq!(engine.staging.len(), 1);

        // Scan time is 60s.
        tokio::time::advance(Duration::from_secs(61)).await;
        watchdog_pass(&engine, Instant::now(), &mut HashSet::new());
        assert!(engine.staging.is_empty());
        assert_eq!(pool.stats.lock().discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switches_off_dead_current() {
        let engine = engine(2);
        let first = engine.registry.current();
        assert_eq!(first.pool_no(), 0);
        engine.registry.pool_died(&first);

        // Keep the idle pool's probe off the network.
        first.health.lock().last_probe = Some(Instant::now());
        check_pools(&engine, Instant::now()).await;
        assert_eq!(engine.registry.current().pool_no(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotate_switches_after_period() {
        let mut config = config(2);
        config.strategy = Strategy::Rotate;
        config.rotate_period = 1;
        let engine = Engine::new(config).unwrap();
        for pool in engine.registry.pools() {
            pool.health.lock().last_probe = Some(Instant::now());
        }

        let task = tokio::spawn(watch_pools(engine.clone()));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.registry.current().pool_no(), 0);
        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(engine.registry.current().pool_no(), 1);

        engine.shutdown.cancel();
        task.await.unwrap();
    }
}
