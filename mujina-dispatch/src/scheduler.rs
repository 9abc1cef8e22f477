//! The dispatch loop: keeps the staging table topped up from the pools.
//!
//! One task fills the table to the adaptive queue depth, sleeping while it
//! is full until a consumer takes work or stale work is discarded. Pools that
//! generate work locally (stratum, templates, benchmark) are served straight
//! from their session. Getwork pools are served by rolling a staged master
//! where possible and by a network fetch otherwise. Network errors stay
//! here; they only ever show up as pool health flags.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::benchmark;
use crate::engine::Engine;
use crate::error::Error;
use crate::pool::Pool;
use crate::rpc;
use crate::stratum_v1;
use crate::tracing::prelude::*;
use crate::work::Work;

/// How long to wait for a local-generation pool before trying another.
const POOL_WAIT: Duration = Duration::from_secs(5);

const READY_POLL: Duration = Duration::from_millis(100);

/// Pause after a failed getwork fetch.
const GETFAIL_BACKOFF: Duration = Duration::from_secs(5);

/// Pause after a pool produced work that could not be staged, usually
/// because it is still on an older block than the network.
const DROPPED_BACKOFF: Duration = Duration::from_secs(1);

/// Outcome of one attempt to add work.
#[derive(Debug)]
enum Fill {
    Staged,
    /// A staged master was rolled instead of fetching.
    Cloned,
    /// The work was built but not staged.
    Dropped,
    /// Try again with this pool.
    Retry(Arc<Pool>),
    Shutdown,
}

/// Staged items to hold before the scheduler stops fetching.
///
/// Getwork pools that cannot roll get one extra item per mining thread.
pub fn max_staged(engine: &Engine) -> usize {
    let mut max = engine.staging.max_queue();
    if !engine.registry.current().localgen() && engine.staging.rollable() == 0 {
        max += engine.mining_threads();
    }
    max
}

/// Whether a local-generation pool can build work right now.
fn ready(pool: &Pool) -> bool {
    if pool.has_stratum() {
        pool.stratum_ready()
    } else {
        !pool.is_idle()
    }
}

/// Sleep unless shutting down. Returns false on shutdown.
async fn pause(engine: &Engine, duration: Duration) -> bool {
    tokio::select! {
        _ = engine.shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Wait up to [`POOL_WAIT`] for `pool` to become ready. `None` on shutdown.
async fn wait_ready(engine: &Engine, pool: &Pool) -> Option<bool> {
    let deadline = Instant::now() + POOL_WAIT;
    while !ready(pool) {
        if Instant::now() >= deadline {
            return Some(false);
        }
        if !pause(engine, READY_POLL).await {
            return None;
        }
    }
    Some(true)
}

/// Count a failed fetch, declaring the pool dead after too many in a row.
/// Returns the consecutive failure count.
fn note_getfail(engine: &Engine, pool: &Arc<Pool>, error: &Error) -> u32 {
    engine.stats.record_getfail(pool);
    let fails = {
        let mut health = pool.health.lock();
        health.seq_getfails += 1;
        health.seq_getfails
    };
    debug!(
        pool = %pool.url,
        error = %error,
        fails,
        "Pool {} failed on get work, retrying in {}s",
        pool.pool_no(),
        GETFAIL_BACKOFF.as_secs()
    );
    if fails as usize > engine.mining_threads() + engine.config.queue {
        engine.pool_died(pool);
    }
    fails
}

fn stage(engine: &Engine, work: Work) -> Fill {
    if engine.stage_work(work) {
        Fill::Staged
    } else {
        Fill::Dropped
    }
}

async fn failed(engine: &Engine, pool: &Arc<Pool>, error: Error) -> Fill {
    note_getfail(engine, pool, &error);
    if !pause(engine, GETFAIL_BACKOFF).await {
        return Fill::Shutdown;
    }
    Fill::Retry(engine.registry.select_pool(!engine.config.fail_only))
}

/// Try to add one item of work from `pool`.
async fn fill_from(engine: &Engine, pool: &Arc<Pool>) -> Fill {
    if pool.is_benchmark() {
        return stage(engine, benchmark::gen_benchmark_work(engine, pool));
    }

    if pool.localgen() {
        if !ready(pool) {
            let alternate = engine.registry.select_pool(true);
            match wait_ready(engine, pool).await {
                None => return Fill::Shutdown,
                Some(true) => {}
                Some(false) => {
                    if !Arc::ptr_eq(&alternate, pool) {
                        debug!(
                            pool = %pool.url,
                            alternate = %alternate.url,
                            "Pool {} not ready, trying pool {}",
                            pool.pool_no(),
                            alternate.pool_no()
                        );
                    }
                    return Fill::Retry(alternate);
                }
            }
        }

        let work = if pool.has_stratum() {
            stratum_v1::gen_stratum_work(engine, pool)
        } else {
            rpc::gbt::gen_gbt_work(engine, pool).await
        };
        return match work {
            Ok(work) => stage(engine, work),
            Err(e) => failed(engine, pool, e).await,
        };
    }

    if engine.clone_available() {
        debug!("Cloned getwork work");
        return Fill::Cloned;
    }
    match rpc::getwork::fetch(engine, pool).await {
        Ok(work) => {
            debug!(pool = %pool.url, work_id = work.id, "Generated getwork work");
            stage(engine, work)
        }
        Err(e) => failed(engine, pool, e).await,
    }
}

/// Bookkeeping after `pool` delivered work.
fn after_staged(engine: &Engine, pool: &Arc<Pool>, max_staged: usize) {
    if engine.staging.len() >= max_staged {
        pool.tclear_lagging();
    }
    engine.pool_resus(pool);
}

/// Run the dispatch loop until shutdown.
pub async fn scheduler_task(engine: Arc<Engine>) {
    info!("Scheduler started");
    let mut retry: Option<Arc<Pool>> = None;

    loop {
        if engine.shutdown.is_cancelled() {
            break;
        }
        engine.propagate_work_update();

        let current = engine.registry.current();
        let max = max_staged(&engine);
        let staged = engine.staging.len();
        if retry.is_none() && staged > max {
            engine.staging.note_filled();
            tokio::select! {
                _ = engine.shutdown.cancelled() => break,
                _ = engine.staging.wait_needed() => {}
            }
            continue;
        }

        let lagging = staged == 0 && !current.localgen() && !engine.config.fail_only;
        let pool = match retry.take() {
            Some(pool) => pool,
            None => engine.registry.select_pool(lagging),
        };
        trace!(pool = pool.pool_no(), staged, max, "Filling staging table");

        match fill_from(&engine, &pool).await {
            Fill::Staged => after_staged(&engine, &pool, max),
            Fill::Cloned => {}
            Fill::Dropped => {
                if !pause(&engine, DROPPED_BACKOFF).await {
                    break;
                }
                retry = Some(engine.registry.select_pool(true));
            }
            Fill::Retry(next) => retry = Some(next),
            Fill::Shutdown => break,
        }
    }
    info!("Scheduler stopped");
}
