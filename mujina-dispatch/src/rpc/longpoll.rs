//! Longpoll: a request the pool holds open until it has a new block.
//!
//! One task per pool that advertises longpoll. Getwork pools name a
//! longpoll URL in `X-Long-Polling`; template pools return a `longpollid`
//! to pass back with `getblocktemplate`. Work from a longpoll marks a block
//! change, so it goes through block-change detection and then fans out into
//! rolled clones so every device has something from the new block at once.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{gbt, getwork, LONGPOLL_TIMEOUT};
use crate::block::BlockStatus;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::pool::{Pool, PoolState};
use crate::tracing::prelude::*;
use crate::work::{Work, WorkFlags, WorkMode};

/// A longpoll that fails sooner than this is treated as a hard failure and
/// retried only after the same interval.
pub const LONGPOLL_RETRY: Duration = Duration::from_secs(30);

/// Whether this pool's longpoll should be held open right now.
fn wanted(engine: &Engine, pool: &Pool) -> bool {
    engine.registry.strategy().is_shared() || engine.registry.is_current(pool)
}

async fn poll_once(engine: &Engine, pool: &Arc<Pool>) -> Result<Work> {
    if pool.has_gbt() {
        gbt::longpoll_template(engine, pool).await?;
        return gbt::build_work(engine, pool);
    }
    let url = pool
        .session
        .read()
        .lp_url
        .clone()
        .ok_or_else(|| Error::Pool(format!("pool {} has no longpoll URL", pool.pool_no())))?;
    let mut work = getwork::fetch_at(engine, pool, &url, LONGPOLL_TIMEOUT).await?;
    work.mode = WorkMode::Longpoll;
    Ok(work)
}

/// Run a fresh longpoll result through block-change detection and stage it.
pub fn handle_longpoll_work(engine: &Engine, pool: &Arc<Pool>, mut work: Work) {
    if pool.state() == PoolState::Rejecting {
        work.flags.insert(WorkFlags::MANDATORY);
    }
    work.flags.insert(WorkFlags::LONGPOLL);
    work.work_block = engine.blocks.work_block();

    let status = engine.test_work_current(&mut work);
    if status == BlockStatus::Stale {
        debug!(pool = %pool.url, work_id = work.id, "Discarding longpoll work for an old block");
        engine.discard_work(work);
        return;
    }
    if engine.config.fail_only && !wanted(engine, pool) {
        debug!(pool = %pool.url, "Discarding longpoll work from backup pool {}", pool.pool_no());
        engine.discard_work(work);
        return;
    }
    engine.clone_burst(work);
}

/// Longpoll loop for one pool.
pub async fn longpoll_task(engine: Arc<Engine>, pool: Arc<Pool>) {
    let mut switches = engine.registry.subscribe();
    info!(pool = %pool.url, "Long-polling activated for pool {}", pool.pool_no());

    loop {
        while !wanted(&engine, &pool) {
            tokio::select! {
                _ = engine.shutdown.cancelled() => return,
                changed = switches.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
        if pool.is_removed() {
            return;
        }

        let started = Instant::now();
        let result = tokio::select! {
            _ = engine.shutdown.cancelled() => return,
            result = poll_once(&engine, &pool) => result,
        };

        match result {
            Ok(work) => {
                trace!(pool = %pool.url, work_id = work.id, "Longpoll returned work");
                handle_longpoll_work(&engine, &pool, work);
            }
            Err(e) if started.elapsed() < LONGPOLL_RETRY => {
                warn!(
                    pool = %pool.url,
                    error = %e,
                    "Longpoll failed for pool {}, retrying in {}s",
                    pool.pool_no(),
                    LONGPOLL_RETRY.as_secs()
                );
                tokio::select! {
                    _ = engine.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(LONGPOLL_RETRY) => {}
                }
            }
            Err(e) => {
                debug!(pool = %pool.url, error = %e, "Longpoll timed out, retrying immediately");
            }
        }
    }
}
