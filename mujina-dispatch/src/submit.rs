//! Getting solutions back to their pools and accounting for the answers.
//!
//! [`submit_solution`] is the single entry point once a device has found a
//! share. Stratum shares go to the pool's send loop; RPC pools get a
//! short-lived task that retries until the share is sent, goes stale, or
//! low-memory mode says to give up. Every answer, whatever the protocol,
//! ends up in [`share_result`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::engine::{Engine, StaleCheck};
use crate::error::Result;
use crate::pool::strategy::should_reject;
use crate::pool::{Pool, PoolState};
use crate::rpc;
use crate::tracing::prelude::*;
use crate::work::{Work, WorkFlags};

/// Pause between RPC submission attempts.
const SUBMIT_RETRY: Duration = Duration::from_secs(5);

/// Reject reasons are cut to this many characters.
const REASON_LEN: usize = 28;

/// What a pool said about a share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    Accepted,
    Rejected { reason: Option<String> },
}

impl ShareOutcome {
    pub fn rejected(reason: Option<String>) -> Self {
        ShareOutcome::Rejected {
            reason: reason.map(|r| truncate_reason(&r)),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, ShareOutcome::Accepted)
    }

    /// Share log disposition.
    pub fn disposition(&self) -> String {
        match self {
            ShareOutcome::Accepted => "accept".to_string(),
            ShareOutcome::Rejected { reason: Some(r) } => format!("reject:{r}"),
            ShareOutcome::Rejected { reason: None } => "reject".to_string(),
        }
    }
}

fn truncate_reason(reason: &str) -> String {
    reason.chars().take(REASON_LEN).collect()
}

/// Pull a human readable reason out of a reply.
///
/// Looks at a `reject-reason` member of the result, then a stratum style
/// `[code, "message", data]` error, then a plain string error.
pub fn reject_reason(result: &Value, error: &Value) -> Option<String> {
    if let Some(reason) = result.get("reject-reason").and_then(Value::as_str) {
        return Some(truncate_reason(reason));
    }
    match error {
        Value::Array(parts) => parts.get(1).and_then(Value::as_str).map(truncate_reason),
        Value::String(s) => Some(truncate_reason(s)),
        Value::Object(obj) => obj.get("message").and_then(Value::as_str).map(truncate_reason),
        _ => None,
    }
}

fn sharelog(engine: &Engine, disposition: &str, work: &Work) {
    if let Some(log) = &engine.sharelog {
        let (device, device_id) = engine.stats.device_label(work.thr_id);
        log.log(disposition, work, &device, device_id);
    }
}

/// Count a share that will never be sent.
pub(crate) fn count_stale(engine: &Engine, work: &Work) {
    engine.stats.record_stale(&work.pool, work.difficulty);
}

/// Hand a verified share to its pool.
pub fn submit_solution(engine: &Arc<Engine>, mut work: Work) {
    work.times.found = Some(Instant::now());
    let pool = work.pool.clone();

    if pool.is_benchmark() {
        share_result(engine, &work, &ShareOutcome::Accepted);
        return;
    }

    if engine.is_stale(&work, StaleCheck::Submit) {
        let submit_old = pool.session.read().submit_old;
        if engine.config.submit_stale || submit_old {
            if submit_old {
                info!(pool = %pool.url, "Pool {} asked for stale shares, submitting", pool.pool_no());
            } else {
                info!(pool = %pool.url, "Submitting stale share to pool {}", pool.pool_no());
            }
            work.flags.insert(WorkFlags::STALE);
        } else {
            info!(pool = %pool.url, work_id = work.id, "Stale share detected, discarding");
            sharelog(engine, "discard", &work);
            count_stale(engine, &work);
            return;
        }
    }

    if work.is_stratum() {
        if let Err(work) = pool.queue_share(work) {
            info!(pool = %pool.url, "No stratum connection to pool {}, discarding share", pool.pool_no());
            count_stale(engine, &work);
        }
        return;
    }

    let engine2 = engine.clone();
    engine.tasks.spawn(async move {
        submit_work_task(engine2, work).await;
    });
}

/// Send one share over RPC, retrying until it lands or is no longer worth
/// sending.
async fn submit_work_task(engine: Arc<Engine>, work: Work) {
    let pool = work.pool.clone();
    loop {
        match submit_upstream(&engine, &work).await {
            Ok(outcome) => {
                if pool.tclear_submit_fail() {
                    warn!(pool = %pool.url, "Pool {} communication resumed, submitting work", pool.pool_no());
                }
                share_result(&engine, &work, &outcome);
                return;
            }
            Err(e) => {
                if !pool.tset_submit_fail() {
                    engine.stats.record_remotefail(&pool);
                    warn!(pool = %pool.url, error = %e, "Pool {} communication failure, caching submissions", pool.pool_no());
                } else {
                    debug!(pool = %pool.url, error = %e, "Share submission failed, retrying");
                }
            }
        }

        if engine.config.lowmem {
            info!(pool = %pool.url, "Pool {} share being discarded to minimise memory cache", pool.pool_no());
            return;
        }
        if engine.is_stale(&work, StaleCheck::Submit) {
            info!(pool = %pool.url, "Pool {} share became stale while retrying submit, discarding", pool.pool_no());
            count_stale(&engine, &work);
            return;
        }

        tokio::select! {
            _ = engine.shutdown.cancelled() => return,
            _ = tokio::time::sleep(SUBMIT_RETRY) => {}
        }
    }
}

async fn submit_upstream(engine: &Engine, work: &Work) -> Result<ShareOutcome> {
    if work.is_gbt() {
        rpc::gbt::submit(&engine.rpc, work).await
    } else {
        rpc::getwork::submit(&engine.rpc, work).await
    }
}

/// Account for a pool's answer to one of our shares.
pub fn share_result(engine: &Engine, work: &Work, outcome: &ShareOutcome) {
    let pool = &work.pool;
    let stale = work.flags.contains(WorkFlags::STALE);
    let block = work.flags.contains(WorkFlags::BLOCK_FOUND);

    match outcome {
        ShareOutcome::Accepted => {
            engine.stats.record_accept(pool, work.thr_id, work.difficulty);
            info!(
                pool = %pool.url,
                work_id = work.id,
                diff = work.difficulty,
                share_diff = work.share_diff,
                stale,
                "Accepted share from pool {}{}",
                pool.pool_no(),
                if block { " BLOCK!" } else { "" }
            );
            sharelog(engine, &outcome.disposition(), work);

            if pool.state() == PoolState::Rejecting {
                warn!(pool = %pool.url, "Rejecting pool {} now accepting shares, re-enabling!", pool.pool_no());
                engine.registry.enable_pool(pool);
                engine.switch_pools(None);
            }
            if block {
                engine.restart_threads();
            }
        }
        ShareOutcome::Rejected { reason } => {
            let seq_rejects = engine.stats.record_reject(pool, work.thr_id, work.difficulty);
            info!(
                pool = %pool.url,
                work_id = work.id,
                diff = work.difficulty,
                stale,
                reason = reason.as_deref().unwrap_or(""),
                "Rejected share from pool {}",
                pool.pool_no()
            );
            sharelog(engine, &outcome.disposition(), work);
            maybe_reject_pool(engine, pool, seq_rejects, stale);
        }
    }
}

/// Account for a stratum answer we no longer have the share for.
///
/// The pool's current difficulty stands in for the share's.
pub fn untracked_result(engine: &Engine, pool: &Arc<Pool>, outcome: &ShareOutcome) {
    let diff = pool.stratum_diff();
    match outcome {
        ShareOutcome::Accepted => {
            engine.stats.record_accept(pool, None, diff);
            info!(pool = %pool.url, diff, "Accepted untracked stratum share from pool {}", pool.pool_no());
        }
        ShareOutcome::Rejected { reason } => {
            let seq_rejects = engine.stats.record_reject(pool, None, diff);
            info!(
                pool = %pool.url,
                diff,
                reason = reason.as_deref().unwrap_or(""),
                "Rejected untracked stratum share from pool {}",
                pool.pool_no()
            );
            maybe_reject_pool(engine, pool, seq_rejects, false);
        }
    }
}

fn maybe_reject_pool(engine: &Engine, pool: &Arc<Pool>, seq_rejects: u32, stale: bool) {
    if !engine.config.disable_rejecting {
        return;
    }
    let utility = engine.stats.utility();
    if !should_reject(seq_rejects, utility, engine.registry.enabled_count(), stale) {
        return;
    }
    warn!(
        pool = %pool.url,
        seq_rejects,
        utility,
        "Pool {} rejected {} sequential shares, disabling!",
        pool.pool_no(),
        seq_rejects
    );
    engine.registry.reject_pool(pool);
    if engine.registry.is_current(pool) {
        engine.switch_pools(None);
    }
    pool.stats.lock().seq_rejects = 0;
}
