//! Legacy `getwork`: the pool hands out a ready header and takes it back
//! with the nonce filled in.
//!
//! Getwork payloads are the 128-byte padded header with each 32-bit word
//! byte-swapped. We keep work in consensus order and swap at the edges.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

use super::{longpoll_url, str_field, RpcClient, CALL_TIMEOUT};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::pool::{Capabilities, Pool};
use crate::submit::{reject_reason, ShareOutcome};
use crate::tracing::prelude::*;
use crate::work::header::{self, swap_words, PAYLOAD_LEN};
use crate::work::{Work, WorkMode};

fn decode_hex<const N: usize>(value: &str, name: &str) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    hex::decode_to_slice(value, &mut out)
        .map_err(|e| Error::Protocol(format!("{name}: {e}")))?;
    Ok(out)
}

/// Fill `work` from a getwork result object.
pub fn decode(work: &mut Work, result: &Value) -> Result<()> {
    let mut data: [u8; PAYLOAD_LEN] = decode_hex(str_field(result, "data")?, "data")?;
    swap_words(&mut data);
    header::pad_payload(&mut data);

    let target = decode_hex::<32>(str_field(result, "target")?, "target")?;

    work.data = data;
    work.midstate = match result.get("midstate").and_then(Value::as_str) {
        Some(midstate) => decode_hex(midstate, "midstate")?,
        None => header::midstate(&work.data),
    };
    work.set_target(target);
    Ok(())
}

/// The `getwork` submission parameter for solved work.
pub fn submit_data(work: &Work) -> String {
    let mut data = work.data;
    swap_words(&mut data);
    hex::encode(data)
}

/// Fetch one item of work from a getwork pool.
///
/// Applies the pool's steering headers to its session: a longpoll path
/// enables the longpoll capability, `X-Roll-NTime` sets how long the work
/// may be rolled.
pub async fn fetch(engine: &Engine, pool: &Arc<Pool>) -> Result<Work> {
    fetch_at(engine, pool, &pool.url, CALL_TIMEOUT).await
}

/// Fetch getwork from an explicit endpoint, such as the pool's longpoll URL.
pub async fn fetch_at(
    engine: &Engine,
    pool: &Arc<Pool>,
    url: &str,
    timeout: Duration,
) -> Result<Work> {
    let mut work = engine.make_work(pool);
    let started = Instant::now();
    work.times.getwork = Some(started);

    let reply = engine
        .rpc
        .call_url(pool, url, "getwork", json!([]), timeout)
        .await?;
    let now = Instant::now();
    pool.record_getwork_latency(now.duration_since(started).as_secs_f64());
    work.times.getwork_reply = Some(now);

    decode(&mut work, &reply.result)?;
    work.mode = WorkMode::Getwork;
    let scan_time = u32::try_from(engine.config.scan_time).unwrap_or(u32::MAX);
    work.rolltime = reply.headers.rolltime(scan_time);

    {
        let mut session = pool.session.write();
        session.rolltime = work.rolltime;
        session.submit_old = reply
            .result
            .get("submitold")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if let Some(lp) = &reply.headers.long_polling {
            let url = longpoll_url(&pool.url, lp);
            if session.lp_url.as_deref() != Some(url.as_str()) {
                debug!(pool = %pool.url, lp_url = %url, "Pool {} advertised longpoll", pool.pool_no());
                session.lp_url = Some(url);
            }
        }
    }
    if reply.headers.long_polling.is_some() {
        let caps = pool.capabilities();
        if !caps.contains(Capabilities::LONGPOLL) {
            pool.set_capabilities(caps | Capabilities::LONGPOLL);
        }
    }

    pool.stats.lock().getwork_requested += 1;
    pool.health.lock().last_work = Some(now);
    trace!(pool = %pool.url, work_id = work.id, rolltime = work.rolltime, "Decoded getwork");
    Ok(work)
}

/// Send a solved header back with `getwork [data]`.
pub async fn submit(rpc: &RpcClient, work: &Work) -> Result<ShareOutcome> {
    let reply = rpc
        .call(&work.pool, "getwork", json!([submit_data(work)]))
        .await?;
    if reply.result.as_bool() == Some(true) {
        return Ok(ShareOutcome::Accepted);
    }
    let reason = reply
        .headers
        .reject_reason
        .clone()
        .or_else(|| reject_reason(&reply.result, &Value::Null));
    Ok(ShareOutcome::rejected(reason))
}
