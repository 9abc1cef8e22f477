//! `getblocktemplate`: assembling headers locally from a block template.
//!
//! The template is cached in the pool's session and refreshed at most once
//! a minute; every work item bumps the session's extranonce2 counter, writes
//! it into the coinbase and recomputes the merkle root. Pools supply a
//! coinbase (`coinbasetxn`) that we append to; solo nodes leave the coinbase
//! to us.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::consensus::encode::{serialize, VarInt};
use bitcoin::hashes::Hash;
use serde_json::{json, Value};
use tokio::time::Instant;

use super::solo::{self, CoinbaseParams};
use super::{str_field, u64_field, RpcClient, LONGPOLL_TIMEOUT};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::pool::{BlockTemplate, CoinbaseTemplate, Pool};
use crate::submit::{reject_reason, ShareOutcome};
use crate::tracing::prelude::*;
use crate::work::header::{
    hash_from_display_hex, merkle_branches, merkle_root, sha256d, HeaderFields, HEADER_LEN,
};
use crate::work::{GbtFields, Work, WorkFlags, WorkMode, DRIVER_ROLL_NTIME};

/// Capabilities we advertise in template requests.
pub const CAPABILITIES: [&str; 3] = ["coinbasetxn", "workid", "coinbase/append"];

/// Templates are reused for at most this long.
pub const TEMPLATE_TTL: Duration = Duration::from_secs(60);

/// Offset of the scriptSig length byte in a legacy-serialized coinbase:
/// version (4), input count (1), null prevout (36).
const SCRIPT_SIG_LEN_OFFSET: usize = 41;

/// Bytes of extranonce2 appended to a pool-provided coinbase scriptSig.
const NONCE2_LEN: usize = 8;

/// Parameters for a `getblocktemplate` request.
pub fn request_params(longpoll_id: Option<&str>) -> Value {
    let mut request = json!({
        "capabilities": CAPABILITIES,
        "rules": ["segwit"],
    });
    if let Some(id) = longpoll_id {
        request["longpollid"] = json!(id);
    }
    json!([request])
}

/// Make room for extranonce2 at the end of a pool coinbase's scriptSig.
///
/// Returns the extended transaction and the offset of the nonce2 bytes.
pub fn extend_coinbase(mut coinbase: Vec<u8>) -> Result<(Vec<u8>, usize)> {
    if coinbase.len() < SCRIPT_SIG_LEN_OFFSET + 1 {
        return Err(Error::Protocol("coinbasetxn too short".into()));
    }
    if coinbase[4] == 0x00 && coinbase[5] == 0x01 {
        return Err(Error::Protocol(
            "coinbasetxn uses witness serialization".into(),
        ));
    }
    let orig_len = usize::from(coinbase[SCRIPT_SIG_LEN_OFFSET]);
    // A varint length or a scriptSig with no room left cannot be extended.
    if orig_len >= 0xfd || orig_len + NONCE2_LEN > 100 {
        return Err(Error::Protocol(format!(
            "coinbasetxn scriptSig of {orig_len} bytes cannot take extranonce"
        )));
    }
    let offset = SCRIPT_SIG_LEN_OFFSET + 1 + orig_len;
    if offset > coinbase.len() {
        return Err(Error::Protocol("coinbasetxn scriptSig truncated".into()));
    }
    coinbase[SCRIPT_SIG_LEN_OFFSET] = (orig_len + NONCE2_LEN) as u8;
    coinbase.splice(offset..offset, [0u8; NONCE2_LEN]);
    Ok((coinbase, offset))
}

fn hex_u32(value: &Value, name: &str) -> Result<u32> {
    u32::from_str_radix(str_field(value, name)?, 16)
        .map_err(|e| Error::Protocol(format!("{name}: {e}")))
}

/// Decode a template. `payout_script` selects a solo coinbase.
pub fn decode_template(
    result: &Value,
    payout_script: Option<&[u8]>,
    signature: &[u8],
) -> Result<BlockTemplate> {
    let prev_hash = hash_from_display_hex(str_field(result, "previousblockhash")?)?;
    let nbits = hex_u32(result, "bits")?;
    let target = match result.get("target").and_then(Value::as_str) {
        Some(target) => hash_from_display_hex(target)?,
        None => bitcoin::Target::from_compact(bitcoin::CompactTarget::from_consensus(nbits))
            .to_le_bytes(),
    };
    let version = u32::try_from(u64_field(result, "version")?)
        .map_err(|_| Error::Protocol("version out of range".into()))?;
    let curtime = u32::try_from(u64_field(result, "curtime")?)
        .map_err(|_| Error::Protocol("curtime out of range".into()))?;
    let height = result
        .get("height")
        .and_then(Value::as_u64)
        .and_then(|h| u32::try_from(h).ok())
        .unwrap_or(0);

    let transactions = result
        .get("transactions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut txids = Vec::with_capacity(transactions.len());
    let mut txn_data = String::new();
    for tx in transactions {
        let data = str_field(tx, "data")?;
        let txid = match tx.get("txid").or_else(|| tx.get("hash")).and_then(Value::as_str) {
            Some(id) => hash_from_display_hex(id)?,
            None => sha256d(&hex::decode(data)?),
        };
        txids.push(txid);
        txn_data.push_str(data);
    }

    let coinbase = match payout_script {
        Some(script_pubkey) => {
            let flags = result
                .get("coinbaseaux")
                .and_then(|aux| aux.get("flags"))
                .and_then(Value::as_str)
                .map(hex::decode)
                .transpose()?
                .unwrap_or_default();
            let witness_commitment = result
                .get("default_witness_commitment")
                .and_then(Value::as_str)
                .map(hex::decode)
                .transpose()?;
            CoinbaseTemplate::Solo {
                height,
                value: u64_field(result, "coinbasevalue")?,
                flags,
                signature: signature.to_vec(),
                script_pubkey: script_pubkey.to_vec(),
                witness_commitment,
            }
        }
        None => {
            let data = result
                .get("coinbasetxn")
                .and_then(|cb| cb.get("data"))
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Protocol("template has no coinbasetxn".into()))?;
            let (bytes, nonce2_offset) = extend_coinbase(hex::decode(data)?)?;
            CoinbaseTemplate::Provided {
                bytes,
                nonce2_offset,
            }
        }
    };

    let submit_coinbase_only = result
        .get("mutable")
        .and_then(Value::as_array)
        .is_some_and(|m| m.iter().any(|v| v.as_str() == Some("submit/coinbase")));

    Ok(BlockTemplate {
        prev_hash,
        target,
        version,
        curtime,
        nbits,
        height,
        coinbase,
        merkle_branches: merkle_branches(&txids),
        txn_count: txids.len(),
        txn_data,
        submit_coinbase_only,
        workid: result.get("workid").and_then(Value::as_str).map(str::to_string),
        expires: result
            .get("expires")
            .and_then(Value::as_u64)
            .and_then(|e| u32::try_from(e).ok())
            .unwrap_or(0),
        fetched_at: Instant::now(),
    })
}

/// Decode `result` and install it as the pool's template.
pub fn install_template(engine: &Engine, pool: &Pool, result: &Value) -> Result<()> {
    let payout_script = pool.session.read().payout_script.clone();
    let solo = pool.gbt_solo();
    if solo && payout_script.is_none() {
        return Err(Error::Config(format!(
            "solo pool {} has no validated payout address",
            pool.pool_no()
        )));
    }
    let signature = solo::signature(engine);
    let template = decode_template(
        result,
        payout_script.as_deref().filter(|_| solo),
        &signature,
    )?;

    debug!(
        pool = %pool.url,
        height = template.height,
        txns = template.txn_count,
        "Installed block template"
    );
    let mut session = pool.session.write();
    session.height = template.height;
    session.longpoll_id = result
        .get("longpollid")
        .and_then(Value::as_str)
        .map(str::to_string);
    session.submit_old = result
        .get("submitold")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    session.template = Some(template);
    Ok(())
}

/// Fetch and install a fresh template.
pub async fn fetch_template(engine: &Engine, pool: &Arc<Pool>) -> Result<()> {
    let started = Instant::now();
    let reply = engine
        .rpc
        .call(pool, "getblocktemplate", request_params(None))
        .await?;
    pool.record_getwork_latency(started.elapsed().as_secs_f64());
    install_template(engine, pool, &reply.result)?;
    pool.stats.lock().getwork_requested += 1;
    Ok(())
}

/// Hold a template longpoll open until the node has a new one, then install
/// it.
pub async fn longpoll_template(engine: &Engine, pool: &Arc<Pool>) -> Result<()> {
    let longpoll_id = pool.session.read().longpoll_id.clone();
    let reply = engine
        .rpc
        .call_url(
            pool,
            &pool.url,
            "getblocktemplate",
            request_params(longpoll_id.as_deref()),
            LONGPOLL_TIMEOUT,
        )
        .await?;
    install_template(engine, pool, &reply.result)
}

fn template_fresh(template: &BlockTemplate) -> bool {
    let ttl = match template.expires {
        0 => TEMPLATE_TTL,
        expires => TEMPLATE_TTL.min(Duration::from_secs(u64::from(expires))),
    };
    template.fetched_at.elapsed() < ttl
}

/// Refresh the template if it is missing or too old.
pub async fn ensure_template(engine: &Engine, pool: &Arc<Pool>) -> Result<()> {
    let fresh = pool
        .session
        .read()
        .template
        .as_ref()
        .is_some_and(template_fresh);
    if fresh {
        return Ok(());
    }
    fetch_template(engine, pool).await
}

/// Generate work from the pool's template, refreshing it first if needed.
pub async fn gen_gbt_work(engine: &Engine, pool: &Arc<Pool>) -> Result<Work> {
    ensure_template(engine, pool).await?;
    build_work(engine, pool)
}

/// Generate work from the cached template.
pub fn build_work(engine: &Engine, pool: &Arc<Pool>) -> Result<Work> {
    let mut work = engine.make_work(pool);

    let (coinbase, txid, fields, target, gbt) = {
        let mut session = pool.session.write();
        session.nonce2 = session.nonce2.wrapping_add(1);
        let nonce2 = session.nonce2;
        let template = session
            .template
            .as_ref()
            .ok_or_else(|| Error::Pool(format!("pool {} has no template", pool.pool_no())))?;

        let (coinbase, txid) = match &template.coinbase {
            CoinbaseTemplate::Provided {
                bytes,
                nonce2_offset,
            } => {
                let mut coinbase = bytes.clone();
                coinbase[*nonce2_offset..*nonce2_offset + NONCE2_LEN]
                    .copy_from_slice(&nonce2.to_le_bytes());
                let txid = sha256d(&coinbase);
                (coinbase, txid)
            }
            CoinbaseTemplate::Solo {
                height,
                value,
                flags,
                signature,
                script_pubkey,
                witness_commitment,
            } => {
                let tx = solo::coinbase_tx(
                    &CoinbaseParams {
                        height: *height,
                        value: *value,
                        flags,
                        signature,
                        script_pubkey,
                        witness_commitment: witness_commitment.as_deref(),
                    },
                    nonce2,
                )?;
                (serialize(&tx), tx.compute_txid().to_byte_array())
            }
        };

        let elapsed = u32::try_from(template.fetched_at.elapsed().as_secs()).unwrap_or(0);
        let fields = HeaderFields {
            version: template.version,
            prev_hash: template.prev_hash,
            merkle_root: merkle_root(txid, &template.merkle_branches),
            ntime: template.curtime.wrapping_add(elapsed),
            nbits: template.nbits,
            nonce: 0,
        };
        let gbt = GbtFields {
            coinbase: hex::encode(&coinbase),
            txn_count: template.txn_count + 1,
            txn_data: (!template.submit_coinbase_only && !template.txn_data.is_empty())
                .then(|| template.txn_data.clone()),
            workid: template.workid.clone(),
        };
        (coinbase, txid, fields, template.target, gbt)
    };

    work.set_header(&fields);
    work.set_target(target);
    work.mode = if pool.gbt_solo() {
        WorkMode::GbtSolo
    } else {
        WorkMode::Gbt
    };
    work.flags.insert(WorkFlags::GBT);
    work.drv_rollntime = DRIVER_ROLL_NTIME;
    work.gbt = Some(gbt);
    pool.health.lock().last_work = Some(Instant::now());

    trace!(
        pool = %pool.url,
        work_id = work.id,
        coinbase_len = coinbase.len(),
        txid = %hex::encode(txid),
        "Generated GBT work"
    );
    Ok(work)
}

/// Serialized block for `submitblock`: header, transaction count, coinbase
/// and the remaining transactions unless the pool only wants the coinbase.
pub fn block_hex(work: &Work) -> Result<String> {
    let gbt = work
        .gbt
        .as_ref()
        .ok_or_else(|| Error::Protocol(format!("work {} has no template fields", work.id)))?;
    let mut block = hex::encode(&work.data[..HEADER_LEN]);
    block.push_str(&hex::encode(serialize(&VarInt(gbt.txn_count as u64))));
    block.push_str(&gbt.coinbase);
    if let Some(txns) = &gbt.txn_data {
        block.push_str(txns);
    }
    Ok(block)
}

/// Submit a solved block. A `null` result means the node took it.
pub async fn submit(rpc: &RpcClient, work: &Work) -> Result<ShareOutcome> {
    let mut params = vec![json!(block_hex(work)?)];
    if let Some(workid) = work.gbt.as_ref().and_then(|g| g.workid.as_deref()) {
        params.push(json!({ "workid": workid }));
    }
    let reply = rpc.call(&work.pool, "submitblock", Value::Array(params)).await?;
    Ok(match &reply.result {
        Value::Null => ShareOutcome::Accepted,
        Value::Bool(true) => ShareOutcome::Accepted,
        Value::String(reason) => ShareOutcome::rejected(Some(reason.clone())),
        other => ShareOutcome::rejected(
            reply
                .headers
                .reject_reason
                .clone()
                .or_else(|| reject_reason(other, &Value::Null)),
        ),
    })
}
