//! Solo mining against a node: payout validation, our own coinbase, and
//! block-change polling.
//!
//! A solo template carries no coinbase, so we build one paying the
//! configured address. The node has no longpoll we rely on; instead the tip
//! is polled with `getblockcount`/`getblockhash`.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::address::NetworkUnchecked;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::transaction::{OutPoint, Sequence, Transaction, TxIn, TxOut, Version};
use bitcoin::{Address, Amount, ScriptBuf, Witness};
use serde_json::{json, Value};

use super::gbt;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::tracing::prelude::*;
use crate::work::header::hash_from_display_hex;
use crate::work::WorkFlags;

/// Interval between tip checks.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Consensus limit on a coinbase scriptSig.
const MAX_SCRIPT_SIG: usize = 100;

const MAX_DIRECT_PUSH: usize = 75;

/// Default coinbase signature when none is configured.
const DEFAULT_SIG: &str = "mujina";

/// Everything the coinbase needs besides the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseParams<'a> {
    pub height: u32,
    pub value: u64,
    pub flags: &'a [u8],
    pub signature: &'a [u8],
    pub script_pubkey: &'a [u8],
    pub witness_commitment: Option<&'a [u8]>,
}

fn push_bytes(bytes: &[u8]) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(bytes.to_vec())
        .map_err(|e| Error::Protocol(format!("coinbase push: {e}")))
}

/// Build the reward transaction with `nonce2` in its scriptSig.
///
/// The scriptSig is `height flags nonce2 signature`, with the signature cut
/// to keep it within consensus limits. Segwit templates get the witness
/// commitment output and the reserved-value witness.
pub fn coinbase_tx(params: &CoinbaseParams<'_>, nonce2: u64) -> Result<Transaction> {
    let prefix = Builder::new()
        .push_int(i64::from(params.height))
        .push_slice(push_bytes(params.flags)?)
        .push_slice(push_bytes(&nonce2.to_le_bytes())?)
        .into_script();

    // Single-byte pushes only, so one length byte for the signature.
    let room = MAX_SCRIPT_SIG
        .saturating_sub(prefix.len() + 1)
        .min(MAX_DIRECT_PUSH);
    let signature = &params.signature[..params.signature.len().min(room)];
    let mut script_sig = prefix.into_bytes();
    if !signature.is_empty() {
        let push = Builder::new().push_slice(push_bytes(signature)?).into_script();
        script_sig.extend_from_slice(push.as_bytes());
    }

    let mut output = vec![TxOut {
        value: Amount::from_sat(params.value),
        script_pubkey: ScriptBuf::from_bytes(params.script_pubkey.to_vec()),
    }];
    let witness = match params.witness_commitment {
        Some(commitment) => {
            output.push(TxOut {
                value: Amount::ZERO,
                script_pubkey: ScriptBuf::from_bytes(commitment.to_vec()),
            });
            Witness::from(vec![vec![0u8; 32]])
        }
        None => Witness::new(),
    };

    Ok(Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(script_sig),
            sequence: Sequence::MAX,
            witness,
        }],
        output,
    })
}

/// Signature placed in solo coinbases.
pub fn signature(engine: &Engine) -> Vec<u8> {
    engine
        .config
        .btc_sig
        .as_deref()
        .unwrap_or(DEFAULT_SIG)
        .as_bytes()
        .to_vec()
}

/// Ask the node to validate `address` and remember its payout script.
pub async fn validate_address(engine: &Engine, pool: &Arc<Pool>, address: &str) -> Result<Vec<u8>> {
    let reply = engine
        .rpc
        .call(pool, "validateaddress", json!([address]))
        .await?;
    if reply.result.get("isvalid").and_then(Value::as_bool) != Some(true) {
        return Err(Error::Config(format!("invalid payout address {address}")));
    }

    let script = match reply.result.get("scriptPubKey").and_then(Value::as_str) {
        Some(script) => hex::decode(script)?,
        None => address
            .parse::<Address<NetworkUnchecked>>()
            .map_err(|e| Error::Config(format!("payout address {address}: {e}")))?
            .assume_checked()
            .script_pubkey()
            .into_bytes(),
    };

    info!(pool = %pool.url, address, "Solo mining to validated address");
    pool.session.write().payout_script = Some(script.clone());
    Ok(script)
}

/// Whether the node's tip has moved past our template.
async fn tip_changed(engine: &Engine, pool: &Arc<Pool>) -> Result<bool> {
    let count = engine
        .rpc
        .call(pool, "getblockcount", json!([]))
        .await?
        .result
        .as_u64()
        .ok_or_else(|| Error::Protocol("getblockcount result not a number".into()))?;

    let (height, prev_hash) = {
        let session = pool.session.read();
        match &session.template {
            Some(template) => (template.height, template.prev_hash),
            None => return Ok(true),
        }
    };
    if count + 1 == u64::from(height) {
        return Ok(false);
    }

    let hash = engine
        .rpc
        .call(pool, "getblockhash", json!([count]))
        .await?
        .result;
    let hash = hash
        .as_str()
        .ok_or_else(|| Error::Protocol("getblockhash result not a string".into()))?;
    Ok(hash_from_display_hex(hash)? != prev_hash)
}

/// Poll the node for a new tip, refreshing the template and pushing work
/// from the new block through block-change detection when it moves.
pub async fn block_watcher(engine: Arc<Engine>, pool: Arc<Pool>) {
    debug!(pool = %pool.url, "Solo block watcher started for pool {}", pool.pool_no());
    loop {
        tokio::select! {
            _ = engine.shutdown.cancelled() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        if pool.is_removed() {
            return;
        }

        match tip_changed(&engine, &pool).await {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                debug!(pool = %pool.url, error = %e, "Solo tip poll failed");
                continue;
            }
        }

        if let Err(e) = gbt::fetch_template(&engine, &pool).await {
            warn!(pool = %pool.url, error = %e, "Failed to refresh solo template");
            continue;
        }
        if engine.config.fail_only
            && !engine.registry.strategy().is_shared()
            && !engine.registry.is_current(&pool)
        {
            continue;
        }
        match gbt::build_work(&engine, &pool) {
            Ok(mut work) => {
                work.flags.insert(WorkFlags::LONGPOLL);
                engine.stage_work(work);
            }
            Err(e) => warn!(pool = %pool.url, error = %e, "Failed to generate solo work"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bitcoin::consensus::serialize;
    use bitcoin::hashes::Hash;
    use parking_lot::Mutex;

    use crate::engine::test_util::config;
    use crate::rpc::test_server::{serve, Script};
    use crate::work::header::sha256d;

    const P2WPKH: &str = "0014751e76e8199196d454941c45d1b3a323f1433bd6";

    fn params<'a>(script: &'a [u8], commitment: Option<&'a [u8]>, sig: &'a [u8]) -> CoinbaseParams<'a> {
        CoinbaseParams {
            height: 800_000,
            value: 625_000_000,
            flags: &[],
            signature: sig,
            script_pubkey: script,
            witness_commitment: commitment,
        }
    }

    #[test]
    fn test_coinbase_script_sig_layout() {
        let script = hex::decode(P2WPKH).unwrap();
        let tx = coinbase_tx(&params(&script, None, b"mujina"), 0x0102).unwrap();

        let sig = tx.input[0].script_sig.as_bytes();
        // BIP34 height push: 800000 = 0x0c3500
        assert_eq!(&sig[..4], &[0x03, 0x00, 0x35, 0x0c]);
        // Empty flags push, then the 8-byte nonce2.
        assert_eq!(sig[4], 0x00);
        assert_eq!(sig[5], 0x08);
        assert_eq!(&sig[6..14], &0x0102u64.to_le_bytes());
        assert_eq!(&sig[15..], b"mujina");
        assert_eq!(tx.output[0].value, Amount::from_sat(625_000_000));
        assert!(tx.input[0].witness.is_empty());
    }

    #[test]
    fn test_segwit_coinbase_txid_excludes_witness() {
        let script = hex::decode(P2WPKH).unwrap();
        let commitment = hex::decode(
            "6a24aa21a9ede2f61c3f71d1defd3fa999dfa36953755c690689799962b48bebd836974e8cf9",
        )
        .unwrap();
        let tx = coinbase_tx(&params(&script, Some(&commitment), b"mujina"), 7).unwrap();
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.input[0].witness.len(), 1);

        let mut legacy = tx.clone();
        legacy.input[0].witness = Witness::new();
        assert_eq!(tx.compute_txid().to_byte_array(), sha256d(&serialize(&legacy)));
        assert!(serialize(&tx).len() > serialize(&legacy).len());
    }

    #[test]
    fn test_long_signature_is_truncated() {
        let script = hex::decode(P2WPKH).unwrap();
        let sig = vec![b'x'; 200];
        let tx = coinbase_tx(&params(&script, None, &sig), 0).unwrap();
        assert!(tx.input[0].script_sig.len() <= MAX_SCRIPT_SIG);
    }

    #[tokio::test]
    async fn test_validate_address_uses_node_script() {
        let script = Arc::new(Mutex::new(Script::default()));
        script.lock().results.insert(
            "validateaddress".into(),
            json!({"isvalid": true, "scriptPubKey": P2WPKH}),
        );
        let url = serve(script).await;
        let mut config = config(1);
        config.pools[0].url = url;
        let engine = Engine::new(config).unwrap();
        let pool = engine.registry.current();

        let spk = validate_address(&engine, &pool, "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
            .await
            .unwrap();
        assert_eq!(hex::encode(&spk), P2WPKH);
        assert_eq!(pool.session.read().payout_script, Some(spk));
    }

    #[tokio::test]
    async fn test_validate_address_rejects_invalid() {
        let script = Arc::new(Mutex::new(Script::default()));
        script
            .lock()
            .results
            .insert("validateaddress".into(), json!({"isvalid": false}));
        let url = serve(script).await;
        let mut config = config(1);
        config.pools[0].url = url;
        let engine = Engine::new(config).unwrap();
        let pool = engine.registry.current();
        let err = validate_address(&engine, &pool, "nope").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
