//! Working out which protocol a pool speaks, and whether it is up.
//!
//! Stratum URLs need no probe; their liveness is the stratum session itself.
//! HTTP endpoints are asked for a block template first and fall back to
//! getwork. The first successful probe fixes the pool's capabilities.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;

use super::{gbt, getwork, solo};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::pool::{Capabilities, Pool};
use crate::tracing::prelude::*;
use crate::work::Work;

const STRATUM_SCHEMES: [&str; 2] = ["stratum+tcp://", "stratum://"];

/// Whether `url` names a stratum endpoint.
pub fn is_stratum_url(url: &str) -> bool {
    STRATUM_SCHEMES.iter().any(|scheme| url.starts_with(scheme))
}

/// What a successful probe found.
#[derive(Debug)]
pub struct Probe {
    pub capabilities: Capabilities,

    /// Work fetched while probing a getwork pool, worth staging.
    pub work: Option<Work>,
}

/// Classify a `getblocktemplate` result.
fn template_capabilities(pool: &Pool, result: &Value) -> Option<Capabilities> {
    let mut caps = if result.get("coinbasetxn").is_some() {
        Capabilities::GBT
    } else if pool.solo && result.get("coinbasevalue").is_some() {
        Capabilities::GBT_SOLO
    } else {
        return None;
    };
    if result.get("longpollid").is_some() {
        caps |= Capabilities::LONGPOLL;
    }
    Some(caps)
}

/// Find out what protocol an HTTP pool speaks.
pub async fn probe(engine: &Engine, pool: &Arc<Pool>) -> Result<Probe> {
    if is_stratum_url(&pool.url) {
        return Ok(Probe {
            capabilities: Capabilities::STRATUM,
            work: None,
        });
    }

    let started = Instant::now();
    match engine
        .rpc
        .call(pool, "getblocktemplate", gbt::request_params(None))
        .await
    {
        Ok(reply) => {
            if let Some(caps) = template_capabilities(pool, &reply.result) {
                pool.record_getwork_latency(started.elapsed().as_secs_f64());
                if caps.contains(Capabilities::GBT_SOLO) {
                    let address = engine.config.btc_address.as_deref().ok_or_else(|| {
                        Error::Config(format!("solo pool {} needs btc_address", pool.pool_no()))
                    })?;
                    solo::validate_address(engine, pool, address).await?;
                }
                let previous = pool.capabilities();
                pool.set_capabilities(caps);
                if let Err(e) = gbt::install_template(engine, pool, &reply.result) {
                    pool.set_capabilities(previous);
                    return Err(e);
                }
                return Ok(Probe {
                    capabilities: caps,
                    work: None,
                });
            }
            debug!(pool = %pool.url, "Template unusable, falling back to getwork");
        }
        Err(Error::Http(e)) => return Err(Error::Http(e)),
        Err(e) => debug!(pool = %pool.url, error = %e, "No getblocktemplate, trying getwork"),
    }

    let work = getwork::fetch(engine, pool).await?;
    Ok(Probe {
        capabilities: pool.capabilities() & Capabilities::LONGPOLL,
        work: Some(work),
    })
}

/// Probe a pool, install what was found, and report whether it is usable.
///
/// Stratum pools are alive exactly when their session has a job.
pub async fn pool_active(engine: &Engine, pool: &Arc<Pool>) -> bool {
    pool.health.lock().last_probe = Some(Instant::now());

    if pool.has_stratum() {
        return pool.stratum_ready();
    }

    match probe(engine, pool).await {
        Ok(found) => {
            if pool.capabilities() != found.capabilities {
                pool.set_capabilities(found.capabilities);
            }
            debug!(
                pool = %pool.url,
                caps = ?found.capabilities,
                "Pool {} probed",
                pool.pool_no()
            );
            if let Some(work) = found.work {
                engine.stage_work(work);
            }
            true
        }
        Err(e) => {
            debug!(pool = %pool.url, error = %e, "Pool {} probe failed", pool.pool_no());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use serde_json::json;
    use test_case::test_case;

    use crate::engine::test_util::config;
    use crate::rpc::test_server::{serve, Script};
    use crate::work::header;

    #[test_case("stratum+tcp://pool:3333", true)]
    #[test_case("stratum://pool:3333", true)]
    #[test_case("http://node:8332", false)]
    fn test_is_stratum_url(url: &str, expected: bool) {
        assert_eq!(is_stratum_url(url), expected);
    }

    async fn probed(script: Script, solo: bool, address: Option<&str>) -> (Arc<Engine>, bool) {
        let url = serve(Arc::new(Mutex::new(script))).await;
        let mut config = config(1);
        config.pools[0].url = url;
        config.pools[0].solo = solo;
        config.btc_address = address.map(str::to_string);
        let engine = Engine::new(config).unwrap();
        let pool = engine.registry.current();
        let active = pool_active(&engine, &pool).await;
        (engine, active)
    }

    fn template() -> Value {
        json!({
            "previousblockhash": "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054",
            "bits": "17034219",
            "version": 0x2000_0000u32,
            "curtime": 1_700_000_000u32,
            "height": 800_000,
            "coinbasevalue": 625_000_000u64,
            "longpollid": "lp",
            "transactions": [],
        })
    }

    #[tokio::test]
    async fn test_probe_solo_template() {
        let mut script = Script::default();
        script.results.insert("getblocktemplate".into(), template());
        script.results.insert(
            "validateaddress".into(),
            json!({"isvalid": true, "scriptPubKey": "51"}),
        );
        let (engine, active) = probed(script, true, Some("1BitcoinEaterAddressDontSendf59kuE")).await;
        let pool = engine.registry.current();
        assert!(active);
        assert!(pool.gbt_solo());
        assert!(pool.capabilities().contains(Capabilities::LONGPOLL));
        assert!(pool.session.read().template.is_some());
    }

    #[tokio::test]
    async fn test_probe_solo_without_address_fails() {
        let mut script = Script::default();
        script.results.insert("getblocktemplate".into(), template());
        let (_, active) = probed(script, true, None).await;
        assert!(!active);
    }

    #[tokio::test]
    async fn test_probe_falls_back_to_getwork() {
        let mut data = header::build_payload(&header::HeaderFields {
            version: 0x2000_0000,
            prev_hash: [0x11; 32],
            merkle_root: [0x22; 32],
            ntime: 1_700_000_000,
            nbits: 0x1d00ffff,
            nonce: 0,
        });
        header::swap_words(&mut data);
        let mut script = Script::default();
        script.results.insert(
            "getwork".into(),
            json!({
                "data": hex::encode(data),
                "target": "ff".repeat(32),
            }),
        );
        let (engine, active) = probed(script, false, None).await;
        let pool = engine.registry.current();
        assert!(active);
        assert!(!pool.localgen());
        assert_eq!(pool.stats.lock().getwork_requested, 1);
        assert_eq!(engine.staging.len(), 1);
    }

    #[tokio::test]
    async fn test_probe_dead_pool() {
        let (engine, active) = probed(Script::default(), false, None).await;
        assert!(!active);
        assert!(engine.registry.current().health.lock().last_probe.is_some());
    }
}
