//! Benchmark mode: a synthetic pool that generates work locally.
//!
//! Useful for exercising devices and the dispatch path without any pool
//! connectivity. Every header carries a recognizable previous-block hash and
//! a merkle root derived from a counter, so each item is unique. Solutions
//! are accounted as accepted without network I/O.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::block::{Header as BlockHeader, Version};
use bitcoin::consensus::serialize;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::pow::CompactTarget;
use bitcoin::{BlockHash, TxMerkleNode};

use crate::config::PoolConfig;
use crate::engine::Engine;
use crate::pool::{Capabilities, Pool, Registry};
use crate::tracing::prelude::*;
use crate::types::difficulty_to_target;
use crate::work::header::{self, HEADER_LEN, PAYLOAD_LEN};
use crate::work::{Work, WorkMode};

pub const BENCHMARK_URL: &str = "benchmark";

/// Difficulty-1 bits; benchmark work is never meant to find blocks.
const BENCHMARK_BITS: u32 = 0x1d00ffff;

/// Register the benchmark pool.
pub fn add_pool(registry: &Registry) -> Arc<Pool> {
    let pool = registry.add_pool(&PoolConfig {
        url: BENCHMARK_URL.to_string(),
        user: "benchmark".to_string(),
        pass: String::new(),
        ..Default::default()
    });
    pool.set_capabilities(Capabilities::BENCHMARK);
    info!("Benchmark mode: generating work locally");
    pool
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Create a header with a recognizable pattern so benchmark work is never
/// mistaken for pool work.
fn benchmark_header(counter: u64) -> BlockHeader {
    let mut prev_hash = [0u8; 32];
    prev_hash[0..9].copy_from_slice(b"BENCHMARK");

    let mut seed = [0u8; 16];
    seed[0..6].copy_from_slice(b"MUJINA");
    seed[8..].copy_from_slice(&counter.to_le_bytes());

    BlockHeader {
        version: Version::TWO,
        prev_blockhash: BlockHash::from_byte_array(prev_hash),
        merkle_root: TxMerkleNode::from_byte_array(sha256d::Hash::hash(&seed).to_byte_array()),
        time: unix_time(),
        bits: CompactTarget::from_consensus(BENCHMARK_BITS),
        nonce: 0,
    }
}

/// Next item of benchmark work.
pub fn gen_benchmark_work(engine: &Engine, pool: &Arc<Pool>) -> Work {
    let counter = {
        let mut session = pool.session.write();
        session.nonce2 = session.nonce2.wrapping_add(1);
        session.nonce2
    };

    let mut work = engine.make_work(pool);
    let bytes = serialize(&benchmark_header(counter));
    let mut data = [0u8; PAYLOAD_LEN];
    data[..HEADER_LEN].copy_from_slice(&bytes);
    header::pad_payload(&mut data);
    work.data = data;
    work.midstate = header::midstate(&work.data);
    work.set_target(difficulty_to_target(1.0));
    work.mode = WorkMode::Benchmark;

    trace!(work_id = work.id, counter, "Generated benchmark work");
    work
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::test_util::config;

    fn benchmark_engine() -> Arc<Engine> {
        let mut config = config(0);
        config.benchmark = true;
        Engine::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_benchmark_pool_is_localgen() {
        let engine = benchmark_engine();
        let pool = engine.registry.current();
        assert_eq!(engine.registry.len(), 1);
        assert!(pool.is_benchmark());
        assert!(pool.localgen());
        assert_eq!(pool.url, BENCHMARK_URL);
    }

    #[tokio::test]
    async fn test_benchmark_work_is_unique_and_stages() {
        let engine = benchmark_engine();
        let pool = engine.registry.current();

        let a = gen_benchmark_work(&engine, &pool);
        let b = gen_benchmark_work(&engine, &pool);
        assert_ne!(a.id, b.id);
        assert_ne!(a.data[36..68], b.data[36..68]);
        assert_eq!(a.prev_hash(), b.prev_hash());
        assert_eq!(&a.prev_hash()[..9], b"BENCHMARK");
        assert_eq!(a.nbits(), BENCHMARK_BITS);
        assert!((a.difficulty - 1.0).abs() < 1e-9);
        assert_eq!(a.mode, WorkMode::Benchmark);

        assert!(engine.stage_work(a));
        assert!(engine.stage_work(b));
        assert_eq!(engine.staging.len(), 2);
    }

    #[tokio::test]
    async fn test_benchmark_solution_accepted_locally() {
        let engine = benchmark_engine();
        let pool = engine.registry.current();
        let work = gen_benchmark_work(&engine, &pool);
        crate::submit::submit_solution(&engine, work);
        assert_eq!(pool.stats.lock().accepted, 1);
    }
}
