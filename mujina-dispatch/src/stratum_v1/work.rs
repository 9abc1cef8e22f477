//! Building work from the live stratum job.

use std::sync::Arc;

use tokio::time::Instant;

use super::messages::JobNotification;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::pool::{Pool, StratumJob};
use crate::tracing::prelude::*;
use crate::types::difficulty_to_target;
use crate::work::header::{merkle_root, sha256d, HeaderFields};
use crate::work::{StratumFields, Work, WorkFlags, WorkMode};

/// Assemble a job's coinbase with a zeroed extranonce2 slot.
pub fn build_job(notify: JobNotification, nonce1: &str, n2size: usize) -> Result<StratumJob> {
    let nonce1 = hex::decode(nonce1)?;
    let nonce2_offset = notify.coinbase1.len() + nonce1.len();

    let mut coinbase = notify.coinbase1;
    coinbase.extend_from_slice(&nonce1);
    coinbase.resize(nonce2_offset + n2size, 0);
    coinbase.extend_from_slice(&notify.coinbase2);

    Ok(StratumJob {
        job_id: notify.job_id,
        prev_hash: notify.prev_hash,
        coinbase,
        nonce2_offset,
        merkle_branches: notify.merkle_branches,
        version: notify.version,
        nbits: notify.nbits,
        ntime: notify.ntime,
        clean: notify.clean_jobs,
    })
}

/// Generate one work item from the pool's current job with the next
/// extranonce2.
pub fn gen_stratum_work(engine: &Engine, pool: &Arc<Pool>) -> Result<Work> {
    let mut work = engine.make_work(pool);

    let (fields, sdiff, stratum) = {
        let mut session = pool.session.write();
        let nonce2 = session.nonce2;
        session.nonce2 = session.nonce2.wrapping_add(1);

        let no_job = || Error::Pool(format!("pool {} has no stratum job", pool.pool_no()));
        let live = session.stratum.as_ref().ok_or_else(no_job)?;
        let job = live.job.as_ref().ok_or_else(no_job)?;

        let n2size = live.n2size;
        let nonce2 = if n2size < 8 {
            nonce2 & ((1u64 << (n2size * 8)) - 1)
        } else {
            nonce2
        };
        let mut coinbase = job.coinbase.clone();
        coinbase[job.nonce2_offset..job.nonce2_offset + n2size]
            .copy_from_slice(&nonce2.to_le_bytes()[..n2size]);

        let fields = HeaderFields {
            version: job.version,
            prev_hash: job.prev_hash,
            merkle_root: merkle_root(sha256d(&coinbase), &job.merkle_branches),
            ntime: job.ntime,
            nbits: job.nbits,
            nonce: 0,
        };
        let stratum = StratumFields {
            job_id: job.job_id.clone(),
            nonce1: live.nonce1.clone(),
            nonce2,
            nonce2_len: n2size,
            ntime: format!("{:08x}", job.ntime),
        };
        (fields, live.sdiff, stratum)
    };

    work.set_header(&fields);
    work.set_target(difficulty_to_target(sdiff));
    work.mode = WorkMode::Stratum;
    work.flags.insert(WorkFlags::STRATUM);
    pool.health.lock().last_work = Some(Instant::now());

    trace!(
        pool = %pool.url,
        work_id = work.id,
        job_id = %stratum.job_id,
        nonce2 = stratum.nonce2,
        sdiff,
        "Generated stratum work"
    );
    work.stratum = Some(stratum);
    Ok(work)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::test_util::engine;
    use crate::pool::{Capabilities, StratumSession};

    fn notify() -> JobNotification {
        JobNotification {
            job_id: "7".into(),
            prev_hash: [0x44; 32],
            coinbase1: vec![0xaa; 3],
            coinbase2: vec![0xbb; 2],
            merkle_branches: vec![[0x55; 32]],
            version: 0x2000_0000,
            nbits: 0x1703_4219,
            ntime: 0x6500_0000,
            clean_jobs: true,
        }
    }

    #[test]
    fn test_build_job_layout() {
        let job = build_job(notify(), "0102", 4).unwrap();
        assert_eq!(job.nonce2_offset, 5);
        assert_eq!(
            job.coinbase,
            vec![0xaa, 0xaa, 0xaa, 0x01, 0x02, 0, 0, 0, 0, 0xbb, 0xbb]
        );
    }

    #[tokio::test]
    async fn test_gen_work_fills_nonce2_and_target() {
        let engine = engine(1);
        let pool = engine.registry.current();
        pool.set_capabilities(Capabilities::STRATUM);
        pool.session.write().stratum = Some(StratumSession {
            nonce1: "0102".into(),
            n2size: 4,
            sdiff: 8.0,
            job: Some(build_job(notify(), "0102", 4).unwrap()),
            ..Default::default()
        });

        let first = gen_stratum_work(&engine, &pool).unwrap();
        let second = gen_stratum_work(&engine, &pool).unwrap();

        let a = first.stratum.as_ref().unwrap();
        let b = second.stratum.as_ref().unwrap();
        assert_eq!(b.nonce2, a.nonce2 + 1);
        assert_eq!(a.ntime, "65000000");
        assert_eq!(a.nonce1, "0102");
        assert_ne!(first.data, second.data);
        assert!((first.difficulty - 8.0).abs() < 1e-6);
        assert_eq!(first.prev_hash(), [0x44; 32]);
        assert!(first.is_stratum());

        let mut coinbase = vec![0xaa, 0xaa, 0xaa, 0x01, 0x02];
        coinbase.extend_from_slice(&(a.nonce2 as u32).to_le_bytes());
        coinbase.extend_from_slice(&[0xbb, 0xbb]);
        let root = merkle_root(sha256d(&coinbase), &[[0x55; 32]]);
        assert_eq!(&first.data[36..68], &root);
    }

    #[tokio::test]
    async fn test_gen_work_without_job_fails() {
        let engine = engine(1);
        let pool = engine.registry.current();
        assert!(gen_stratum_work(&engine, &pool).is_err());
    }
}
