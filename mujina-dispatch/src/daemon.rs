//! Daemon wiring: builds the engine and spawns every long-running task.
//!
//! One stratum task per stratum pool, one longpoll task per pool that
//! advertises longpoll, one block watcher per solo pool, the scheduler, the
//! pool watcher, the watchdog, and one mining thread per CPU device. All of
//! them run on the engine's task tracker and stop on its cancellation token.

use std::sync::Arc;

use futures::future::join_all;
use tokio::signal::unix::{self, SignalKind};

use crate::config::Config;
use crate::device::{mining_thread, CpuDevice, HashDevice, ThreadContext};
use crate::engine::Engine;
use crate::error::Result;
use crate::pool::{Capabilities, Pool};
use crate::rpc::{longpoll, probe, solo};
use crate::scheduler;
use crate::stratum_v1;
use crate::tracing::prelude::*;
use crate::watchdog;

/// A running dispatcher.
#[derive(Debug)]
pub struct Daemon {
    engine: Arc<Engine>,
}

/// Probe HTTP pools and start their protocol tasks.
async fn start_pools(engine: &Arc<Engine>) {
    let pools = engine.registry.pools();

    for pool in pools.iter().filter(|p| probe::is_stratum_url(&p.url)) {
        engine
            .tasks
            .spawn(stratum_v1::stratum_task(engine.clone(), pool.clone()));
    }

    let http: Vec<Arc<Pool>> = pools
        .into_iter()
        .filter(|p| !probe::is_stratum_url(&p.url) && !p.is_benchmark())
        .collect();
    let alive = join_all(http.iter().map(|pool| probe::pool_active(engine, pool))).await;

    for (pool, alive) in http.iter().zip(alive) {
        if !alive {
            warn!(pool = %pool.url, "Pool {} {} not responding at startup", pool.pool_no(), pool.url);
            engine.pool_died(pool);
            continue;
        }
        let caps = pool.capabilities();
        info!(pool = %pool.url, caps = ?caps, "Pool {} ready", pool.pool_no());
        if caps.contains(Capabilities::GBT_SOLO) {
            engine
                .tasks
                .spawn(solo::block_watcher(engine.clone(), pool.clone()));
        } else if caps.contains(Capabilities::LONGPOLL) {
            engine
                .tasks
                .spawn(longpoll::longpoll_task(engine.clone(), pool.clone()));
        }
    }

    if http.len() == engine.registry.len() && http.iter().all(|p| p.is_idle()) {
        warn!("No servers could be used to get work from, waiting for them to return");
    }
    engine.switch_pools(None);
}

fn start_devices(engine: &Arc<Engine>) {
    for device_id in 0..engine.config.mining_threads() {
        let device: Arc<dyn HashDevice> = Arc::new(CpuDevice::new(device_id as u32));
        let thr_id = engine.register_device(device.clone());
        let ctx = ThreadContext::new(engine.clone(), thr_id);
        engine
            .tasks
            .spawn(mining_thread(ctx, device, engine.shutdown.clone()));
    }
}

impl Daemon {
    /// Build the engine and start every task.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;
        let engine = Engine::new(config)?;
        info!(
            pools = engine.registry.len(),
            strategy = %engine.registry.strategy(),
            queue = engine.config.queue,
            "Starting dispatcher"
        );

        if !engine.config.benchmark {
            start_pools(&engine).await;
        }
        start_devices(&engine);

        engine.tasks.spawn(scheduler::scheduler_task(engine.clone()));
        engine.tasks.spawn(watchdog::watch_pools(engine.clone()));
        engine.tasks.spawn(watchdog::watchdog(engine.clone()));
        engine.tasks.close();

        Ok(Self { engine })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run until SIGINT or SIGTERM, then shut down.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("Started.");
        info!("For debugging, set RUST_LOG=mujina_dispatch=debug or trace.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
        }

        self.shutdown().await;
        info!("Exiting.");
        Ok(())
    }

    /// Stop accepting work, cancel every task and wait for them to finish.
    pub async fn shutdown(self) {
        trace!("Shutting down.");
        self.engine.staging.freeze();
        self.engine.shutdown.cancel();
        self.engine.tasks.wait().await;

        let totals = self.engine.stats.totals();
        info!(
            accepted = totals.accepted,
            rejected = totals.rejected,
            stale = totals.stale,
            hw_errors = totals.hw_errors,
            blocks = totals.blocks_found,
            "Dispatcher stopped"
        );
    }
}
