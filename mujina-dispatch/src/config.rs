//! Configuration management for mujina-dispatch.
//!
//! Configuration comes from a JSON file or, for quick single-pool setups,
//! from `MUJINA_*` environment variables. Every field has a default so a
//! file only needs to name what it changes.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pool::Strategy;

/// Main configuration structure for the dispatcher.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Pools in priority order
    pub pools: Vec<PoolConfig>,

    /// Multi-pool strategy
    pub strategy: Strategy,

    /// Minutes between switches under the rotate strategy
    pub rotate_period: u64,

    /// Staged work to keep beyond what the devices hold
    pub queue: usize,

    /// Seconds before un-rolled work is considered stale
    pub scan_time: u64,

    /// Only use backup pools when the primary is down
    pub fail_only: bool,

    /// Submit shares even when they are known to be stale
    pub submit_stale: bool,

    /// Drop rather than retry when submissions fail
    pub lowmem: bool,

    /// Demote pools that reject most of what we send
    pub disable_rejecting: bool,

    /// Hash a fixed header instead of pool work
    pub benchmark: bool,

    /// Append a line per submission to this file
    pub sharelog: Option<PathBuf>,

    /// Payout address for solo mining
    pub btc_address: Option<String>,

    /// Text placed in a solo coinbase scriptSig
    pub btc_sig: Option<String>,

    /// Reference CPU hashing threads
    pub cpu_threads: usize,

    /// Sent with `mining.suggest_difficulty` after authorizing
    pub suggested_difficulty: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            strategy: Strategy::Failover,
            rotate_period: 0,
            queue: 1,
            scan_time: 60,
            fail_only: false,
            submit_stale: false,
            lowmem: false,
            disable_rejecting: true,
            benchmark: false,
            sharelog: None,
            btc_address: None,
            btc_sig: None,
            cpu_threads: 1,
            suggested_difficulty: None,
        }
    }
}

/// Pool connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool URL (stratum+tcp://... or http://...)
    pub url: String,

    /// Worker name
    pub user: String,

    /// Password
    pub pass: String,

    /// Weight under the load-balance strategy
    pub quota: u64,

    /// Mine solo against a node's getblocktemplate
    pub solo: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: String::new(),
            pass: String::new(),
            quota: 1,
            solo: false,
        }
    }
}

impl Config {
    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from the environment.
    ///
    /// `MUJINA_CONFIG` names a file to start from; the remaining variables
    /// override it.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var_os("MUJINA_CONFIG") {
            Some(path) => Self::load_from(Path::new(&path))?,
            None => Config::default(),
        };

        if let Ok(url) = std::env::var("MUJINA_POOL_URL") {
            config.pools.insert(
                0,
                PoolConfig {
                    url,
                    user: std::env::var("MUJINA_POOL_USER").unwrap_or_default(),
                    pass: std::env::var("MUJINA_POOL_PASS").unwrap_or_else(|_| "x".to_string()),
                    ..Default::default()
                },
            );
        }
        if let Some(strategy) = env_parse::<Strategy>("MUJINA_STRATEGY")? {
            config.strategy = strategy;
        }
        if let Some(queue) = env_parse("MUJINA_QUEUE")? {
            config.queue = queue;
        }
        if let Some(scan_time) = env_parse("MUJINA_SCAN_TIME")? {
            config.scan_time = scan_time;
        }
        if let Some(threads) = env_parse("MUJINA_CPU_THREADS")? {
            config.cpu_threads = threads;
        }
        if let Some(benchmark) = env_parse("MUJINA_BENCHMARK")? {
            config.benchmark = benchmark;
        }
        if let Ok(path) = std::env::var("MUJINA_SHARELOG") {
            config.sharelog = Some(PathBuf::from(path));
        }
        if let Ok(address) = std::env::var("MUJINA_BTC_ADDRESS") {
            config.btc_address = Some(address);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() && !self.benchmark {
            return Err(Error::Config("no pools configured".into()));
        }
        if self.queue == 0 {
            return Err(Error::Config("queue depth must be at least 1".into()));
        }
        for pool in &self.pools {
            if pool.url.is_empty() {
                return Err(Error::Config("pool with empty url".into()));
            }
            if pool.solo && self.btc_address.is_none() {
                return Err(Error::Config(format!(
                    "solo pool {} needs btc_address",
                    pool.url
                )));
            }
        }
        Ok(())
    }

    /// Threads that will call `get_work`.
    pub fn mining_threads(&self) -> usize {
        self.cpu_threads.max(1)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={value}: {e}"))),
        Err(_) => Ok(None),
    }
}
