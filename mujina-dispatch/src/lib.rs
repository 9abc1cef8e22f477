//! Mining pool client and work dispatch engine.
//!
//! Pools are spoken to over getwork, getblocktemplate (pooled and solo) and
//! stratum v1. Work from all of them lands in one staging table that hashing
//! devices drain through [`engine::Engine::get_work`]; solutions go back out
//! through [`engine::Engine::submit_nonce`].

pub mod benchmark;
pub mod block;
pub mod config;
pub mod daemon;
pub mod device;
pub mod engine;
pub mod error;
pub mod pool;
pub mod rpc;
pub mod scheduler;
pub mod sharelog;
pub mod stats;
pub mod stratum_v1;
pub mod submit;
pub mod tracing;
pub mod types;
pub mod u256;
pub mod watchdog;
pub mod work;
