//! The pool registry: every configured pool plus which one is current.
//!
//! Lock order is registry first, then a pool's own locks. Nothing here takes
//! the staging table lock; callers that need to clear staged work do so after
//! the registry call returns.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::Instant;

use super::strategy::{self, Candidate, Selection, Strategy};
use super::{Pool, PoolState};
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// A pool must be alive this long before failover returns to it.
pub const FAILBACK_STABLE: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Slot {
    pool: Arc<Pool>,
    prio: usize,
    quota: u64,
    quota_used: u64,
    /// Quota divided by the registry-wide gcd.
    quota_gcd: u64,
    balance_shares: f64,
    last_diff1: f64,
    utility: f64,
}

#[derive(Debug, Default)]
struct Inner {
    slots: Vec<Slot>,
    current: usize,
    rotating: usize,
    quota_gcd: u64,
}

impl Inner {
    fn index_of(&self, pool: &Pool) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| std::ptr::eq(Arc::as_ptr(&s.pool), pool))
    }

    fn selection(&self, now: Instant) -> Selection {
        let candidates = self
            .slots
            .iter()
            .map(|slot| {
                let stable = slot
                    .pool
                    .health
                    .lock()
                    .alive_since
                    .map_or(true, |t| now.duration_since(t) >= FAILBACK_STABLE);
                Candidate {
                    usable: !slot.pool.is_unusable(),
                    stable,
                    prio: slot.prio,
                    quota_used: slot.quota_used,
                    quota_gcd: slot.quota_gcd,
                    balance_shares: slot.balance_shares,
                }
            })
            .collect();
        Selection {
            candidates,
            current: self.current,
            rotating: self.rotating,
        }
    }

    fn adjust_quota_gcd(&mut self) {
        let quotas: Vec<u64> = self.slots.iter().map(|s| s.quota).collect();
        let gcd = strategy::quota_gcd(&quotas);
        for slot in &mut self.slots {
            let scaled = slot.quota / gcd;
            if slot.quota_gcd > 0 {
                slot.quota_used = slot.quota_used * scaled / slot.quota_gcd;
            }
            slot.quota_used = slot.quota_used.min(scaled);
            slot.quota_gcd = scaled;
        }
        self.quota_gcd = gcd;
        debug!(quota_gcd = gcd, "Recalculated quota gcd");
    }
}

/// Pool list, priorities, quotas and the current-pool pointer.
#[derive(Debug)]
pub struct Registry {
    strategy: Strategy,
    fail_only: bool,
    inner: RwLock<Inner>,
    /// Bumped with the new pool number whenever the current pool changes.
    changed: watch::Sender<usize>,
}

impl Registry {
    pub fn new(strategy: Strategy, fail_only: bool) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            strategy,
            fail_only,
            inner: RwLock::new(Inner {
                quota_gcd: 1,
                ..Default::default()
            }),
            changed,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn fail_only(&self) -> bool {
        self.fail_only
    }

    /// Append a pool at the lowest priority.
    pub fn add_pool(&self, config: &PoolConfig) -> Arc<Pool> {
        let mut inner = self.inner.write();
        let pool_no = inner.slots.len();
        let pool = Arc::new(Pool::new(pool_no, config));
        inner.slots.push(Slot {
            pool: pool.clone(),
            prio: pool_no,
            quota: config.quota,
            quota_used: 0,
            quota_gcd: 0,
            balance_shares: 0.0,
            last_diff1: 0.0,
            utility: 0.0,
        });
        inner.adjust_quota_gcd();
        debug!(pool_no, url = %pool.url, quota = config.quota, "Added pool");
        pool
    }

    /// Remove a pool that is not current. Remaining pools are renumbered.
    ///
    /// The pool object lives on while work or shares still reference it.
    pub fn remove_pool(&self, pool_no: usize) -> Result<Arc<Pool>> {
        let mut inner = self.inner.write();
        if pool_no >= inner.slots.len() {
            return Err(Error::Pool(format!("no pool {pool_no}")));
        }
        if pool_no == inner.current {
            return Err(Error::Pool(format!("pool {pool_no} is the current pool")));
        }

        let slot = inner.slots.remove(pool_no);
        for other in &mut inner.slots {
            if other.prio > slot.prio {
                other.prio -= 1;
            }
        }
        for (i, other) in inner.slots.iter().enumerate() {
            other.pool.set_pool_no(i);
        }
        if inner.current > pool_no {
            inner.current -= 1;
        }
        if inner.rotating >= inner.slots.len() {
            inner.rotating = 0;
        }
        inner.adjust_quota_gcd();
        slot.pool.mark_removed();
        info!(pool_no, url = %slot.pool.url, "Removed pool");
        Ok(slot.pool)
    }

    pub fn set_quota(&self, pool_no: usize, quota: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let slot = inner
            .slots
            .get_mut(pool_no)
            .ok_or_else(|| Error::Pool(format!("no pool {pool_no}")))?;
        slot.quota = quota;
        inner.adjust_quota_gcd();
        Ok(())
    }

    /// Registry-wide quota gcd.
    pub fn quota_gcd(&self) -> u64 {
        self.inner.read().quota_gcd
    }

    pub fn len(&self) -> usize {
        self.inner.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().slots.is_empty()
    }

    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.inner.read().slots.iter().map(|s| s.pool.clone()).collect()
    }

    pub fn get(&self, pool_no: usize) -> Option<Arc<Pool>> {
        self.inner.read().slots.get(pool_no).map(|s| s.pool.clone())
    }

    /// Pools sorted by priority, best first.
    pub fn priority_order(&self) -> Vec<Arc<Pool>> {
        let inner = self.inner.read();
        let mut slots: Vec<&Slot> = inner.slots.iter().collect();
        slots.sort_by_key(|s| s.prio);
        slots.into_iter().map(|s| s.pool.clone()).collect()
    }

    pub fn prio_of(&self, pool: &Pool) -> Option<usize> {
        let inner = self.inner.read();
        inner.index_of(pool).map(|i| inner.slots[i].prio)
    }

    /// The current pool.
    ///
    /// # Panics
    ///
    /// Never after the first `add_pool`; the daemon refuses to start without
    /// a pool.
    pub fn current(&self) -> Arc<Pool> {
        let inner = self.inner.read();
        inner.slots[inner.current].pool.clone()
    }

    /// The current pool, or `None` before any pool is added.
    pub fn get_current(&self) -> Option<Arc<Pool>> {
        let inner = self.inner.read();
        inner.slots.get(inner.current).map(|s| s.pool.clone())
    }

    pub fn is_current(&self, pool: &Pool) -> bool {
        let inner = self.inner.read();
        inner.index_of(pool) == Some(inner.current)
    }

    /// Give back the quota a discarded, unused work item consumed.
    pub fn return_quota(&self, pool: &Pool) {
        let mut inner = self.inner.write();
        if let Some(i) = inner.index_of(pool) {
            let slot = &mut inner.slots[i];
            slot.quota_used = slot.quota_used.saturating_sub(1);
        }
    }

    /// Pools in the `Enabled` state.
    pub fn enabled_count(&self) -> usize {
        self.inner
            .read()
            .slots
            .iter()
            .filter(|s| s.pool.state() == PoolState::Enabled)
            .count()
    }

    /// Receiver notified with the new pool number on every switch.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.changed.subscribe()
    }

    /// Pick the pool to take the next work item from.
    pub fn select_pool(&self, lagging: bool) -> Arc<Pool> {
        let mut inner = self.inner.write();
        let mut sel = inner.selection(Instant::now());
        let picked = strategy::select_pool(&mut sel, self.strategy, lagging, self.fail_only);

        for (slot, c) in inner.slots.iter_mut().zip(&sel.candidates) {
            slot.quota_used = c.quota_used;
            slot.balance_shares = c.balance_shares;
        }
        inner.rotating = sel.rotating;
        inner.slots[picked].pool.clone()
    }

    /// Recompute the current pool, optionally preferring `selected`.
    ///
    /// Returns the previous and new current pool. Clearing work from the
    /// previous pool is left to the caller.
    pub fn switch_pools(&self, selected: Option<&Arc<Pool>>) -> (Arc<Pool>, Arc<Pool>) {
        let (previous, next) = {
            let mut inner = self.inner.write();
            let selected_idx = selected.and_then(|p| inner.index_of(p));

            if let Some(idx) = selected_idx {
                if !self.strategy.is_round_robin_family() {
                    let boosted = inner.slots[idx].prio;
                    for slot in &mut inner.slots {
                        if slot.prio < boosted {
                            slot.prio += 1;
                        }
                    }
                    inner.slots[idx].prio = 0;
                }
            }

            let sel = inner.selection(Instant::now());
            let target = strategy::switch_target(&sel, self.strategy, selected_idx);
            let previous = inner.slots[inner.current].pool.clone();
            inner.current = target;
            (previous, inner.slots[target].pool.clone())
        };

        if self.fail_only {
            next.tset_lagging();
        }

        if !Arc::ptr_eq(&previous, &next) {
            if !self.strategy.is_shared() {
                warn!(pool = %next.url, "Switching to pool {} {}", next.pool_no(), next.url);
            }
            self.changed.send_replace(next.pool_no());
        }
        (previous, next)
    }

    /// Mark a pool idle. Returns true if it was alive.
    pub fn pool_died(&self, pool: &Pool) -> bool {
        if pool.tset_idle() {
            return false;
        }
        pool.health.lock().idle_since = Some(Instant::now());
        if self.is_current(pool) {
            warn!(pool = %pool.url, "Pool {} {} not responding!", pool.pool_no(), pool.url);
        } else {
            info!(pool = %pool.url, "Pool {} {} failed to respond", pool.pool_no(), pool.url);
        }
        true
    }

    /// Mark a pool alive again. Returns true if it was idle.
    pub fn pool_resus(&self, pool: &Pool) -> bool {
        pool.health.lock().seq_getfails = 0;
        if !pool.tclear_idle() {
            return false;
        }
        pool.health.lock().alive_since = Some(Instant::now());

        let current = self.current();
        let better = self
            .prio_of(pool)
            .zip(self.prio_of(&current))
            .is_some_and(|(p, c)| p < c);
        if better && self.strategy == Strategy::Failover {
            warn!(pool = %pool.url, "Pool {} {} alive, testing stability", pool.pool_no(), pool.url);
        } else {
            warn!(pool = %pool.url, "Pool {} {} alive", pool.pool_no(), pool.url);
        }
        true
    }

    /// Demote a pool after a streak of rejects.
    pub fn reject_pool(&self, pool: &Pool) {
        if pool.state() == PoolState::Enabled {
            pool.set_state(PoolState::Rejecting);
            warn!(pool = %pool.url, "Rejecting pool {} for repeated share rejects", pool.pool_no());
        }
    }

    /// Restore a pool. Returns true if it was not already enabled.
    pub fn enable_pool(&self, pool: &Pool) -> bool {
        let previous = pool.state();
        if previous == PoolState::Enabled {
            return false;
        }
        pool.set_state(PoolState::Enabled);
        info!(pool = %pool.url, from = %previous, "Enabled pool {}", pool.pool_no());
        true
    }

    pub fn disable_pool(&self, pool: &Pool) {
        pool.set_state(PoolState::Disabled);
        info!(pool = %pool.url, "Disabled pool {}", pool.pool_no());
    }

    /// A better-priority pool that has been alive long enough to fail back to.
    pub fn failback_candidate(&self) -> Option<Arc<Pool>> {
        let inner = self.inner.read();
        let now = Instant::now();
        let current_prio = inner.slots.get(inner.current)?.prio;
        inner
            .slots
            .iter()
            .filter(|s| s.prio < current_prio && !s.pool.is_unusable())
            .filter(|s| {
                s.pool
                    .health
                    .lock()
                    .alive_since
                    .map_or(true, |t| now.duration_since(t) >= FAILBACK_STABLE)
            })
            .min_by_key(|s| s.prio)
            .map(|s| s.pool.clone())
    }

    /// Refresh each pool's balance counter from its diff-1 share rate.
    ///
    /// Run every 10 minutes; the counter decays towards the latest interval.
    pub fn update_balance_utility(&self) {
        let mut inner = self.inner.write();
        for slot in &mut inner.slots {
            let diff1 = slot.pool.stats.lock().diff1;
            let shares = diff1 - slot.last_diff1;
            slot.last_diff1 = diff1;
            slot.utility = (slot.utility + shares * 0.63) / 1.63;
            slot.balance_shares = slot.utility;
        }
    }
}
