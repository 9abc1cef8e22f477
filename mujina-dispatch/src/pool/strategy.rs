//! Multi-pool strategies.
//!
//! Selection is a pure function over a [`Selection`] snapshot so it can be
//! exercised without a registry, tasks or clocks. The registry builds the
//! snapshot under its lock, calls in here, and writes the mutated counters
//! back.

use serde::{Deserialize, Serialize};

/// How work is spread across pools.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Strategy {
    /// Use the highest-priority live pool; fall back only when it fails.
    #[default]
    Failover,
    /// Move to the next pool only when the current one fails.
    RoundRobin,
    /// Move to the next pool every rotate period.
    Rotate,
    /// Spread work by quota.
    LoadBalance,
    /// Spread work so every pool sees a similar share rate.
    Balance,
}

impl Strategy {
    /// Strategies that draw work from several pools at once.
    pub fn is_shared(self) -> bool {
        matches!(self, Strategy::LoadBalance | Strategy::Balance)
    }

    /// Strategies that step through pools in index order.
    pub fn is_round_robin_family(self) -> bool {
        matches!(self, Strategy::RoundRobin | Strategy::Rotate)
    }
}

/// What selection needs to know about one pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Enabled, alive and (for stratum) holding a job.
    pub usable: bool,

    /// Alive long enough to be failed back to.
    pub stable: bool,

    /// Rank, 0 is most preferred.
    pub prio: usize,

    pub quota_used: u64,
    pub quota_gcd: u64,

    /// Recent share rate used by [`Strategy::Balance`].
    pub balance_shares: f64,
}

impl Candidate {
    pub fn new(prio: usize) -> Self {
        Self {
            usable: true,
            stable: true,
            prio,
            quota_used: 0,
            quota_gcd: 1,
            balance_shares: 0.0,
        }
    }
}

/// Registry state visible to selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub candidates: Vec<Candidate>,
    pub current: usize,
    /// Rotation cursor for quota consumption.
    pub rotating: usize,
}

impl Selection {
    fn by_priority(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.candidates.len()).collect();
        order.sort_by_key(|&i| self.candidates[i].prio);
        order
    }
}

/// Pool to take the next work item from.
pub fn select_pool(sel: &mut Selection, strategy: Strategy, lagging: bool, fail_only: bool) -> usize {
    let n = sel.candidates.len();
    if n == 0 {
        return 0;
    }

    if strategy == Strategy::Balance {
        return select_balanced(sel);
    }

    if strategy != Strategy::LoadBalance && (!lagging || fail_only) {
        return sel.current;
    }

    if sel.rotating >= n {
        sel.rotating = 0;
    }

    let avail = sel.candidates.iter().any(|c| c.quota_used < c.quota_gcd);
    if !avail {
        for c in &mut sel.candidates {
            c.quota_used = 0;
        }
        sel.rotating = (sel.rotating + 1) % n;
    }

    // Consume quota round-robin, starting at the cursor.
    for _ in 0..n {
        let c = &mut sel.candidates[sel.rotating];
        if c.quota_used < c.quota_gcd {
            c.quota_used += 1;
            if c.usable {
                return sel.rotating;
            }
        }
        sel.rotating = (sel.rotating + 1) % n;
    }

    // Nothing with quota is usable; go by priority.
    sel.by_priority()
        .into_iter()
        .find(|&i| sel.candidates[i].usable)
        .unwrap_or(sel.current)
}

fn select_balanced(sel: &mut Selection) -> usize {
    let mut chosen = sel.current.min(sel.candidates.len() - 1);
    let mut lowest = sel.candidates[chosen].balance_shares;
    for (i, c) in sel.candidates.iter().enumerate() {
        if c.usable && c.balance_shares < lowest {
            lowest = c.balance_shares;
            chosen = i;
        }
    }
    sel.candidates[chosen].balance_shares += 1.0;
    chosen
}

/// Pool that should become current.
///
/// `selected` has already been boosted to priority 0 by the caller for the
/// priority-ordered strategies.
pub fn switch_target(sel: &Selection, strategy: Strategy, selected: Option<usize>) -> usize {
    let n = sel.candidates.len();
    if n == 0 {
        return 0;
    }
    let current = sel.current.min(n - 1);

    match strategy {
        Strategy::Failover | Strategy::LoadBalance | Strategy::Balance => {
            let order = sel.by_priority();
            let current_prio = sel.candidates[current].prio;
            let first_usable = order.iter().copied().find(|&i| sel.candidates[i].usable);

            if strategy == Strategy::Failover {
                // Only fail back to a better pool once it has proven stable.
                let settled = order.iter().copied().find(|&i| {
                    let c = &sel.candidates[i];
                    c.usable && (c.stable || c.prio >= current_prio || Some(i) == selected)
                });
                settled.or(first_usable).unwrap_or(current)
            } else {
                first_usable.unwrap_or(current)
            }
        }
        Strategy::RoundRobin | Strategy::Rotate => {
            if let Some(i) = selected {
                if i < n && sel.candidates[i].usable {
                    return i;
                }
            }
            (1..n)
                .map(|step| (current + step) % n)
                .find(|&i| sel.candidates[i].usable)
                .unwrap_or(current)
        }
    }
}

/// Greatest common divisor of the nonzero quotas, or 1 if there are none.
pub fn quota_gcd(quotas: &[u64]) -> u64 {
    fn gcd(a: u64, b: u64) -> u64 {
        if b == 0 {
            a
        } else {
            gcd(b, a % b)
        }
    }
    quotas
        .iter()
        .copied()
        .filter(|&q| q > 0)
        .reduce(gcd)
        .unwrap_or(1)
}

/// Whether a streak of rejects should demote a pool to rejecting.
///
/// `utility` is accepted shares per minute across all pools.
pub fn should_reject(seq_rejects: u32, utility: f64, enabled_pools: usize, stale: bool) -> bool {
    seq_rejects > 10 && !stale && enabled_pools > 1 && f64::from(seq_rejects) > utility * 3.0
}
