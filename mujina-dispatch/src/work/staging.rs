//! The staging table: work that has been fetched but not yet handed out.
//!
//! Items are keyed by id and ordered by staging time. Consumers take the
//! oldest item, preferring items that cannot be rolled so rollable masters
//! stay behind for the scheduler to clone from. Two [`Notify`] handles replace
//! the condition variables a thread-per-role design would use: `available`
//! wakes consumers blocked in [`StagingTable::pop`], `needed` wakes the
//! scheduler when the table drains.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Work, WorkIds};
use crate::tracing::prelude::*;

/// How long a consumer waits before logging that pools are not keeping up.
const NO_WORK_WARN: Duration = Duration::from_secs(10);

/// Result of pushing into the table.
#[derive(Debug)]
pub enum StageOutcome {
    Staged,
    /// The table is frozen for shutdown; the work is handed back.
    Frozen(Work),
}

#[derive(Debug, Default)]
struct Inner {
    items: BTreeMap<u64, Work>,
    order: BTreeSet<(Instant, u64)>,
    rollable: usize,
    frozen: bool,

    /// Adaptive queue depth, grown towards the configured depth.
    max_queue: usize,
    /// The scheduler saw the table over its limit since the last growth.
    work_filled: bool,
    /// A consumer found the table empty since the last growth.
    work_emptied: bool,
    /// A consumer has logged the "waiting for work" warning.
    no_work: bool,
}

impl Inner {
    fn insert(&mut self, work: Work) {
        if work.is_rollable() {
            self.rollable += 1;
        }
        self.order.insert((work.times.staged, work.id));
        if let Some(old) = self.items.insert(work.id, work) {
            // Ids are unique so this cannot happen, but keep the counters
            // honest if it ever does.
            self.order.remove(&(old.times.staged, old.id));
            if old.is_rollable() {
                self.rollable -= 1;
            }
        }
    }

    fn remove(&mut self, id: u64) -> Option<Work> {
        let work = self.items.remove(&id)?;
        self.order.remove(&(work.times.staged, work.id));
        if work.is_rollable() {
            self.rollable -= 1;
        }
        Some(work)
    }

    fn pick(&self) -> Option<u64> {
        if self.items.len() > self.rollable {
            self.order
                .iter()
                .map(|&(_, id)| id)
                .find(|id| self.items.get(id).is_some_and(|w| !w.is_rollable()))
        } else {
            self.order.first().map(|&(_, id)| id)
        }
    }
}

/// Concurrent table of staged work.
#[derive(Debug)]
pub struct StagingTable {
    inner: Mutex<Inner>,
    available: Notify,
    needed: Notify,
    queue_depth: usize,
}

impl StagingTable {
    /// Create a table that may grow its queue up to `queue_depth`.
    pub fn new(queue_depth: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                max_queue: 1,
                ..Default::default()
            }),
            available: Notify::new(),
            needed: Notify::new(),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Insert work and wake one consumer.
    pub fn push(&self, work: Work) -> StageOutcome {
        {
            let mut inner = self.inner.lock();
            if inner.frozen {
                return StageOutcome::Frozen(work);
            }
            inner.insert(work);
        }
        self.available.notify_one();
        StageOutcome::Staged
    }

    /// Remove the preferred item without waiting.
    pub fn try_pop(&self) -> Option<Work> {
        let work = {
            let mut inner = self.inner.lock();
            match inner.pick() {
                Some(id) => {
                    let work = inner.remove(id);
                    if inner.no_work {
                        inner.no_work = false;
                        warn!("Work available from pools, resuming.");
                    }
                    work
                }
                None => {
                    if inner.work_filled && inner.max_queue < self.queue_depth {
                        inner.max_queue += 1;
                        inner.work_filled = false;
                    }
                    inner.work_emptied = true;
                    None
                }
            }
        };

        // Either way the scheduler may need to fetch more.
        self.needed.notify_one();
        if work.is_some() && !self.is_empty() {
            self.available.notify_one();
        }
        work
    }

    /// Remove the preferred item, waiting until one is staged.
    pub async fn pop(&self) -> Work {
        loop {
            let available = self.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            if let Some(work) = self.try_pop() {
                return work;
            }

            if tokio::time::timeout(NO_WORK_WARN, available).await.is_err() {
                let mut inner = self.inner.lock();
                if !inner.no_work {
                    inner.no_work = true;
                    warn!("Waiting for work to be available from pools.");
                }
            }
        }
    }

    /// Wait until a consumer signals that more work is wanted.
    pub async fn wait_needed(&self) {
        self.needed.notified().await
    }

    /// Wake the scheduler, e.g. after discarding stale work.
    pub fn wake_scheduler(&self) {
        self.needed.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Staged items that can still be rolled.
    pub fn rollable(&self) -> usize {
        self.inner.lock().rollable
    }

    /// Current adaptive queue depth.
    pub fn max_queue(&self) -> usize {
        self.inner.lock().max_queue
    }

    /// Record that the scheduler found the table over its limit, growing the
    /// queue if consumers have drained it since the last time.
    pub fn note_filled(&self) {
        let mut inner = self.inner.lock();
        if inner.work_emptied && inner.max_queue < self.queue_depth {
            inner.max_queue += 1;
            inner.work_emptied = false;
        }
        inner.work_filled = true;
    }

    /// Copies of every staged item, oldest first.
    ///
    /// Callers evaluate conditions that need other locks on the copies, then
    /// act by id, so no pool lock is ever taken while the table is locked.
    pub fn snapshot(&self) -> Vec<Work> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|(_, id)| inner.items.get(id).cloned())
            .collect()
    }

    /// Copies of the rollable masters, oldest first.
    pub fn rollable_snapshot(&self) -> Vec<Work> {
        let inner = self.inner.lock();
        if inner.rollable == 0 {
            return Vec::new();
        }
        inner
            .order
            .iter()
            .filter_map(|(_, id)| inner.items.get(id))
            .filter(|w| w.is_rollable())
            .cloned()
            .collect()
    }

    /// Remove the given ids, returning whichever were still staged.
    pub fn remove_ids(&self, ids: &[u64]) -> Vec<Work> {
        let removed: Vec<Work> = {
            let mut inner = self.inner.lock();
            ids.iter().filter_map(|&id| inner.remove(id)).collect()
        };
        if !removed.is_empty() {
            self.needed.notify_one();
        }
        removed
    }

    /// Roll the staged master `id` in place and return a clone of the rolled
    /// job. The master is rolled once more so the clone's ntime is never
    /// produced twice. Returns `None` if the master is no longer staged.
    pub fn roll_and_clone(&self, id: u64, ids: &WorkIds) -> Option<Work> {
        let mut inner = self.inner.lock();
        let mut master = inner.remove(id)?;
        master.roll(ids.next());
        let clone = master.clone_with_id(ids.next());
        master.roll(ids.next());
        inner.insert(master);
        Some(clone)
    }

    /// Reject all further pushes.
    pub fn freeze(&self) {
        self.inner.lock().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.lock().frozen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::test_util::pool;
    use std::sync::Arc;

    fn work(ids: &WorkIds, staged: Instant) -> Work {
        let mut work = Work::new(ids.next(), pool(0, "http://node:8332"));
        work.times.staged = staged;
        work
    }

    #[test]
    fn test_pop_oldest_first() {
        let ids = WorkIds::new();
        let table = StagingTable::new(4);
        let base = Instant::now();

        // Staged out of order relative to id.
        let late = work(&ids, base + Duration::from_secs(3));
        let early = work(&ids, base + Duration::from_secs(1));
        let mid = work(&ids, base + Duration::from_secs(2));
        let (late_id, early_id, mid_id) = (late.id, early.id, mid.id);
        table.push(late);
        table.push(early);
        table.push(mid);

        let popped: Vec<u64> = std::iter::from_fn(|| table.try_pop()).map(|w| w.id).collect();
        assert_eq!(popped, vec![early_id, mid_id, late_id]);
        assert!(table.try_pop().is_none());
    }

    #[test]
    fn test_pop_order_non_decreasing_staged_time() {
        let ids = WorkIds::new();
        let table = StagingTable::new(4);
        let base = Instant::now();
        for offset in [5u64, 1, 9, 3, 3, 7, 0] {
            table.push(work(&ids, base + Duration::from_secs(offset)));
        }
        let mut last = None;
        while let Some(w) = table.try_pop() {
            if let Some(prev) = last {
                assert!(w.times.staged >= prev);
            }
            last = Some(w.times.staged);
        }
    }

    #[test]
    fn test_prefers_non_rollable() {
        let ids = WorkIds::new();
        let table = StagingTable::new(4);
        let base = Instant::now();

        let mut master = work(&ids, base);
        master.rolltime = 60;
        let master_id = master.id;
        let plain = work(&ids, base + Duration::from_secs(5));
        let plain_id = plain.id;

        table.push(master);
        table.push(plain);
        assert_eq!(table.rollable(), 1);

        assert_eq!(table.try_pop().unwrap().id, plain_id);
        // Only the master is left, so it is handed out.
        assert_eq!(table.try_pop().unwrap().id, master_id);
        assert_eq!(table.rollable(), 0);
    }

    #[test]
    fn test_roll_and_clone_keeps_master_staged() {
        let ids = WorkIds::new();
        let table = StagingTable::new(4);
        let mut master = work(&ids, Instant::now());
        master.rolltime = 60;
        let master_id = master.id;
        let ntime = master.ntime();
        table.push(master);

        let clone = table.roll_and_clone(master_id, &ids).unwrap();
        assert!(clone.is_clone());
        assert_eq!(clone.ntime(), ntime + 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.rollable(), 1);

        let master = table.try_pop().unwrap();
        assert_ne!(master.id, master_id);
        assert_eq!(master.rolls, 2);
        assert_eq!(master.ntime(), ntime + 2);
        assert!(table.roll_and_clone(master_id, &ids).is_none());
    }

    #[test]
    fn test_frozen_rejects_push() {
        let ids = WorkIds::new();
        let table = StagingTable::new(1);
        table.freeze();
        match table.push(work(&ids, Instant::now())) {
            StageOutcome::Frozen(w) => assert_eq!(w.id, 1),
            StageOutcome::Staged => panic!("frozen table accepted work"),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_queue_grows_after_fill_then_empty() {
        let table = StagingTable::new(3);
        assert_eq!(table.max_queue(), 1);
        table.note_filled();
        assert!(table.try_pop().is_none());
        assert_eq!(table.max_queue(), 2);
        table.note_filled();
        assert!(table.try_pop().is_none());
        table.note_filled();
        assert!(table.try_pop().is_none());
        assert_eq!(table.max_queue(), 3);
    }

    #[test]
    fn test_remove_ids() {
        let ids = WorkIds::new();
        let table = StagingTable::new(4);
        let a = work(&ids, Instant::now());
        let b = work(&ids, Instant::now());
        let (a_id, b_id) = (a.id, b.id);
        table.push(a);
        table.push(b);
        let removed = table.remove_ids(&[a_id, 999]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, a_id);
        assert_eq!(table.snapshot()[0].id, b_id);
    }

    #[tokio::test]
    async fn test_blocking_pop_waits_for_push() {
        let ids = WorkIds::new();
        let table = Arc::new(StagingTable::new(1));
        let consumer = {
            let table = table.clone();
            tokio::spawn(async move { table.pop().await.id })
        };
        tokio::task::yield_now().await;
        let w = work(&ids, Instant::now());
        let id = w.id;
        table.push(w);
        assert_eq!(consumer.await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_concurrent_consumers_get_distinct_ids() {
        let ids = WorkIds::new();
        let table = Arc::new(StagingTable::new(8));
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                tokio::spawn(async move { table.pop().await.id })
            })
            .collect();
        for _ in 0..4 {
            table.push(work(&ids, Instant::now()));
        }
        let mut got = Vec::new();
        for c in consumers {
            got.push(c.await.unwrap());
        }
        got.sort();
        got.dedup();
        assert_eq!(got.len(), 4);
    }
}
