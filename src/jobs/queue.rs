//! jobs/queue — очереди задач процессора.
//!
//! PriorityJobQueue: порядок (priority, seq) — меньший приоритет раньше, внутри приоритета FIFO.
//! TimedJobQueue:    порядок (deadline, seq) — ранний дедлайн раньше, при равенстве FIFO.
//!
//! Обе очереди держат индекс JobKey -> позиция, поэтому проверка "равная задача уже ждёт"
//! стоит O(1), а push возвращает ранее поставленную равную задачу (merge вместо дубля).

use std::collections::{BTreeMap, HashMap};

use super::{JobKey, JobRef, Priority};

/// Result of a push.
pub enum Pushed {
    /// A genuinely new entry was queued.
    New,
    /// An equal job was already pending; it is returned and no new entry was added
    /// (the pending entry may have been moved to a stronger slot).
    Merged(JobRef),
}

impl Pushed {
    #[inline]
    pub fn is_new(&self) -> bool {
        matches!(self, Pushed::New)
    }
}

#[derive(Default)]
pub struct PriorityJobQueue {
    seq: u64,
    entries: BTreeMap<(u8, u64), JobRef>,
    index: HashMap<JobKey, (u8, u64)>,
}

impl PriorityJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue `job` at `priority`.
    ///
    /// An equal pending job at the same priority keeps its FIFO slot. An equal job
    /// pending at a different priority is moved to `priority` (a re-queue with a
    /// new priority wins), still counted as a merge.
    pub fn push(&mut self, job: JobRef, priority: Priority) -> Pushed {
        let key = job.key();
        let p = priority.as_u8();
        if let Some(&pos) = self.index.get(&key) {
            if pos.0 == p {
                if let Some(prev) = self.entries.get(&pos) {
                    return Pushed::Merged(prev.clone());
                }
            }
            if let Some(prev) = self.entries.remove(&pos) {
                let slot = (p, self.next_seq());
                self.entries.insert(slot, prev.clone());
                self.index.insert(key, slot);
                return Pushed::Merged(prev);
            }
        }
        let slot = (p, self.next_seq());
        self.entries.insert(slot, job);
        self.index.insert(key, slot);
        Pushed::New
    }

    /// Remove and return the highest-priority, oldest entry.
    pub fn pop(&mut self) -> Option<(JobRef, Priority)> {
        let (slot, job) = self.entries.pop_first()?;
        self.index.remove(&job.key());
        Some((job, priority_from_u8(slot.0)))
    }

    pub fn peek(&self) -> Option<&JobRef> {
        self.entries.values().next()
    }

    /// Remove a pending job equal to `job`, if any.
    pub fn remove(&mut self, job: &JobRef) -> Option<JobRef> {
        let pos = self.index.remove(&job.key())?;
        self.entries.remove(&pos)
    }

    pub fn contains(&self, job: &JobRef) -> bool {
        self.index.contains_key(&job.key())
    }

    /// Drain everything in dispatch order.
    pub fn drain(&mut self) -> Vec<(JobRef, Priority)> {
        self.index.clear();
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(slot, job)| (job, priority_from_u8(slot.0)))
            .collect()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }
}

#[derive(Default)]
pub struct TimedJobQueue {
    seq: u64,
    entries: BTreeMap<(u64, u64), (JobRef, Priority)>,
    index: HashMap<JobKey, (u64, u64)>,
}

impl TimedJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue `job` to become ready at `at_millis`.
    ///
    /// An equal pending job keeps the earlier of the two deadlines; either way the
    /// push is a merge.
    pub fn push(&mut self, job: JobRef, at_millis: u64, priority: Priority) -> Pushed {
        let key = job.key();
        if let Some(&pos) = self.index.get(&key) {
            if pos.0 <= at_millis {
                if let Some((prev, _)) = self.entries.get(&pos) {
                    return Pushed::Merged(prev.clone());
                }
            }
            if let Some((prev, prio)) = self.entries.remove(&pos) {
                let slot = (at_millis, self.next_seq());
                self.entries.insert(slot, (prev.clone(), prio.min(priority)));
                self.index.insert(key, slot);
                return Pushed::Merged(prev);
            }
        }
        let slot = (at_millis, self.next_seq());
        self.entries.insert(slot, (job, priority));
        self.index.insert(key, slot);
        Pushed::New
    }

    /// Queue `job` strictly after every currently pending timed job (and not
    /// earlier than `now`). Used by drain barriers.
    pub fn push_lowest(&mut self, job: JobRef, now: u64) -> Pushed {
        let at = self.last_deadline().map(|d| d.max(now)).unwrap_or(now);
        self.push(job, at, Priority::Lowest)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.keys().next().map(|k| k.0)
    }

    pub fn last_deadline(&self) -> Option<u64> {
        self.entries.keys().next_back().map(|k| k.0)
    }

    /// Pop the earliest entry if its deadline has passed.
    pub fn pop_due(&mut self, now: u64) -> Option<(JobRef, Priority)> {
        let first = *self.entries.keys().next()?;
        if first.0 > now {
            return None;
        }
        let (job, prio) = self.entries.remove(&first)?;
        self.index.remove(&job.key());
        Some((job, prio))
    }

    pub fn remove(&mut self, job: &JobRef) -> Option<JobRef> {
        let pos = self.index.remove(&job.key())?;
        self.entries.remove(&pos).map(|(j, _)| j)
    }

    pub fn contains(&self, job: &JobRef) -> bool {
        self.index.contains_key(&job.key())
    }

    pub fn drain(&mut self) -> Vec<(JobRef, u64, Priority)> {
        self.index.clear();
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(slot, (job, prio))| (job, slot.0, prio))
            .collect()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }
}

fn priority_from_u8(v: u8) -> Priority {
    match v {
        0 => Priority::Highest,
        1 => Priority::AboveNormal,
        2 => Priority::Normal,
        3 => Priority::BelowNormal,
        _ => Priority::Lowest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{FnJob, JobKey};
    use std::sync::Arc;

    fn job(name: &str) -> JobRef {
        FnJob::new(name, || Ok(()))
    }

    fn keyed(id: u64) -> JobRef {
        FnJob::keyed("k", JobKey::Logical("k", id), || Ok(()))
    }

    #[test]
    fn priority_then_fifo() {
        let mut q = PriorityJobQueue::new();
        let a = job("a");
        let b = job("b");
        let c = job("c");
        let d = job("d");
        assert!(q.push(a.clone(), Priority::Normal).is_new());
        assert!(q.push(b.clone(), Priority::Lowest).is_new());
        assert!(q.push(c.clone(), Priority::Normal).is_new());
        assert!(q.push(d.clone(), Priority::Highest).is_new());

        let order: Vec<String> = std::iter::from_fn(|| q.pop().map(|(j, _)| j.name())).collect();
        assert_eq!(order, vec!["d", "a", "c", "b"]);
        assert!(q.is_empty());
    }

    #[test]
    fn equal_job_merges_and_keeps_slot() {
        let mut q = PriorityJobQueue::new();
        let first = keyed(1);
        let other = job("x");
        assert!(q.push(first.clone(), Priority::Normal).is_new());
        assert!(q.push(other.clone(), Priority::Normal).is_new());

        match q.push(keyed(1), Priority::Normal) {
            Pushed::Merged(prev) => assert!(Arc::ptr_eq(&prev, &first)),
            Pushed::New => panic!("equal job must merge"),
        }
        assert_eq!(q.len(), 2);
        // first keeps its FIFO slot in front of `other`
        assert!(Arc::ptr_eq(&q.pop().unwrap().0, &first));
    }

    #[test]
    fn equal_job_moves_to_new_priority() {
        let mut q = PriorityJobQueue::new();
        let other = job("x");
        q.push(other.clone(), Priority::Normal);
        q.push(keyed(7), Priority::Lowest);
        assert!(!q.push(keyed(7), Priority::Highest).is_new());
        assert_eq!(q.len(), 2);
        let (j, p) = q.pop().unwrap();
        assert_eq!(j.key(), JobKey::Logical("k", 7));
        assert_eq!(p, Priority::Highest);
    }

    #[test]
    fn timed_order_and_due() {
        let mut q = TimedJobQueue::new();
        q.push(job("late"), 300, Priority::Normal);
        q.push(job("early"), 100, Priority::Normal);
        q.push(job("early2"), 100, Priority::Normal);
        assert_eq!(q.next_deadline(), Some(100));
        assert!(q.pop_due(99).is_none());
        assert_eq!(q.pop_due(100).unwrap().0.name(), "early");
        assert_eq!(q.pop_due(100).unwrap().0.name(), "early2");
        assert!(q.pop_due(299).is_none());
        assert_eq!(q.pop_due(1000).unwrap().0.name(), "late");
    }

    #[test]
    fn timed_merge_keeps_earliest_deadline() {
        let mut q = TimedJobQueue::new();
        assert!(q.push(keyed(3), 500, Priority::Normal).is_new());
        assert!(!q.push(keyed(3), 900, Priority::Normal).is_new());
        assert_eq!(q.next_deadline(), Some(500));
        assert!(!q.push(keyed(3), 200, Priority::Highest).is_new());
        assert_eq!(q.len(), 1);
        let (_, p) = q.pop_due(200).unwrap();
        assert_eq!(p, Priority::Highest);
    }

    #[test]
    fn push_lowest_goes_after_everything() {
        let mut q = TimedJobQueue::new();
        q.push(job("a"), 1_000, Priority::Normal);
        q.push_lowest(job("barrier"), 10);
        assert_eq!(q.last_deadline(), Some(1_000));
        assert_eq!(q.pop_due(1_000).unwrap().0.name(), "a");
        assert_eq!(q.pop_due(1_000).unwrap().0.name(), "barrier");
    }
}
