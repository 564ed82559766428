use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::time::Instant;

/// Position of an entry in a [`DelayQueue`].
///
/// Keys order by deadline first and by insertion sequence second, so two
/// distinct entries never compare equal even with identical deadlines, and
/// equal deadlines come out in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DelayKey {
    pub deadline: Instant,
    pub seq: u64,
}

impl PartialOrd for DelayKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match self.deadline.cmp(&other.deadline) {
            CmpOrdering::Equal => self.seq.cmp(&other.seq),
            ord => ord,
        }
    }
}

/// Deadline-ordered queue. Not synchronized; owners wrap it in their own
/// lock together with the condition variable they wait on.
#[derive(Debug)]
pub struct DelayQueue<J> {
    entries: BTreeMap<DelayKey, J>,
    next_seq: u64,
}

impl<J> DelayQueue<J> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, job: J, deadline: Instant) -> DelayKey {
        let key = DelayKey {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, job);
        key
    }

    pub fn remove(&mut self, key: &DelayKey) -> Option<J> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &DelayKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Removes the earliest entry if its deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(DelayKey, J)> {
        let key = *self.entries.keys().next()?;
        if key.deadline > now {
            return None;
        }
        self.entries.remove(&key).map(|job| (key, job))
    }

    pub fn peek(&self) -> Option<&DelayKey> {
        self.entries.keys().next()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.peek().map(|key| key.deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry whose deadline is later than `cutoff`.
    pub fn drain_after(&mut self, cutoff: Instant) -> Vec<J> {
        let split = DelayKey {
            deadline: cutoff,
            seq: u64::MAX,
        };
        let later = self.entries.split_off(&split);
        later.into_values().collect()
    }

    /// Removes every entry matching `pred`, in deadline order.
    pub fn drain_where<F>(&mut self, mut pred: F) -> Vec<J>
    where
        F: FnMut(&J) -> bool,
    {
        let keys: Vec<DelayKey> = self
            .entries
            .iter()
            .filter(|(_, job)| pred(job))
            .map(|(key, _)| *key)
            .collect();
        keys.iter().filter_map(|key| self.entries.remove(key)).collect()
    }

    pub fn drain(&mut self) -> Vec<J> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

impl<J> Default for DelayQueue<J> {
    fn default() -> Self {
        Self::new()
    }
}
