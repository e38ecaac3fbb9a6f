//! Bounded ring buffer of exited process records kept for audit.

use crate::core::models::ProcessRecord;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct ProcessHistory {
    capacity: usize,
    entries: VecDeque<ProcessRecord>,
}

impl ProcessHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Push a record, evicting the oldest one when full.
    pub fn push(&mut self, record: ProcessRecord) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent record for `pid`, if still retained.
    pub fn find(&self, pid: u32) -> Option<&ProcessRecord> {
        self.entries.iter().rev().find(|r| r.pid == pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_full() {
        let mut history = ProcessHistory::new(2);
        history.push(ProcessRecord::new(1, "a"));
        history.push(ProcessRecord::new(2, "b"));
        history.push(ProcessRecord::new(3, "c"));

        assert_eq!(history.len(), 2);
        assert!(history.find(1).is_none());
        let pids: Vec<u32> = history.iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![2, 3]);
    }

    #[test]
    fn find_returns_latest_entry_for_reused_pid() {
        let mut history = ProcessHistory::new(4);
        history.push(ProcessRecord::new(7, "first"));
        history.push(ProcessRecord::new(7, "second"));
        assert_eq!(history.find(7).unwrap().name, "second");
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let history = ProcessHistory::new(0);
        assert_eq!(history.capacity(), 1);
    }
}
