use crate::stream::types::AnomalyRecord;
use std::collections::VecDeque;

/// Bounded FIFO window over the most recent items. Insertion order is the
/// display order (oldest first); once full, each push evicts the oldest item.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RollingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Owned copy for consumers; readers never observe the window mid-push.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Bounded newest-first record of detected anomalies. Repeated timestamps are
/// retained as distinct rows; the only tie-break is insertion order.
#[derive(Debug, Clone)]
pub struct AnomalyLog {
    records: VecDeque<AnomalyRecord>,
    capacity: usize,
}

impl AnomalyLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, entry: AnomalyRecord) {
        self.records.push_front(entry);
        self.records.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> Vec<AnomalyRecord> {
        self.records.iter().cloned().collect()
    }
}
