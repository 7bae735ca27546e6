//! Roll history (spec §6.5 "Persisted state"): a bounded in-memory ring
//! buffer of recent verdicts, kept for introspection (`stat`/`counters` CLI
//! commands) and explicitly not required to survive a restart.

use std::collections::VecDeque;

use parking_lot::Mutex;
use siftmail_contracts::{Action, TaskId};

/// One finished scan's verdict, as recorded into the ring buffer.
#[derive(Clone, Debug)]
pub struct VerdictRecord {
    pub task_id: TaskId,
    pub metric: String,
    pub score: f64,
    pub action: Action,
    pub symbols: Vec<String>,
}

/// Bounded ring buffer of the most recent [`VerdictRecord`]s.
///
/// Pushing past `capacity` evicts the oldest entry; there is no persistence
/// to disk (spec §6.5: "not required to survive restart").
pub struct RollHistory {
    capacity: usize,
    entries: Mutex<VecDeque<VerdictRecord>>,
}

impl RollHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, record: VerdictRecord) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    pub fn recent(&self, limit: usize) -> Vec<VerdictRecord> {
        let entries = self.entries.lock();
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(score: f64) -> VerdictRecord {
        VerdictRecord {
            task_id: TaskId::new(),
            metric: "default".to_string(),
            score,
            action: Action::NoAction,
            symbols: vec![],
        }
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let history = RollHistory::new(2);
        history.push(record(1.0));
        history.push(record(2.0));
        history.push(record(3.0));
        assert_eq!(history.len(), 2);
        let recent = history.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].score, 3.0);
        assert_eq!(recent[1].score, 2.0);
    }

    #[test]
    fn recent_respects_limit() {
        let history = RollHistory::new(10);
        for i in 0..5 {
            history.push(record(i as f64));
        }
        assert_eq!(history.recent(2).len(), 2);
    }
}
