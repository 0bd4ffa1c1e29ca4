// Due-time queue of scheduled operations
//
// Ordered by (due time, id) so operations due at the same millisecond pop in
// a stable order. Only ids live here; the records stay in the scheduler map.

use crate::model::OperationId;
use std::collections::BTreeSet;

#[derive(Debug, Default)]
pub struct DueQueue {
    items: BTreeSet<(u64, OperationId)>,
}

impl DueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, due_at: u64, id: OperationId) {
        self.items.insert((due_at, id));
    }

    /// Drop a queued operation. Returns false when it was not queued.
    pub fn remove(&mut self, due_at: u64, id: &OperationId) -> bool {
        self.items.remove(&(due_at, *id))
    }

    /// Remove and return every operation due at or before `now_ms`.
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<OperationId> {
        let mut due = Vec::new();
        while let Some(&(at, id)) = self.items.first() {
            if at > now_ms {
                break;
            }
            self.items.pop_first();
            due.push(id);
        }
        due
    }

    pub fn next_due(&self) -> Option<u64> {
        self.items.first().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_only_due_in_order() {
        let mut queue = DueQueue::new();
        let (a, b, c) = (OperationId::new(), OperationId::new(), OperationId::new());
        queue.push(300, c);
        queue.push(100, a);
        queue.push(200, b);

        assert_eq!(queue.next_due(), Some(100));
        assert_eq!(queue.pop_due(250), vec![a, b]);
        assert_eq!(queue.len(), 1);
        assert!(queue.pop_due(299).is_empty());
        assert_eq!(queue.pop_due(300), vec![c]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_cancelled() {
        let mut queue = DueQueue::new();
        let id = OperationId::new();
        queue.push(10, id);
        assert!(!queue.remove(11, &id));
        assert!(queue.remove(10, &id));
        assert!(queue.pop_due(u64::MAX).is_empty());
    }
}
