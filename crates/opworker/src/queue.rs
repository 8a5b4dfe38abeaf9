//! Ordered operation queue keyed by operation id.
//!
//! An `OperationsQueue` is a FIFO of operation ids paired with a map from id
//! to the operation itself, so the scheduler can both dequeue in submission
//! order and remove an arbitrary entry by id (re-submission displacement,
//! per-id cancellation, the bulk-cancel drain). The FIFO and the map always
//! hold exactly the same id set.

use crate::operation::{Operation, OperationId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub(crate) struct OperationsQueue {
    order: VecDeque<OperationId>,
    by_id: HashMap<OperationId, Arc<dyn Operation>>,
}

impl OperationsQueue {
    pub(crate) fn new() -> Self {
        Self {
            order: VecDeque::new(),
            by_id: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        debug_assert_eq!(self.order.len(), self.by_id.len());
        self.order.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Id at the head of the queue, if any.
    pub(crate) fn head(&self) -> Option<OperationId> {
        self.order.front().copied()
    }

    pub(crate) fn contains(&self, id: OperationId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Append an operation at the tail.
    ///
    /// The caller must have removed any previous entry with the same id
    /// first; a queue never holds two entries for one id.
    pub(crate) fn enqueue(&mut self, id: OperationId, operation: Arc<dyn Operation>) {
        debug_assert!(!self.by_id.contains_key(&id));
        self.order.push_back(id);
        self.by_id.insert(id, operation);
    }

    /// Remove and return the operation at the head.
    pub(crate) fn dequeue(&mut self) -> Option<Arc<dyn Operation>> {
        let id = self.order.pop_front()?;
        self.by_id.remove(&id)
    }

    /// Remove the entry with `id` from anywhere in the queue.
    pub(crate) fn remove(&mut self, id: OperationId) -> Option<Arc<dyn Operation>> {
        let operation = self.by_id.remove(&id)?;
        if let Some(position) = self.order.iter().position(|&queued| queued == id) {
            self.order.remove(position);
        }
        Some(operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationState;

    struct NullOperation {
        state: OperationState,
        id: OperationId,
    }

    impl NullOperation {
        fn arc(id: OperationId) -> Arc<dyn Operation> {
            Arc::new(Self {
                state: OperationState::new(),
                id,
            })
        }
    }

    impl Operation for NullOperation {
        fn state(&self) -> &OperationState {
            &self.state
        }

        fn execute(&self) {}

        fn id(&self) -> OperationId {
            self.id
        }
    }

    #[test]
    fn test_empty_queue() {
        let mut queue = OperationsQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.head(), None);
        assert!(queue.dequeue().is_none());
        assert!(queue.remove(7).is_none());
    }

    #[test]
    fn test_enqueue_dequeue_is_fifo() {
        let mut queue = OperationsQueue::new();
        queue.enqueue(1, NullOperation::arc(1));
        queue.enqueue(2, NullOperation::arc(2));
        queue.enqueue(3, NullOperation::arc(3));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.head(), Some(1));

        assert_eq!(queue.dequeue().unwrap().id(), 1);
        assert_eq!(queue.dequeue().unwrap().id(), 2);
        assert_eq!(queue.dequeue().unwrap().id(), 3);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_remove_from_middle_preserves_order() {
        let mut queue = OperationsQueue::new();
        queue.enqueue(1, NullOperation::arc(1));
        queue.enqueue(2, NullOperation::arc(2));
        queue.enqueue(3, NullOperation::arc(3));

        let removed = queue.remove(2).unwrap();
        assert_eq!(removed.id(), 2);
        assert_eq!(queue.len(), 2);
        assert!(!queue.contains(2));

        assert_eq!(queue.dequeue().unwrap().id(), 1);
        assert_eq!(queue.dequeue().unwrap().id(), 3);
    }

    #[test]
    fn test_contains_and_head_track_removals() {
        let mut queue = OperationsQueue::new();
        queue.enqueue(5, NullOperation::arc(5));
        queue.enqueue(6, NullOperation::arc(6));

        assert!(queue.contains(5));
        assert_eq!(queue.head(), Some(5));

        queue.remove(5);
        assert!(!queue.contains(5));
        assert_eq!(queue.head(), Some(6));
    }

    #[test]
    fn test_queue_ids_use_the_registered_key() {
        // the scheduler keys the queue by `Operation::id()`, which may differ
        // from the state's default id when the implementer overrides it
        let mut queue = OperationsQueue::new();
        queue.enqueue(42, NullOperation::arc(42));
        assert!(queue.contains(42));
        assert_eq!(queue.head(), Some(42));
        assert!(queue.remove(42).is_some());
        assert!(queue.is_empty());
    }
}
