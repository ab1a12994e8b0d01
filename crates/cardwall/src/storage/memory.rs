//! In-memory work queue.
//!
//! Messages are kept in publish order until drained. Clones share the same
//! queue, so a test can hold one handle while the engine publishes through
//! another.

use anyhow::Result;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::debug;

use super::{RecomputeMessage, WorkQueue};

/// # Examples
///
/// ```
/// use cardwall::storage::{InMemoryWorkQueue, RecomputeMessage, WorkQueue};
///
/// let queue = InMemoryWorkQueue::new();
/// let handle = queue.clone();
/// queue
///     .publish(RecomputeMessage::CardAggregates { card_id: 1, aggregate_ids: vec![7] })
///     .unwrap();
/// assert_eq!(handle.pending(), 1);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryWorkQueue {
    messages: Rc<RefCell<VecDeque<RecomputeMessage>>>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending messages without consuming them.
    pub fn peek(&self) -> Vec<RecomputeMessage> {
        self.messages.borrow().iter().cloned().collect()
    }
}

impl WorkQueue for InMemoryWorkQueue {
    fn publish(&self, message: RecomputeMessage) -> Result<()> {
        debug!(?message, "Queued recomputation");
        self.messages.borrow_mut().push_back(message);
        Ok(())
    }

    fn drain(&self) -> Vec<RecomputeMessage> {
        self.messages.borrow_mut().drain(..).collect()
    }

    fn pending(&self) -> usize {
        self.messages.borrow().len()
    }
}
