/// Buffer for emissions requested while the transport is not open.

use crate::error::{Result, SyncError};
use crate::protocol::ClientEvent;
use std::collections::VecDeque;
use std::time::Instant;

/// One buffered emission
#[derive(Debug, Clone)]
pub struct PendingEmission {
    pub event: ClientEvent,
    pub queued_at: Instant,
}

impl PendingEmission {
    pub fn new(event: ClientEvent) -> Self {
        Self {
            event,
            queued_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.event.name()
    }
}

/// Bounded FIFO of pending emissions.
///
/// `push` refuses new entries once full instead of dropping old ones.
/// Entries handed back with `requeue_front` were already accepted, so they
/// bypass the capacity check.
#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<PendingEmission>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, event: ClientEvent) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(SyncError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.entries.push_back(PendingEmission::new(event));
        Ok(())
    }

    /// Put entries back ahead of everything queued, keeping their order
    pub fn requeue_front(&mut self, entries: Vec<PendingEmission>) {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }

    /// Take every entry in submission order, leaving the queue empty
    pub fn drain(&mut self) -> Vec<PendingEmission> {
        self.entries.drain(..).collect()
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

    /// Event names in the order they will be flushed
    pub fn pending_names(&self) -> Vec<&'static str> {
        self.entries.iter().map(PendingEmission::name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(id: &str) -> ClientEvent {
        ClientEvent::Join(id.to_string())
    }

    fn ids(entries: &[PendingEmission]) -> Vec<String> {
        entries
            .iter()
            .map(|e| match &e.event {
                ClientEvent::Join(id) => id.clone(),
                other => other.name().to_string(),
            })
            .collect()
    }

    #[test]
    fn test_drain_is_fifo_and_empties() {
        let mut queue = OutboundQueue::new(8);
        for id in ["a", "b", "c"] {
            queue.push(join(id)).unwrap();
        }

        let drained = queue.drain();
        assert_eq!(ids(&drained), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_beyond_capacity_is_refused() {
        let mut queue = OutboundQueue::new(2);
        queue.push(join("a")).unwrap();
        queue.push(join("b")).unwrap();

        let err = queue.push(join("c")).unwrap_err();
        assert!(matches!(err, SyncError::QueueFull { capacity: 2 }));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_requeue_front_keeps_order_ahead_of_newer_entries() {
        let mut queue = OutboundQueue::new(2);
        queue.push(join("c")).unwrap();
        queue.push(join("d")).unwrap();

        queue.requeue_front(vec![
            PendingEmission::new(join("a")),
            PendingEmission::new(join("b")),
        ]);

        assert_eq!(queue.len(), 4);
        assert_eq!(ids(&queue.drain()), vec!["a", "b", "c", "d"]);
    }
}
