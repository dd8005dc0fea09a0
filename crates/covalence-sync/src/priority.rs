//! CoValue priority classes and the per-peer outgoing queue.
//!
//! Permission-bearing values (groups, accounts) travel first, binary streams
//! last, everything else in between. Dequeue is strict: a lower lane is only
//! served once every higher lane is empty.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

use covalence_core::CoValueHeader;

use crate::messages::SyncMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    /// Classify a CoValue by its header.
    pub fn of(header: &CoValueHeader) -> Self {
        if header.is_group() || header.is_account() {
            Priority::High
        } else if header.is_binary() {
            Priority::Low
        } else {
            Priority::Medium
        }
    }

    /// Classification when the header may not be known yet.
    pub fn of_optional(header: Option<&CoValueHeader>) -> Self {
        header.map_or(Priority::Medium, Self::of)
    }
}

/// Three FIFO lanes with strict-priority dequeue.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    lanes: [VecDeque<T>; 3],
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
        }
    }

    pub fn push(&mut self, priority: Priority, item: T) {
        self.lanes[priority as usize].push_back(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub fn lane_len(&self, priority: Priority) -> usize {
        self.lanes[priority as usize].len()
    }

    pub fn clear(&mut self) {
        self.lanes.iter_mut().for_each(VecDeque::clear);
    }
}

#[derive(Debug, Default)]
struct Lanes {
    queue: PriorityQueue<SyncMessage>,
    closed: bool,
}

/// Outgoing messages for one peer, drained by that peer's writer task.
#[derive(Debug, Default)]
pub struct OutgoingQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message. Returns `false` (and drops it) once closed.
    pub fn push(&self, priority: Priority, message: SyncMessage) -> bool {
        {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            if lanes.closed {
                return false;
            }
            lanes.queue.push(priority, message);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next message; `None` after `close`.
    pub async fn next(&self) -> Option<SyncMessage> {
        loop {
            {
                let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
                if lanes.closed {
                    return None;
                }
                if let Some(message) = lanes.queue.pop() {
                    return Some(message);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Drop everything pending and stop accepting messages.
    pub fn close(&self) {
        {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            lanes.closed = true;
            lanes.queue.clear();
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalence_core::{AgentId, CoValueId, CoValueType, HeaderMeta, Ruleset};
    use proptest::prelude::*;

    fn header(kind: CoValueType, ruleset: Ruleset, meta: Option<HeaderMeta>) -> CoValueHeader {
        let header = CoValueHeader::new(kind, ruleset);
        match meta {
            Some(meta) => header.with_meta(meta),
            None => header,
        }
    }

    #[test]
    fn test_classification() {
        let agent: AgentId = format!("agent_{}_{}", "11".repeat(32), "22".repeat(32))
            .parse()
            .unwrap();
        let group = CoValueId::derive(b"group");
        let owned = Ruleset::OwnedByGroup { group };

        assert_eq!(
            Priority::of(&header(
                CoValueType::CoMap,
                Ruleset::Group { initial_admin: agent },
                None
            )),
            Priority::High
        );
        assert_eq!(
            Priority::of(&header(CoValueType::CoMap, owned.clone(), Some(HeaderMeta::Account))),
            Priority::High
        );
        assert_eq!(
            Priority::of(&header(
                CoValueType::CoStream,
                owned.clone(),
                Some(HeaderMeta::Binary {
                    mime_type: "image/png".into(),
                    file_name: None
                })
            )),
            Priority::Low
        );
        assert_eq!(
            Priority::of(&header(CoValueType::CoList, owned, None)),
            Priority::Medium
        );
        assert_eq!(Priority::of_optional(None), Priority::Medium);
    }

    #[test]
    fn test_strict_priority_dequeue() {
        let mut queue = PriorityQueue::new();
        queue.push(Priority::Low, "file-1");
        queue.push(Priority::Medium, "doc-1");
        queue.push(Priority::Low, "file-2");
        queue.push(Priority::High, "group-1");
        queue.push(Priority::Medium, "doc-2");

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(order, vec!["group-1", "doc-1", "doc-2", "file-1", "file-2"]);
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn prop_never_serves_lower_lane_first(lanes in proptest::collection::vec(0usize..3, 0..64)) {
            let mut queue = PriorityQueue::new();
            for (n, lane) in lanes.iter().enumerate() {
                queue.push(Priority::ALL[*lane], (*lane, n));
            }
            let mut last = (0usize, 0usize);
            let mut first = true;
            while let Some((lane, n)) = queue.pop() {
                if !first {
                    // Lanes never go back up, and FIFO holds within a lane.
                    prop_assert!(lane >= last.0);
                    if lane == last.0 {
                        prop_assert!(n > last.1);
                    }
                }
                first = false;
                last = (lane, n);
            }
        }
    }

    #[tokio::test]
    async fn test_outgoing_queue_wakes_and_closes() {
        let queue = std::sync::Arc::new(OutgoingQueue::new());
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        assert!(queue.push(Priority::Medium, SyncMessage::Ping));
        assert_eq!(reader.await.unwrap(), Some(SyncMessage::Ping));

        queue.push(Priority::Low, SyncMessage::Pong);
        queue.close();
        assert_eq!(queue.next().await, None);
        assert!(!queue.push(Priority::High, SyncMessage::Ping));
        assert!(queue.is_empty());
    }
}
