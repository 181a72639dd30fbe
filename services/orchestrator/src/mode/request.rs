//! Request descriptors and the bounded request queue.

use std::collections::VecDeque;

use emesh_id::RequestId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    RealTime,
    Batch,
    Background,
}

/// Request priority. Ordered so that `Low < Normal < Urgent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Urgent,
}

/// One inbound unit of work as seen by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestInfo {
    pub id: RequestId,
    pub kind: RequestType,
    pub priority: Priority,
    pub estimated_complexity: f64,
    pub deadline: Option<Instant>,
    pub data_size: usize,
}

impl RequestInfo {
    pub fn new(kind: RequestType, priority: Priority) -> Self {
        Self {
            id: RequestId::new(),
            kind,
            priority,
            estimated_complexity: 1.0,
            deadline: None,
            data_size: 0,
        }
    }

    pub fn real_time(priority: Priority) -> Self {
        Self::new(RequestType::RealTime, priority)
    }

    pub fn batch(priority: Priority) -> Self {
        Self::new(RequestType::Batch, priority)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_data_size(mut self, data_size: usize) -> Self {
        self.data_size = data_size;
        self
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.estimated_complexity = complexity.max(0.0);
        self
    }

    /// Batch-typed and low-priority requests can be deferred into batches.
    pub fn is_batchable(&self) -> bool {
        self.kind == RequestType::Batch || self.priority == Priority::Low
    }

    /// Sort key for eviction: the smallest key is evicted first. Lower
    /// priority goes first; within a priority the soonest deadline goes
    /// first and requests without a deadline go last.
    fn eviction_key(&self) -> (Priority, bool, Option<Instant>) {
        (self.priority, self.deadline.is_none(), self.deadline)
    }
}

/// Arrival-ordered queue that never grows past its capacity.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    items: VecDeque<RequestInfo>,
    capacity: usize,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a request, evicting one if the queue is over capacity.
    ///
    /// The new request itself may be the one evicted.
    pub fn push(&mut self, request: RequestInfo) -> Option<RequestInfo> {
        self.items.push_back(request);
        if self.items.len() > self.capacity {
            self.evict_one()
        } else {
            None
        }
    }

    /// Removes the oldest request.
    pub fn pop_front(&mut self) -> Option<RequestInfo> {
        self.items.pop_front()
    }

    /// Drops `percent`% of the queued requests (rounded up) in eviction order.
    pub fn shed(&mut self, percent: u8) -> Vec<RequestInfo> {
        let percent = usize::from(percent.min(100));
        let count = (self.items.len() * percent).div_ceil(100);
        (0..count).filter_map(|_| self.evict_one()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn batchable_count(&self) -> usize {
        self.items.iter().filter(|r| r.is_batchable()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestInfo> {
        self.items.iter()
    }

    fn evict_one(&mut self) -> Option<RequestInfo> {
        // min_by_key keeps the first of equal keys, so ties evict the oldest.
        let index = self
            .items
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| r.eviction_key())
            .map(|(i, _)| i)?;
        self.items.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn normal() -> RequestInfo {
        RequestInfo::real_time(Priority::Normal)
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::Urgent);
    }

    #[test]
    fn test_queue_evicts_lowest_priority_on_overflow() {
        let mut queue = RequestQueue::new(100);
        for i in 0..100 {
            let request = if i == 42 {
                RequestInfo::batch(Priority::Low)
            } else {
                normal()
            };
            assert!(queue.push(request).is_none());
        }
        let low_id = queue.iter().nth(42).map(|r| r.id).unwrap();

        let evicted = queue.push(RequestInfo::real_time(Priority::Urgent)).unwrap();

        assert_eq!(queue.len(), 100);
        assert_eq!(evicted.id, low_id);
        assert_eq!(evicted.priority, Priority::Low);
    }

    #[test]
    fn test_queue_evicts_soonest_deadline_within_priority() {
        let now = Instant::now();
        let mut queue = RequestQueue::new(3);
        queue.push(normal().with_deadline(now + Duration::from_secs(30)));
        queue.push(normal());
        let soon = normal().with_deadline(now + Duration::from_secs(1));
        let soon_id = soon.id;
        queue.push(soon);

        let evicted = queue.push(normal()).unwrap();
        assert_eq!(evicted.id, soon_id);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_queue_without_deadlines_evicts_oldest() {
        let mut queue = RequestQueue::new(2);
        let first = normal();
        let first_id = first.id;
        queue.push(first);
        queue.push(normal());

        assert_eq!(queue.push(normal()).unwrap().id, first_id);
    }

    #[test]
    fn test_new_request_can_be_the_evicted_one() {
        let mut queue = RequestQueue::new(1);
        queue.push(RequestInfo::real_time(Priority::Urgent));
        let low = RequestInfo::batch(Priority::Low);
        let low_id = low.id;

        assert_eq!(queue.push(low).unwrap().id, low_id);
        assert_eq!(queue.iter().next().unwrap().priority, Priority::Urgent);
    }

    #[test]
    fn test_shed_drops_lowest_priority_first() {
        let mut queue = RequestQueue::new(100);
        for _ in 0..8 {
            queue.push(RequestInfo::real_time(Priority::Urgent));
        }
        queue.push(RequestInfo::batch(Priority::Low));
        queue.push(normal());

        let dropped = queue.shed(20);
        assert_eq!(dropped.len(), 2);
        assert_eq!(dropped[0].priority, Priority::Low);
        assert_eq!(dropped[1].priority, Priority::Normal);
        assert_eq!(queue.len(), 8);
    }

    #[test]
    fn test_shed_rounds_up_and_handles_empty() {
        let mut queue = RequestQueue::new(10);
        assert!(queue.shed(50).is_empty());
        queue.push(normal());
        assert_eq!(queue.shed(1).len(), 1);
    }

    #[test]
    fn test_batchable_count() {
        let mut queue = RequestQueue::new(10);
        queue.push(RequestInfo::batch(Priority::Normal));
        queue.push(RequestInfo::real_time(Priority::Low));
        queue.push(RequestInfo::new(RequestType::Background, Priority::Normal));
        queue.push(normal());
        assert_eq!(queue.batchable_count(), 2);
    }
}
