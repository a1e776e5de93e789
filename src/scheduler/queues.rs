//! Per-device work queues shared between the caller and the scheduler
//!
//! The caller owns the queues and drives them (enqueue on routing, dequeue
//! when a device starts work). The work-stealing scheduler only relocates
//! entries, and does so under the same lock so that the pop from the donor
//! and the push onto the target are observed as one step.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Callback run for a device after work was moved onto its queue.
///
/// Direct calls such as `rebalance_queues` and `try_steal_work` invoke it
/// inline on the caller's thread, so it should return quickly and hand any
/// real work off itself. The background timer runs it on tokio's blocking
/// pool instead.
pub trait QueueProcessor: Send + Sync {
    fn process_queue(&self, device: &str);
}

impl<F> QueueProcessor for F
where
    F: Fn(&str) + Send + Sync,
{
    fn process_queue(&self, device: &str) {
        self(device)
    }
}

/// Shared, cloneable map of device to pending work
#[derive(Debug)]
pub struct DeviceQueues<T> {
    inner: Arc<Mutex<HashMap<String, VecDeque<T>>>>,
}

impl<T> Clone for DeviceQueues<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for DeviceQueues<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeviceQueues<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Lock the queue map.
    ///
    /// A panic in another holder does not leave the map structurally
    /// invalid, so a poisoned lock is recovered rather than propagated.
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<T>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an item to the back of a device's queue
    pub fn push(&self, device: &str, item: T) {
        self.lock()
            .entry(device.to_string())
            .or_default()
            .push_back(item);
    }

    /// Take the next item from the front of a device's queue
    pub fn pop_front(&self, device: &str) -> Option<T> {
        self.lock().get_mut(device).and_then(|q| q.pop_front())
    }

    pub fn len(&self, device: &str) -> usize {
        self.lock().get(device).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, device: &str) -> bool {
        self.len(device) == 0
    }

    /// Total queued items across every device
    pub fn total_len(&self) -> usize {
        self.lock().values().map(|q| q.len()).sum()
    }

    /// Snapshot of every queue length
    pub fn lengths(&self) -> HashMap<String, usize> {
        self.lock()
            .iter()
            .map(|(device, q)| (device.clone(), q.len()))
            .collect()
    }

    /// Drop every item queued for a device, returning them in order
    pub fn drain(&self, device: &str) -> Vec<T> {
        self.lock()
            .get_mut(device)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

impl<T: Clone> DeviceQueues<T> {
    /// Copy of a device's queue, front first
    pub fn snapshot(&self, device: &str) -> Vec<T> {
        self.lock()
            .get(device)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Move the most recently enqueued item of `donor` onto the back of `target`.
///
/// Operates on an already locked map. Returns `false` if the donor is empty.
pub(crate) fn steal_tail<T>(
    queues: &mut HashMap<String, VecDeque<T>>,
    donor: &str,
    target: &str,
) -> bool {
    let item = match queues.get_mut(donor).and_then(|q| q.pop_back()) {
        Some(item) => item,
        None => return false,
    };
    queues.entry(target.to_string()).or_default().push_back(item);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_pop_fifo() {
        let queues = DeviceQueues::new();
        queues.push("a", 1);
        queues.push("a", 2);

        assert_eq!(queues.len("a"), 2);
        assert_eq!(queues.pop_front("a"), Some(1));
        assert_eq!(queues.pop_front("a"), Some(2));
        assert_eq!(queues.pop_front("a"), None);
        assert!(queues.is_empty("unknown"));
    }

    #[test]
    fn test_clones_share_state() {
        let queues = DeviceQueues::new();
        let handle = queues.clone();
        handle.push("a", "job");

        assert_eq!(queues.len("a"), 1);
        assert_eq!(queues.total_len(), 1);
    }

    #[test]
    fn test_steal_tail_moves_newest() {
        let queues = DeviceQueues::new();
        for job in ["j1", "j2", "j3"] {
            queues.push("donor", job);
        }
        queues.push("target", "t1");

        let moved = steal_tail(&mut queues.lock(), "donor", "target");

        assert!(moved);
        assert_eq!(queues.snapshot("donor"), vec!["j1", "j2"]);
        assert_eq!(queues.snapshot("target"), vec!["t1", "j3"]);
    }

    #[test]
    fn test_steal_tail_empty_donor() {
        let queues: DeviceQueues<u32> = DeviceQueues::new();
        assert!(!steal_tail(&mut queues.lock(), "donor", "target"));
        assert!(queues.lengths().get("target").is_none());
    }

    #[test]
    fn test_drain() {
        let queues = DeviceQueues::new();
        queues.push("a", 1);
        queues.push("a", 2);

        assert_eq!(queues.drain("a"), vec![1, 2]);
        assert_eq!(queues.len("a"), 0);
        assert!(queues.drain("missing").is_empty());
    }

    #[test]
    fn test_closure_is_processor() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let processor = move |_device: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        };

        processor.process_queue("a");
        processor.process_queue("b");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
