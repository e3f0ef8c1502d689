use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Bounded, order-preserving set of tags the user has worked with.
///
/// Recording a tag that is already present leaves it where it is; only unseen
/// tags are appended. Once the set grows past capacity the oldest entries are
/// evicted from the front.
#[derive(Debug)]
pub struct TagHistory {
    capacity: usize,
    entries: Mutex<VecDeque<String>>,
}

impl TagHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record<S: AsRef<str>>(&self, tags: &[S]) {
        let mut entries = self.entries();
        for tag in tags {
            let tag = tag.as_ref().trim();
            if tag.is_empty() || entries.iter().any(|existing| existing == tag) {
                continue;
            }
            entries.push_back(tag.to_string());
        }
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    // A panic while holding the lock cannot leave the deque half-written, so the
    // poisoned guard is still consistent.
    fn entries(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TagHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
