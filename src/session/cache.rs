use std::collections::VecDeque;

pub const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Bounded FIFO of feedback waiting for the next prediction.
///
/// When producers outrun the predictor the oldest entry is evicted and counted, since the
/// lost sample no longer reaches the model.
pub struct FeedbackCache<T> {
    name: &'static str,
    entries: VecDeque<T>,
    capacity: usize,
    overflows: u64,
}

impl<T> FeedbackCache<T> {
    pub fn new(name: &'static str, capacity: usize) -> FeedbackCache<T> {
        FeedbackCache {
            name,
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            overflows: 0,
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            self.overflows += 1;
            if self.overflows.is_power_of_two() {
                log::warn!(
                    "{} cache full ({} entries), {} samples evicted so far",
                    self.name,
                    self.capacity,
                    self.overflows
                );
            }
        }
        self.entries.push_back(entry);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    /// Removes and returns up to `n` of the oldest entries.
    pub fn drain_up_to(&mut self, n: usize) -> std::collections::vec_deque::Drain<'_, T> {
        let n = n.min(self.entries.len());
        self.entries.drain(..n)
    }

    pub fn back(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.overflows += 1;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drops all entries and the overflow count.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.overflows = 0;
    }
}
