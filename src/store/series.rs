use std::collections::VecDeque;

/// Fixed-capacity sequence that drops its oldest entry to admit a new one.
///
/// Order is arrival order. `len() <= capacity()` holds after every call.
#[derive(Clone, Debug)]
pub struct BoundedSeries<T> {
    capacity: usize,
    buffer: VecDeque<T>,
}

impl<T> BoundedSeries<T> {
    /// A zero capacity is clamped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends `item`, returning the evicted front entry when the series was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.buffer.len() >= self.capacity {
            self.buffer.pop_front()
        } else {
            None
        };
        self.buffer.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&T> {
        self.buffer.back()
    }
}

impl<T: Clone> BoundedSeries<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.buffer.iter().cloned().collect()
    }

    /// Copies the final `limit` entries, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<T> {
        let skip = self.buffer.len().saturating_sub(limit);
        self.buffer.iter().skip(skip).cloned().collect()
    }
}
