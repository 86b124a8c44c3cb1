//! Rolling amax history.

use std::collections::VecDeque;

/// Fixed-length window of the most recent amax observations.
///
/// The window fills up to `capacity` entries before anything is evicted;
/// after that each push drops exactly the oldest value.
#[derive(Debug, Clone, PartialEq)]
pub struct AmaxHistory {
    values: VecDeque<f32>,
    capacity: usize,
}

impl AmaxHistory {
    /// Create an empty history. A zero capacity is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an observation, evicting the oldest if the window is full.
    ///
    /// Returns the evicted value.
    pub fn push(&mut self, amax: f32) -> Option<f32> {
        let evicted = if self.values.len() == self.capacity {
            self.values.pop_front()
        } else {
            None
        };
        self.values.push_back(amax);
        evicted
    }

    /// Change the window length, dropping the oldest values if it shrinks.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    /// Window length.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing has been observed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Newest observation.
    #[must_use]
    pub fn most_recent(&self) -> Option<f32> {
        self.values.back().copied()
    }

    /// Observations, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        self.values.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fills_before_evicting() {
        let mut history = AmaxHistory::new(4);
        for i in 1..=4 {
            assert_eq!(history.push(i as f32), None);
        }
        assert_eq!(history.len(), 4);
        assert_eq!(history.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_evicts_exactly_oldest() {
        let mut history = AmaxHistory::new(3);
        history.push(1.0);
        history.push(2.0);
        history.push(3.0);
        assert_eq!(history.push(4.0), Some(1.0));
        assert_eq!(history.to_vec(), vec![2.0, 3.0, 4.0]);
        assert_eq!(history.most_recent(), Some(4.0));
    }

    #[test]
    fn test_shrink_keeps_newest() {
        let mut history = AmaxHistory::new(4);
        for v in [1.0, 2.0, 3.0, 4.0] {
            history.push(v);
        }
        history.set_capacity(2);
        assert_eq!(history.to_vec(), vec![3.0, 4.0]);
        assert_eq!(history.push(5.0), Some(3.0));
    }

    #[test]
    fn test_zero_capacity_is_one() {
        let mut history = AmaxHistory::new(0);
        assert_eq!(history.capacity(), 1);
        history.push(1.0);
        assert_eq!(history.push(2.0), Some(1.0));
        assert!(!history.is_empty());
    }
}
