use std::collections::VecDeque;

use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("replay buffer not ready: {len} items stored, {initial_size} required")]
    NotReady { len: usize, initial_size: usize },
}

/// Bounded FIFO store with uniform random sampling.
///
/// One instance is owned by each actor. Once `max_size` items are stored the
/// oldest item is evicted on every append.
pub struct ReplayBuffer<T> {
    items: VecDeque<T>,
    max_size: usize,
    initial_size: usize,
}

impl<T: Clone> ReplayBuffer<T> {
    pub fn new(max_size: usize, initial_size: usize) -> Self {
        assert!(max_size > 0, "replay buffer max_size must be positive");
        assert!(
            initial_size <= max_size,
            "replay buffer initial_size ({initial_size}) exceeds max_size ({max_size})"
        );
        ReplayBuffer {
            items: VecDeque::with_capacity(max_size),
            max_size,
            initial_size,
        }
    }

    pub fn append(&mut self, item: T) {
        if self.items.len() >= self.max_size {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Draws `batch_size` distinct stored items uniformly at random.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Vec<T>, ReplayError> {
        if !self.is_ready() || self.items.is_empty() {
            return Err(ReplayError::NotReady {
                len: self.items.len(),
                initial_size: self.initial_size,
            });
        }
        assert!(
            batch_size <= self.items.len(),
            "cannot sample {batch_size} items from a buffer holding {}",
            self.items.len()
        );
        let indices = rand::seq::index::sample(rng, self.items.len(), batch_size);
        Ok(indices.iter().map(|i| self.items[i].clone()).collect())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.items.len() >= self.initial_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn initial_size(&self) -> usize {
        self.initial_size
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn sample_returns_previously_appended_items() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut buffer = ReplayBuffer::new(10, 3);
        for i in 0..5 {
            buffer.append(i);
        }
        let batch = buffer.sample(4, &mut rng).unwrap();
        assert_eq!(batch.len(), 4);
        for item in &batch {
            assert!((0..5).contains(item));
        }
        // no duplicates within a single draw
        let mut sorted = batch.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 4);
    }

    #[test]
    fn readiness_follows_initial_size() {
        let mut buffer = ReplayBuffer::new(8, 3);
        assert!(!buffer.is_ready());
        buffer.append(1);
        buffer.append(2);
        assert!(!buffer.is_ready());
        buffer.append(3);
        assert!(buffer.is_ready());
    }

    #[test]
    fn sample_before_ready_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut buffer = ReplayBuffer::new(8, 3);
        buffer.append(1);
        assert_eq!(
            buffer.sample(1, &mut rng),
            Err(ReplayError::NotReady {
                len: 1,
                initial_size: 3
            })
        );
    }

    #[test]
    fn empty_buffer_with_zero_initial_size_is_not_sampled() {
        let mut rng = StdRng::seed_from_u64(0);
        let buffer: ReplayBuffer<u8> = ReplayBuffer::new(4, 0);
        assert!(buffer.sample(1, &mut rng).is_err());
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let mut buffer = ReplayBuffer::new(3, 1);
        for i in 0..7 {
            buffer.append(i);
            assert!(buffer.len() <= 3);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![4, 5, 6]);
        assert_eq!(buffer.max_size(), 3);
    }

    #[test]
    #[should_panic(expected = "exceeds max_size")]
    fn initial_size_above_max_size_panics() {
        let _ = ReplayBuffer::<u8>::new(2, 3);
    }
}
