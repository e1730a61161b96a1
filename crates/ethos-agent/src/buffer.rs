//! Experience replay memory
//!
//! A fixed-capacity circular buffer. Once full, each insertion overwrites the
//! slot under the write cursor (the oldest entry) and the cursor wraps.

use rand::Rng;

use ethos_core::Experience;

/// Circular replay buffer
#[derive(Debug, Clone)]
pub struct ExperienceMemory {
    /// Buffer storage
    buffer: Vec<Experience>,
    /// Maximum capacity
    capacity: usize,
    /// Next slot to write
    position: usize,
    /// Slot of the most recent insertion
    last: Option<usize>,
}

impl ExperienceMemory {
    /// Create an empty memory holding at most `capacity` experiences
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Vec::with_capacity(capacity.min(4096)),
            capacity,
            position: 0,
            last: None,
        }
    }

    /// Insert an experience, overwriting the oldest one when full
    pub fn add(&mut self, experience: Experience) {
        if self.buffer.len() < self.capacity {
            self.buffer.push(experience);
        } else {
            self.buffer[self.position] = experience;
        }
        self.last = Some(self.position);
        self.position = (self.position + 1) % self.capacity;
    }

    /// Sample `min(batch_size, len)` experiences uniformly with replacement
    pub fn sample_with<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Vec<Experience> {
        let len = self.buffer.len();
        if len == 0 {
            return Vec::new();
        }
        (0..batch_size.min(len))
            .map(|_| self.buffer[rng.gen_range(0..len)].clone())
            .collect()
    }

    /// Sample using the thread-local RNG
    #[must_use]
    pub fn sample(&self, batch_size: usize) -> Vec<Experience> {
        self.sample_with(batch_size, &mut rand::thread_rng())
    }

    /// Overwrite `next_state` and `done` of the most recent insertion.
    ///
    /// Returns false when nothing has been inserted since the last clear or
    /// the new state has a different length.
    pub fn update_last(&mut self, next_state: Vec<f32>, done: bool) -> bool {
        let Some(slot) = self.last else {
            return false;
        };
        let entry = &mut self.buffer[slot];
        if entry.state.len() != next_state.len() {
            return false;
        }
        entry.next_state = next_state;
        entry.done = done;
        true
    }

    /// Most recent insertion
    #[must_use]
    pub fn last(&self) -> Option<&Experience> {
        self.last.map(|slot| &self.buffer[slot])
    }

    /// Contents from oldest to newest
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = &Experience> {
        let split = if self.buffer.len() < self.capacity { 0 } else { self.position };
        self.buffer[split..].iter().chain(self.buffer[..split].iter())
    }

    /// Current number of stored experiences
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if memory is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Maximum capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Estimated heap footprint of the stored experiences
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        self.buffer.first().map_or(0, |e| e.approx_bytes() * self.buffer.len())
    }

    /// Remove every experience
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.position = 0;
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn exp(tag: usize) -> Experience {
        Experience::new(vec![tag as f32; 2], tag, tag as f32, vec![tag as f32; 2], false).unwrap()
    }

    #[test]
    fn overwrites_oldest_in_circular_order() {
        let mut memory = ExperienceMemory::new(4);
        for i in 0..6 {
            memory.add(exp(i));
        }
        assert_eq!(memory.len(), 4);
        let order: Vec<usize> = memory.iter_oldest_first().map(|e| e.action_index).collect();
        assert_eq!(order, vec![2, 3, 4, 5]);
    }

    #[test]
    fn sample_is_truncated_to_size() {
        let mut memory = ExperienceMemory::new(10);
        memory.add(exp(0));
        memory.add(exp(1));
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(memory.sample_with(32, &mut rng).len(), 2);
        assert!(ExperienceMemory::new(3).sample(5).is_empty());
    }

    #[test]
    fn sample_draws_with_replacement() {
        let mut memory = ExperienceMemory::new(8);
        for i in 0..2 {
            memory.add(exp(i));
        }
        let mut rng = StdRng::seed_from_u64(11);
        let saw_duplicate = (0..64).any(|_| {
            let batch = memory.sample_with(2, &mut rng);
            batch[0].action_index == batch[1].action_index
        });
        assert!(saw_duplicate);
    }

    #[test]
    fn update_last_rewrites_newest_slot() {
        let mut memory = ExperienceMemory::new(2);
        assert!(!memory.update_last(vec![0.0; 2], true));
        memory.add(exp(0));
        memory.add(exp(1));
        memory.add(exp(2));
        assert!(memory.update_last(vec![9.0, 9.0], true));
        let last = memory.last().unwrap();
        assert_eq!(last.action_index, 2);
        assert_eq!(last.next_state, vec![9.0, 9.0]);
        assert!(last.done);
        assert!(!memory.update_last(vec![1.0], false));

        memory.clear();
        assert!(memory.last().is_none());
    }

    proptest! {
        #[test]
        fn size_never_exceeds_capacity(capacity in 1usize..32, inserts in 0usize..128) {
            let mut memory = ExperienceMemory::new(capacity);
            for i in 0..inserts {
                memory.add(exp(i));
                prop_assert!(memory.len() <= capacity);
            }
            let kept: Vec<usize> = memory.iter_oldest_first().map(|e| e.action_index).collect();
            let expected: Vec<usize> = (inserts.saturating_sub(capacity)..inserts).collect();
            prop_assert_eq!(kept, expected);
        }
    }
}
