//! Transitions stored in replay memory

use serde::{Deserialize, Serialize};

use crate::{EthosError, Result};

/// One `(state, action, reward, next_state, done)` transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    /// Observation the decision was made on
    pub state: Vec<f32>,
    /// Index of the chosen action slot
    pub action_index: usize,
    /// Reward received
    pub reward: f32,
    /// Observation after the action
    pub next_state: Vec<f32>,
    /// Whether the episode ended
    pub done: bool,
}

impl Experience {
    /// Create a transition; `state` and `next_state` must have equal length
    pub fn new(
        state: Vec<f32>,
        action_index: usize,
        reward: f32,
        next_state: Vec<f32>,
        done: bool,
    ) -> Result<Self> {
        if state.len() != next_state.len() {
            return Err(EthosError::DimensionMismatch {
                expected: state.len(),
                actual: next_state.len(),
            });
        }
        Ok(Self {
            state,
            action_index,
            reward,
            next_state,
            done,
        })
    }

    /// Dimension of the stored observations
    #[must_use]
    pub fn state_size(&self) -> usize {
        self.state.len()
    }

    /// Approximate heap footprint in bytes
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + (self.state.len() + self.next_state.len()) * std::mem::size_of::<f32>()
    }
}

/// Pad with zeros or truncate `values` to exactly `size` entries
#[must_use]
pub fn fit_to_size(values: &[f32], size: usize) -> Vec<f32> {
    let mut out: Vec<f32> = values.iter().take(size).copied().collect();
    out.resize(size, 0.0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_next_state() {
        let err = Experience::new(vec![0.0; 3], 0, 1.0, vec![0.0; 2], false).unwrap_err();
        assert!(matches!(err, EthosError::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[test]
    fn fit_pads_and_truncates() {
        assert_eq!(fit_to_size(&[1.0, 2.0], 4), vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(fit_to_size(&[1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
    }
}
