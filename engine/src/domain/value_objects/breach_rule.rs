//! "Critical K times out of the last W samples"

use serde::{Deserialize, Serialize};

use crate::domain::DomainError;

/// Breach rule of a condition evaluator.
/// `times` is the number of critical samples required and `window` the
/// ring-buffer capacity. A window smaller than `times` lowers `times` to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreachRule {
    times: usize,
    window: usize,
}

impl BreachRule {
    pub fn new(times: usize, window: usize) -> Result<Self, DomainError> {
        if times == 0 || window == 0 {
            return Err(DomainError::InvalidConfiguration(format!(
                "times must be positive, got [{}, {}]",
                times, window
            )));
        }
        Ok(Self {
            times: times.min(window),
            window,
        })
    }

    /// Single count K: window defaults to K
    pub fn times(times: usize) -> Result<Self, DomainError> {
        Self::new(times, times)
    }

    pub fn required(&self) -> usize {
        self.times
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

impl Default for BreachRule {
    fn default() -> Self {
        Self { times: 1, window: 1 }
    }
}
