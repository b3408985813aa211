//! Injected randomness for the probabilistic parts of the control loop.
//!
//! The reaction matrix rolls a weighted coin per match and the trigger
//! evaluator applies jitter to scheduled rules. Both take the source as a
//! dependency so tests can supply a fixed sequence of draws.

use rand::Rng;

/// Source of uniform draws in `[0, 1)` plus index picks.
pub trait RandomSource: Send + Sync {
    /// Uniform draw in `[0, 1)`.
    fn roll(&self) -> f64;

    /// Uniform index in `[0, len)`. `len` must be non-zero.
    fn pick_index(&self, len: usize) -> usize;
}

/// Production source backed by the thread-local RNG.
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn roll(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }

    fn pick_index(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }
}

/// Deterministic source for tests: replays a fixed sequence of draws, then
/// repeats the last value.
#[cfg(test)]
pub struct SeqRandom {
    draws: std::sync::Mutex<std::collections::VecDeque<f64>>,
    fallback: f64,
}

#[cfg(test)]
impl SeqRandom {
    pub fn new(draws: &[f64], fallback: f64) -> Self {
        Self {
            draws: std::sync::Mutex::new(draws.iter().copied().collect()),
            fallback,
        }
    }

    /// A source whose every draw is `value`.
    pub fn always(value: f64) -> Self {
        Self::new(&[], value)
    }
}

#[cfg(test)]
impl RandomSource for SeqRandom {
    fn roll(&self) -> f64 {
        self.draws
            .lock()
            .expect("seq random lock")
            .pop_front()
            .unwrap_or(self.fallback)
    }

    fn pick_index(&self, len: usize) -> usize {
        ((self.roll() * len as f64) as usize).min(len.saturating_sub(1))
    }
}
