//! Rolling message-rate estimate over a trailing window.

use crate::Micros;
use std::collections::VecDeque;

/// Average rate of the last `window` messages, in messages per second.
#[derive(Debug, Clone)]
pub struct FrameRateTracker {
    window: usize,
    times: VecDeque<Micros>,
}

impl FrameRateTracker {
    pub const DEFAULT_WINDOW: usize = 3;

    /// A window below two messages cannot yield a rate and is raised to two.
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            window,
            times: VecDeque::with_capacity(window),
        }
    }

    /// Record a message's originating time and return the updated rate.
    pub fn record(&mut self, originating_time: Micros) -> Option<f64> {
        if self.times.len() == self.window {
            self.times.pop_front();
        }
        self.times.push_back(originating_time);
        self.rate()
    }

    pub fn rate(&self) -> Option<f64> {
        let (first, last) = (self.times.front()?, self.times.back()?);
        let span = last - first;
        if self.times.len() < 2 || span <= 0 {
            return None;
        }
        Some((self.times.len() - 1) as f64 * 1_000_000.0 / span as f64)
    }
}

impl Default for FrameRateTracker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}
