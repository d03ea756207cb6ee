//! Transfer speed meter

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const SLOT: Duration = Duration::from_secs(1);

/// Running total plus a sliding-window rate
#[derive(Debug, Clone)]
pub struct RateMeter {
    total: u64,
    window: usize,
    /// (slot start, bytes) newest last
    slots: VecDeque<(Instant, u64)>,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(5)
    }
}

impl RateMeter {
    /// Meter averaging over `window_secs` one-second slots
    pub fn new(window_secs: usize) -> Self {
        Self {
            total: 0,
            window: window_secs.max(1),
            slots: VecDeque::new(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(bytes, Instant::now());
    }

    fn record_at(&mut self, bytes: u64, now: Instant) {
        self.total += bytes;
        match self.slots.back_mut() {
            Some((start, count)) if now.saturating_duration_since(*start) < SLOT => *count += bytes,
            _ => self.slots.push_back((now, bytes)),
        }
        self.expire(now);
    }

    fn expire(&mut self, now: Instant) {
        let horizon = SLOT * self.window as u32;
        while let Some((start, _)) = self.slots.front() {
            if now.saturating_duration_since(*start) >= horizon {
                self.slots.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the window
    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }

    fn rate_at(&mut self, now: Instant) -> f64 {
        self.expire(now);
        let bytes: u64 = self.slots.iter().map(|(_, b)| b).sum();
        bytes as f64 / self.window as f64
    }

    /// Bytes ever recorded
    pub fn total(&self) -> u64 {
        self.total
    }
}
