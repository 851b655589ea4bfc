// SPDX-FileCopyrightText: © 2025 WebMCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! A rolling estimate of a channel's incoming bitrate, logged at `debug`
//! for operators. Not exported as a metric: adaptive bitrate selection is
//! out of scope, so nothing downstream consumes this beyond a log line.

use std::time::{Duration, Instant};

const BUCKET_DURATION: Duration = Duration::from_millis(500);
const BUCKET_COUNT: usize = 16; // 8-second window

pub struct BitrateEstimator {
    buckets: [u64; BUCKET_COUNT],
    index: usize,
    last_rotate: Instant,
}

impl BitrateEstimator {
    pub fn new() -> Self {
        Self {
            buckets: [0; BUCKET_COUNT],
            index: 0,
            last_rotate: Instant::now(),
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.rotate();
        self.buckets[self.index] += bytes as u64;
    }

    /// Bytes per second, averaged over the trailing window.
    pub fn bytes_per_second(&mut self) -> f64 {
        self.rotate();
        let total: u64 = self.buckets.iter().sum();
        total as f64 / (BUCKET_COUNT as f64 * BUCKET_DURATION.as_secs_f64())
    }

    fn rotate(&mut self) {
        let elapsed = self.last_rotate.elapsed();
        let ticks = (elapsed.as_secs_f64() / BUCKET_DURATION.as_secs_f64()) as usize;
        if ticks == 0 {
            return;
        }
        for _ in 0..ticks.min(BUCKET_COUNT) {
            self.index = (self.index + 1) % BUCKET_COUNT;
            self.buckets[self.index] = 0;
        }
        self.last_rotate = Instant::now();
    }
}

impl Default for BitrateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_within_a_bucket() {
        let mut est = BitrateEstimator::new();
        est.record(1000);
        est.record(2000);
        assert!(est.bytes_per_second() > 0.0);
    }
}
