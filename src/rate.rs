//! Payload rate limiting.
//!
//! Paces a writer to a target payload rate. The clock is consulted every
//! `freq` payloads rather than on each one, trading pacing granularity for
//! hot-path cost.

use std::time::{Duration, Instant};

pub struct Rate {
    per_sec: u32,
    freq: u32,
    count: u64,
    started: Instant,
}

impl Rate {
    /// `per_sec` > 0 is the target payload rate; the limiter sleeps at most
    /// once every `freq` payloads.
    pub fn new(per_sec: u32, freq: u32) -> Self {
        Self {
            per_sec: per_sec.max(1),
            freq: freq.max(1),
            count: 0,
            started: Instant::now(),
        }
    }

    /// Account one payload, sleeping if the writer is ahead of its budget.
    pub fn pace(&mut self) {
        self.count += 1;
        if self.count % self.freq as u64 != 0 {
            return;
        }
        let budget = Duration::from_secs_f64(self.count as f64 / self.per_sec as f64);
        let elapsed = self.started.elapsed();
        if budget > elapsed {
            std::thread::sleep(budget - elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_slows_a_fast_writer() {
        let mut rate = Rate::new(1000, 10);
        let start = Instant::now();
        for _ in 0..100 {
            rate.pace();
        }
        // 100 payloads at 1000/s should take at least ~100ms
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_no_sleep_when_under_budget() {
        let mut rate = Rate::new(1_000_000, 1);
        let start = Instant::now();
        for _ in 0..100 {
            rate.pace();
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
