use std::time::{Duration, Instant};

/// Throttles a running transfer from its progress ticks.
///
/// `limit > 0` caps the transfer at that many bytes per second; a limit
/// strictly between -100 and 0 treats its magnitude as a percentage of the
/// measured line rate; `0` (and anything at or below -100) disables
/// throttling.
#[derive(Debug)]
pub struct BandwidthLimiter {
    limit: i64,
    last_tick: Instant,
    last_progress: u64,
}

impl BandwidthLimiter {
    pub fn new(limit: i64) -> Self {
        Self::starting_at(limit, Instant::now())
    }

    pub fn starting_at(limit: i64, now: Instant) -> Self {
        Self {
            limit,
            last_tick: now,
            last_progress: 0,
        }
    }

    /// How long the transfer should pause given cumulative `progress`
    /// bytes at time `now`. Updates the tick state; the caller is expected
    /// to sleep for the returned duration before the next tick.
    pub fn delay_for(&mut self, now: Instant, progress: u64) -> Option<Duration> {
        let elapsed_us = now.duration_since(self.last_tick).as_micros() as i64;
        if self.limit > 0 {
            let len = progress.saturating_sub(self.last_progress) as i64;
            let mut wait = None;
            if len > 0 && elapsed_us > 0 && 1_000_000 * len / elapsed_us > self.limit {
                let wait_us = 1_000_000 * len / self.limit - elapsed_us;
                if wait_us > 0 {
                    wait = Some(Duration::from_micros(wait_us as u64));
                }
            }
            self.last_progress = progress;
            self.last_tick = now;
            wait
        } else if self.limit < 0 && self.limit > -100 {
            // |limit| is the percentage of line rate we may use; sleeping a
            // multiple of the active time yields active/total == |limit|%.
            let wait_us = (-(elapsed_us as f64) * (1.0 + 100.0 / self.limit as f64)) as i64;
            self.last_tick = now;
            (wait_us > 0).then(|| Duration::from_micros(wait_us as u64))
        } else {
            None
        }
    }

    pub async fn throttle(&mut self, progress: u64) {
        if let Some(wait) = self.delay_for(Instant::now(), progress) {
            tokio::time::sleep(wait).await;
            // Restart the clock after the pause so the sleep itself does
            // not count as transfer time.
            self.last_tick = Instant::now();
        }
    }
}
