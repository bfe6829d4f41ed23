use std::time::Duration;
use tokio::time::Instant;

/// Accounting window; the budget restarts after each one
const WINDOW: Duration = Duration::from_secs(1);

/// Average-rate limiter for one data connection
#[derive(Debug)]
pub struct Throttle {
    bytes_per_sec: u64,
    window_start: Instant,
    sent_in_window: u64,
}

impl Throttle {
    /// `0` disables throttling
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            window_start: Instant::now(),
            sent_in_window: 0,
        }
    }

    /// Account for `bytes` about to be sent, sleeping if ahead of the rate
    pub async fn consume(&mut self, bytes: usize) {
        if self.bytes_per_sec == 0 {
            return;
        }
        self.sent_in_window += bytes as u64;
        let allowed_at =
            Duration::from_secs_f64(self.sent_in_window as f64 / self.bytes_per_sec as f64);
        let elapsed = self.window_start.elapsed();
        if allowed_at > elapsed {
            tokio::time::sleep(allowed_at - elapsed).await;
        }
        if self.window_start.elapsed() >= WINDOW {
            self.window_start = Instant::now();
            self.sent_in_window = 0;
        }
    }
}
