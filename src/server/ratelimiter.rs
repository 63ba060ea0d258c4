use tokio::time::{Duration, Instant};

/// Fixed one-minute window counter for a single client's messages
#[derive(Debug)]
pub struct RateLimiter {
    /// Messages seen in the current window
    count: u32,
    /// Start of the current window
    window_start: Instant,
    /// Maximum messages allowed per window
    max_per_minute: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
            max_per_minute,
            window: Duration::from_secs(60),
        }
    }

    /// Count one message; `false` means it is over the limit and must be dropped
    pub fn check_limit(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.count = 0;
            self.window_start = now;
        }

        self.count = self.count.saturating_add(1);
        self.count <= self.max_per_minute
    }
}
