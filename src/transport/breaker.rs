use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Rate-limited tolerance for malformed frames.
///
/// Single bad frames are logged and skipped. Once more than `threshold`
/// arrive within `window` the breaker trips and the connection should be
/// closed with `CLOSE_INVALID_PAYLOAD`.
#[derive(Debug, Clone)]
pub struct ProtocolErrorBreaker {
    threshold: usize,
    window: Duration,
    recent: VecDeque<Instant>,
}

impl Default for ProtocolErrorBreaker {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

impl ProtocolErrorBreaker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold,
            window,
            recent: VecDeque::with_capacity(threshold + 1),
        }
    }

    /// Count one malformed frame. Returns `true` when the breaker trips.
    pub fn record(&mut self) -> bool {
        let now = Instant::now();
        while self
            .recent
            .front()
            .is_some_and(|at| now.duration_since(*at) > self.window)
        {
            self.recent.pop_front();
        }
        self.recent.push_back(now);
        self.recent.len() > self.threshold
    }

    pub fn recent_errors(&self) -> usize {
        self.recent.len()
    }

    pub fn reset(&mut self) {
        self.recent.clear();
    }
}
