use std::time::Duration;

pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_TRANSCRIPT_SEND_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_TRANSLATION_SEND_TIMEOUT: Duration = Duration::from_secs(60);

const TIMEOUT_FACTOR: f64 = 1.5;
const TIMEOUTS_BEFORE_INCREASE: u32 = 5;

/// Adaptive per-send timeout shared by the caption senders.
///
/// Starts at [`SEND_TIMEOUT`]. Five consecutive timed-out sends widen the
/// window by 1.5x up to the configured ceiling; successful sends walk it back
/// down once the streak is paid off.
#[derive(Debug)]
pub struct AdaptiveTimeout {
    current: Duration,
    ceiling: Duration,
    timeout_count: u32,
}

impl AdaptiveTimeout {
    pub fn new(ceiling: Duration) -> Self {
        Self {
            current: SEND_TIMEOUT,
            ceiling,
            timeout_count: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Records a send that completed within the window.
    pub fn on_success(&mut self) {
        if self.timeout_count > 0 {
            self.timeout_count -= 1;
        }
        if self.timeout_count == 0 && self.current > SEND_TIMEOUT {
            let reduced = self.current.div_f64(TIMEOUT_FACTOR);
            self.current = reduced.max(SEND_TIMEOUT);
        }
    }

    /// Records a send that exceeded the window.
    pub fn on_timeout(&mut self) {
        if self.current > self.ceiling {
            return;
        }
        self.timeout_count += 1;
        if self.timeout_count >= TIMEOUTS_BEFORE_INCREASE {
            self.current = self.current.mul_f64(TIMEOUT_FACTOR);
            self.timeout_count = 0;
        }
    }
}
