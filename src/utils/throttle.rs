//! Rate limiting for repeated log lines
//!
//! Per-frame failures (a track written before the transport is up, an encoder
//! rejecting a buffer) recur every few milliseconds. Each call site names its
//! failure with a static key and logs at most once per interval.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Remembers when each key was last logged
pub struct LogThrottler {
    interval: Duration,
    last: Mutex<HashMap<&'static str, Instant>>,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// `true` at most once per interval for `key`
    pub fn should_log(&self, key: &'static str) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        match last.get(key) {
            Some(at) if now.duration_since(*at) < self.interval => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }
}

/// `warn!` gated by a [`LogThrottler`] key
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeats_suppressed_within_interval() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("video_write"));
        assert!(!throttler.should_log("video_write"));

        std::thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("video_write"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("video_write"));
        assert!(throttler.should_log("audio_write"));
        assert!(!throttler.should_log("video_write"));
    }
}
