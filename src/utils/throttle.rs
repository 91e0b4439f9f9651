//! Log throttling for per-frame warnings
//!
//! A track that hits the same error on every frame would otherwise log
//! thirty lines a second. The throttler lets one line per key through per
//! interval and counts what it swallowed in between.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    last: Instant,
    suppressed: u64,
}

/// Limits how often the same message key is logged
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Decide whether a message for `key` may be logged now
    ///
    /// Returns `Some(n)` when it may, where `n` is the number of messages
    /// suppressed for this key since the last one that got through.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = std::mem::take(&mut entry.suppressed);
                entry.last = now;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!` that reports how many repeats were dropped
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            tracing::warn!(suppressed, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_call_logs() {
        let throttler = LogThrottler::with_secs(1);
        assert_eq!(throttler.check("decode"), Some(0));
    }

    #[test]
    fn test_counts_suppressed_messages() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert_eq!(throttler.check("transform"), Some(0));
        assert_eq!(throttler.check("transform"), None);
        assert_eq!(throttler.check("transform"), None);

        thread::sleep(Duration::from_millis(150));
        assert_eq!(throttler.check("transform"), Some(2));
        assert_eq!(throttler.check("transform"), None);
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);

        assert_eq!(throttler.check("decode"), Some(0));
        assert_eq!(throttler.check("encode"), Some(0));
        assert_eq!(throttler.check("decode"), None);
        assert_eq!(throttler.check("encode"), None);
    }

    #[test]
    fn test_macro_logs_once_per_interval() {
        let throttler = LogThrottler::with_secs(10);
        let mut logged = 0;
        for _ in 0..5 {
            warn_throttled!(throttler, "sink", "write failed");
            if throttler.entries.lock()["sink"].suppressed == 0 {
                logged += 1;
            }
        }
        assert_eq!(logged, 1);
    }
}
