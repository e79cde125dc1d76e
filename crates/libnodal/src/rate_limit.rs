use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Flood gate keyed by node id.
///
/// A run is admitted when the previous admitted run of the same node started
/// at least `min_interval` ago. Rejections leave the recorded timestamp
/// untouched, so a steady stream of floods cannot push the window forward.
pub struct RateLimiter {
    last_admitted: HashMap<String, Instant>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_admitted: HashMap::new(),
            min_interval,
        }
    }

    /// Check `node_id` and record the attempt if it is allowed.
    pub fn check(&mut self, node_id: &str) -> CheckResult {
        self.check_at(node_id, Instant::now())
    }

    pub fn check_at(&mut self, node_id: &str, now: Instant) -> CheckResult {
        if let Some(last) = self.last_admitted.get(node_id) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.min_interval {
                return CheckResult::RateLimited {
                    retry_after: self.min_interval - elapsed,
                };
            }
        }
        self.last_admitted.insert(node_id.to_string(), now);
        CheckResult::Allowed
    }
}

#[derive(Debug, PartialEq)]
pub enum CheckResult {
    Allowed,
    RateLimited { retry_after: Duration },
}
