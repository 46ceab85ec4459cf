//! Timeout policy evaluated once per poll iteration

use std::time::{Duration, Instant};

use crate::error::TimeoutKind;

/// Wall-clock and idle bounds for a supervised process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

/// A bound that has been exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutViolation {
    pub kind: TimeoutKind,
    pub limit: Duration,
}

impl TimeoutPolicy {
    /// Zero durations count as disabled
    pub fn new(timeout: Option<Duration>, idle_timeout: Option<Duration>) -> Self {
        Self {
            timeout: timeout.filter(|limit| !limit.is_zero()),
            idle_timeout: idle_timeout.filter(|limit| !limit.is_zero()),
        }
    }

    /// Check both bounds; the general timeout takes precedence
    pub fn check(
        &self,
        now: Instant,
        start_time: Instant,
        last_output_time: Instant,
    ) -> Option<TimeoutViolation> {
        if let Some(limit) = self.timeout {
            if now.saturating_duration_since(start_time) > limit {
                return Some(TimeoutViolation {
                    kind: TimeoutKind::General,
                    limit,
                });
            }
        }

        if let Some(limit) = self.idle_timeout {
            if now.saturating_duration_since(last_output_time) > limit {
                return Some(TimeoutViolation {
                    kind: TimeoutKind::Idle,
                    limit,
                });
            }
        }

        None
    }
}
