//! Per-operation-kind rate limiting
//!
//! Fixed one-minute windows per operation kind, owned by the engine handle.
//! Exceeding a quota surfaces `RateLimited` with a retry-after hint.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimits;
use crate::error::{EngineError, Result};

const WINDOW: Duration = Duration::from_secs(60);

/// Operation kinds with independent quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Retrieve,
    Write,
    Consolidate,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Retrieve => "retrieve",
            OpKind::Write => "write",
            OpKind::Consolidate => "consolidate",
        }
    }
}

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request limiter, one window per operation kind.
pub struct RateLimiter {
    limits: RateLimits,
    windows: Mutex<HashMap<OpKind, Window>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn quota(&self, kind: OpKind) -> u32 {
        match kind {
            OpKind::Retrieve => self.limits.retrieve_per_minute,
            OpKind::Write => self.limits.write_per_minute,
            OpKind::Consolidate => self.limits.consolidate_per_minute,
        }
    }

    /// Count one request against the kind's quota.
    pub fn check(&self, kind: OpKind) -> Result<()> {
        let quota = self.quota(kind);
        if quota == 0 {
            return Ok(());
        }

        let mut windows = self
            .windows
            .lock()
            .map_err(|_| EngineError::Unavailable("rate limiter poisoned".to_string()))?;
        let now = Instant::now();
        let window = windows.entry(kind).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started) >= WINDOW {
            window.started = now;
            window.count = 0;
        }

        if window.count >= quota {
            let retry_after = WINDOW.saturating_sub(now.duration_since(window.started));
            return Err(EngineError::RateLimited {
                operation: kind.as_str(),
                retry_after,
            });
        }

        window.count += 1;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_enforced_with_hint() {
        let limiter = RateLimiter::new(RateLimits {
            retrieve_per_minute: 2,
            write_per_minute: 0,
            consolidate_per_minute: 1,
        });

        assert!(limiter.check(OpKind::Retrieve).is_ok());
        assert!(limiter.check(OpKind::Retrieve).is_ok());
        let err = limiter.check(OpKind::Retrieve).unwrap_err();
        match err {
            EngineError::RateLimited {
                operation,
                retry_after,
            } => {
                assert_eq!(operation, "retrieve");
                assert!(retry_after <= WINDOW);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_quota_disables_kind() {
        let limiter = RateLimiter::new(RateLimits {
            retrieve_per_minute: 1,
            write_per_minute: 0,
            consolidate_per_minute: 1,
        });
        for _ in 0..100 {
            assert!(limiter.check(OpKind::Write).is_ok());
        }
    }

    #[test]
    fn test_kinds_are_independent() {
        let limiter = RateLimiter::new(RateLimits {
            retrieve_per_minute: 1,
            write_per_minute: 1,
            consolidate_per_minute: 1,
        });
        assert!(limiter.check(OpKind::Retrieve).is_ok());
        assert!(limiter.check(OpKind::Consolidate).is_ok());
        assert!(limiter.check(OpKind::Retrieve).is_err());
        assert!(limiter.check(OpKind::Write).is_ok());
    }
}
