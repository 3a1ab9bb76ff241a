//! Per-user admission control.
//!
//! A sliding-window log keyed by `(user, scope)`. The log for every key
//! lives behind one mutex, so pruning, counting, and recording an admitted
//! request happen as a single step: two concurrent requests from the same
//! user can never both take the last slot.
//!
//! The rate and window are looked up from the [`SettingsSource`] on every
//! call, so an operator can tighten or relax limits without a restart.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::settings::SettingsSource;

/// Which budget a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleScope {
    /// Question submission.
    Ask,
    /// Page import creation.
    Import,
}

impl ThrottleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleScope::Ask => "ask",
            ThrottleScope::Import => "import",
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// Over budget; the oldest counted request leaves the window after `retry_after`.
    Deny { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow)
    }
}

/// Whole seconds a denied caller should wait, rounded up and at least 1.
pub fn retry_after_secs(wait: Duration) -> u64 {
    (wait.as_secs() + u64::from(wait.subsec_nanos() > 0)).max(1)
}

type WindowKey = (String, ThrottleScope);

pub struct Throttle {
    settings: Arc<dyn SettingsSource>,
    windows: Mutex<HashMap<WindowKey, VecDeque<Instant>>>,
}

impl Throttle {
    pub fn new(settings: Arc<dyn SettingsSource>) -> Self {
        Self {
            settings,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count a request from `user_id` against `scope` if it fits the budget.
    ///
    /// Denied requests are not recorded.
    pub fn admit(&self, user_id: &str, scope: ThrottleScope) -> Admission {
        let limit = self.settings.current().throttle.for_scope(scope);
        let window = Duration::from_secs(limit.window_secs);
        let now = Instant::now();

        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let log = windows.entry((user_id.to_string(), scope)).or_default();

        while let Some(&oldest) = log.front() {
            if now.duration_since(oldest) >= window {
                log.pop_front();
            } else {
                break;
            }
        }

        if log.len() >= limit.rate as usize {
            let retry_after = log
                .front()
                .map(|&oldest| window.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(window);
            tracing::debug!(user = user_id, scope = scope.as_str(), "throttle denied request");
            return Admission::Deny { retry_after };
        }

        log.push_back(now);
        Admission::Allow
    }

    /// Drop logs whose entries have all aged out of their window.
    pub fn prune(&self) {
        let config = self.settings.current();
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.retain(|(_, scope), log| {
            let window = Duration::from_secs(config.throttle.for_scope(*scope).window_secs);
            log.back()
                .is_some_and(|&newest| now.duration_since(newest) < window)
        });
    }

    /// Number of tracked `(user, scope)` keys.
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
