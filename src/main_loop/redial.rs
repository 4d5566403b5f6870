use std::collections::HashMap;
use std::time::Duration;
use std::time::SystemTime;

use crate::config_models::cli_args::Args;
use crate::models::peer::endpoint::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DialAttempts {
    pub count: u32,
    pub last: SystemTime,
}

/// Failed dial attempts per endpoint, and the policy deciding when an
/// endpoint may be dialed again.
#[derive(Debug, Clone)]
pub(crate) struct DialBook {
    attempts: HashMap<Endpoint, DialAttempts>,
    interval: Duration,
    reset: Duration,
    max_attempts: u32,
}

impl DialBook {
    pub(crate) fn new(interval: Duration, reset: Duration, max_attempts: u32) -> Self {
        Self {
            attempts: HashMap::new(),
            interval,
            reset,
            max_attempts,
        }
    }

    pub(crate) fn from_args(args: &Args) -> Self {
        Self::new(args.redial_interval, args.redial_reset, args.redial_attempts)
    }

    /// Whether `endpoint` may be dialed at `now`. An endpoint whose last
    /// attempt lies more than the reset window back starts over with a
    /// clean slate.
    pub(crate) fn may_dial(&mut self, endpoint: &Endpoint, now: SystemTime) -> bool {
        let Some(attempts) = self.attempts.get(endpoint).copied() else {
            return true;
        };

        let since_last = now.duration_since(attempts.last).unwrap_or_default();
        if since_last >= self.reset {
            self.attempts.remove(endpoint);
            return true;
        }

        attempts.count < self.max_attempts && since_last >= self.interval
    }

    /// Count a failed attempt and return the number of consecutive failures.
    pub(crate) fn record_failure(&mut self, endpoint: Endpoint, now: SystemTime) -> u32 {
        let attempts = self.attempts.entry(endpoint).or_insert(DialAttempts {
            count: 0,
            last: now,
        });
        attempts.count += 1;
        attempts.last = now;
        attempts.count
    }

    pub(crate) fn record_success(&mut self, endpoint: &Endpoint) {
        self.attempts.remove(endpoint);
    }

    pub(crate) fn attempts(&self, endpoint: &Endpoint) -> u32 {
        self.attempts
            .get(endpoint)
            .map(|attempts| attempts.count)
            .unwrap_or_default()
    }

    pub(crate) fn is_abandoned(&self, endpoint: &Endpoint) -> bool {
        self.attempts(endpoint) >= self.max_attempts
    }

    /// Forget entries whose reset window has passed.
    pub(crate) fn prune(&mut self, now: SystemTime) -> usize {
        let before = self.attempts.len();
        let reset = self.reset;
        self.attempts.retain(|_, attempts| {
            now.duration_since(attempts.last).unwrap_or_default() < reset
        });
        before - self.attempts.len()
    }
}
