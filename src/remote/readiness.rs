//! Bounded polling shared by every readiness check.

use std::thread;
use std::time::Duration;

use anyhow::Result;

/// How often, and for how long, a readiness probe is retried.
///
/// The delay before attempt `n + 1` is `initial_delay * multiplier^n`,
/// capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Servers must be listening within two seconds.
    pub const SERVER: RetryPolicy = RetryPolicy::new(
        7,
        Duration::from_millis(50),
        2,
        Duration::from_millis(500),
    );

    /// Inbox log markers, checked after the fixed startup delay.
    pub const INBOX: RetryPolicy = RetryPolicy::new(
        10,
        Duration::from_millis(500),
        1,
        Duration::from_millis(500),
    );

    /// Probe once, never wait.
    pub const ONCE: RetryPolicy = RetryPolicy::new(1, Duration::ZERO, 1, Duration::ZERO);

    pub const fn new(
        attempts: u32,
        initial_delay: Duration,
        multiplier: u32,
        max_delay: Duration,
    ) -> Self {
        Self {
            attempts,
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// Same number of attempts with no waiting, for tests and dry runs.
    pub const fn without_delay(self) -> Self {
        Self::new(self.attempts, Duration::ZERO, 1, Duration::ZERO)
    }

    /// Delays slept between consecutive attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let mut next = self.initial_delay;
        let max = self.max_delay;
        let multiplier = self.multiplier;
        (1..self.attempts.max(1)).map(move |_| {
            let delay = next.min(max);
            next = next.saturating_mul(multiplier);
            delay
        })
    }

    /// Total time spent sleeping if every attempt fails.
    pub fn budget(&self) -> Duration {
        self.delays().sum()
    }
}

/// Policies used by an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub server: RetryPolicy,
    pub inbox: RetryPolicy,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            server: RetryPolicy::SERVER,
            inbox: RetryPolicy::INBOX,
        }
    }
}

impl Readiness {
    /// Same attempt counts, no sleeping.
    pub fn immediate() -> Self {
        let default = Self::default();
        Self {
            server: default.server.without_delay(),
            inbox: default.inbox.without_delay(),
        }
    }
}

/// Run `probe` until it reports success or the policy is exhausted.
///
/// Returns `Ok(false)` on timeout. Errors from the probe abort immediately.
pub fn poll_until<F>(policy: &RetryPolicy, mut probe: F) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    let mut delays = policy.delays();
    loop {
        if probe()? {
            return Ok(true);
        }
        match delays.next() {
            Some(delay) => thread::sleep(delay),
            None => return Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_policy_stays_within_two_seconds() {
        assert_eq!(RetryPolicy::SERVER.budget(), Duration::from_millis(1750));
        assert!(RetryPolicy::SERVER.budget() <= Duration::from_secs(2));
    }

    #[test]
    fn delays_back_off_then_cap() {
        let delays: Vec<_> = RetryPolicy::SERVER.delays().collect();
        let ms: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
        assert_eq!(ms, vec![50, 100, 200, 400, 500, 500]);
    }

    #[test]
    fn probe_runs_exactly_attempts_times_on_timeout() {
        let policy = RetryPolicy::SERVER.without_delay();
        let mut calls = 0;
        let ok = poll_until(&policy, || {
            calls += 1;
            Ok(false)
        })
        .unwrap();
        assert!(!ok);
        assert_eq!(calls, 7);
    }

    #[test]
    fn probe_stops_at_first_success() {
        let policy = RetryPolicy::INBOX.without_delay();
        let mut calls = 0;
        let ok = poll_until(&policy, || {
            calls += 1;
            Ok(calls == 3)
        })
        .unwrap();
        assert!(ok);
        assert_eq!(calls, 3);
    }

    #[test]
    fn probe_errors_propagate() {
        let err = poll_until(&RetryPolicy::ONCE, || anyhow::bail!("ssh died")).unwrap_err();
        assert!(err.to_string().contains("ssh died"));
    }
}
