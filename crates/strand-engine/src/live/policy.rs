use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use strand_core::errors::{AgentError, FaultClass, LiveError};

/// Backoff and attempt limits for reconnecting a dropped live connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnect attempts allowed after the initial connect, counted since
    /// the last connection that delivered anything.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based): exponential
    /// backoff capped at `max_delay_ms`, then jittered by ±`jitter_factor`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = exp.min(self.max_delay_ms as f64);

        let jitter_range = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range >= 1.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// What the coordinator does next after a connection ended.
#[derive(Debug)]
pub(crate) enum Recovery {
    /// Reconnect, keeping the current resumption handle.
    Resume { attempt: u32, delay: Duration },
    /// Drop the handle and reconnect once without it.
    Fresh,
    GiveUp(AgentError),
}

/// Tracks reconnect attempts across one live invocation.
#[derive(Debug)]
pub(crate) struct ReconnectBudget {
    policy: ReconnectPolicy,
    attempts: u32,
    fresh_used: bool,
}

impl ReconnectBudget {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            fresh_used: false,
        }
    }

    /// A connection delivered data, so earlier failures no longer count.
    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
        self.fresh_used = false;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn on_fault(&mut self, fault: LiveError, has_handle: bool) -> Recovery {
        match fault.fault_class() {
            FaultClass::Fatal => Recovery::GiveUp(AgentError::Live(fault)),
            FaultClass::HandleInvalid => {
                if !has_handle || self.fresh_used {
                    warn!(error = %fault, "resumption rejected without a usable handle");
                    Recovery::GiveUp(AgentError::Live(fault))
                } else {
                    self.fresh_used = true;
                    Recovery::Fresh
                }
            }
            FaultClass::Retryable => self.next_attempt(fault, true),
        }
    }

    /// The peer closed cleanly and the session can be resumed.
    pub(crate) fn on_expected_close(&mut self) -> Recovery {
        self.next_attempt(
            LiveError::ConnectionReset("inbound stream closed by peer".into()),
            false,
        )
    }

    fn next_attempt(&mut self, last: LiveError, backoff: bool) -> Recovery {
        if self.attempts >= self.policy.max_attempts {
            return Recovery::GiveUp(AgentError::ReconnectExhausted {
                attempts: self.attempts,
                last,
            });
        }
        let delay = if backoff {
            self.policy.delay(self.attempts)
        } else {
            Duration::ZERO
        };
        self.attempts += 1;
        Recovery::Resume {
            attempt: self.attempts,
            delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn delay_exponential_backoff() {
        let policy = no_jitter();
        assert_eq!(policy.delay(0).as_millis(), 100);
        assert_eq!(policy.delay(1).as_millis(), 200);
        assert_eq!(policy.delay(2).as_millis(), 400);
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = no_jitter();
        assert_eq!(policy.delay(10).as_millis(), 1_000);
        assert_eq!(policy.delay(u32::MAX).as_millis(), 1_000);
    }

    #[test]
    fn delay_jitter_stays_in_range() {
        let policy = ReconnectPolicy {
            jitter_factor: 0.5,
            ..no_jitter()
        };
        for _ in 0..50 {
            let ms = policy.delay(1).as_millis();
            assert!((100..=300).contains(&ms), "got {ms}");
        }
    }

    #[test]
    fn fatal_gives_up_immediately() {
        let mut budget = ReconnectBudget::new(no_jitter());
        let recovery = budget.on_fault(LiveError::AuthenticationFailed("k".into()), true);
        assert!(matches!(recovery, Recovery::GiveUp(AgentError::Live(_))));
        assert_eq!(budget.attempts(), 0);
    }

    #[test]
    fn retryable_until_exhausted() {
        let mut budget = ReconnectBudget::new(no_jitter());
        for expected in 1..=3 {
            match budget.on_fault(LiveError::Network("down".into()), true) {
                Recovery::Resume { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
        let recovery = budget.on_fault(LiveError::Network("down".into()), true);
        assert!(matches!(
            recovery,
            Recovery::GiveUp(AgentError::ReconnectExhausted { attempts: 3, .. })
        ));
    }

    #[test]
    fn handle_invalid_retries_fresh_once() {
        let mut budget = ReconnectBudget::new(no_jitter());
        let rejected = || LiveError::ResumptionRejected("stale".into());
        assert!(matches!(budget.on_fault(rejected(), true), Recovery::Fresh));
        assert!(matches!(budget.on_fault(rejected(), true), Recovery::GiveUp(_)));
    }

    #[test]
    fn handle_invalid_without_handle_gives_up() {
        let mut budget = ReconnectBudget::new(no_jitter());
        let recovery = budget.on_fault(LiveError::ResumptionRejected("stale".into()), false);
        assert!(matches!(recovery, Recovery::GiveUp(_)));
    }

    #[test]
    fn reset_restores_budget() {
        let mut budget = ReconnectBudget::new(no_jitter());
        for _ in 0..3 {
            budget.on_fault(LiveError::Network("down".into()), true);
        }
        budget.reset();
        assert!(matches!(
            budget.on_fault(LiveError::Network("down".into()), true),
            Recovery::Resume { attempt: 1, .. }
        ));
    }

    #[test]
    fn expected_close_resumes_without_delay() {
        let mut budget = ReconnectBudget::new(no_jitter());
        match budget.on_expected_close() {
            Recovery::Resume { delay, .. } => assert_eq!(delay, Duration::ZERO),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn policy_defaults_from_json() {
        let policy: ReconnectPolicy = serde_json::from_str(r#"{"max_attempts": 2}"#).unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay_ms, 500);
        assert_eq!(policy.max_delay_ms, 30_000);
    }
}
