use rand::Rng;
use std::time::Duration;

use crate::outcome::ErrorKind;

/// How a failed attempt is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Terminal,
}

impl From<ErrorKind> for Classification {
    fn from(kind: ErrorKind) -> Self {
        if kind.is_retryable() {
            Classification::Retryable
        } else {
            Classification::Terminal
        }
    }
}

/// Retry parameters: attempt ceiling and exponential backoff with jitter.
///
/// `delay(n) = min(max_backoff, initial_backoff * multiplier^n) + jitter`, where
/// `n` counts retries already taken (0 before the first retry) and jitter is
/// uniform over `[0, delay * jitter_ratio]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
            multiplier: multiplier.max(1.0),
            ..Self::default()
        }
    }

    /// Single attempt, never retried.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn classify(&self, kind: ErrorKind) -> Classification {
        kind.into()
    }

    /// Backoff before retry number `retry` (0-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let scaled = self.initial_backoff.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Backoff with jitter taken from `unit`, a sample in `[0, 1)`.
    pub fn backoff_with(&self, retry: u32, unit: f64) -> Duration {
        let base = self.base_delay(retry);
        let jitter = base.mul_f64(self.jitter_ratio * unit.clamp(0.0, 1.0));
        base + jitter
    }

    /// Backoff with random jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let unit: f64 = rand::thread_rng().gen();
        self.backoff_with(retry, unit)
    }
}

/// Position of a logical request in the retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Pending,
    Executing { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Failed { attempts: u32, kind: ErrorKind },
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Succeeded { .. } | RetryState::Failed { .. })
    }
}

/// Drives one logical request through
/// `Pending -> Executing -> {Succeeded | Backoff -> Executing | Failed}`.
///
/// Pure bookkeeping: it decides, the caller sleeps and re-executes. The jitter
/// source is injectable so tests can pin delays.
#[derive(Debug)]
pub struct RetryTracker<'p> {
    policy: &'p RetryPolicy,
    state: RetryState,
    jitter: fn() -> f64,
}

impl<'p> RetryTracker<'p> {
    pub fn new(policy: &'p RetryPolicy) -> Self {
        Self::with_jitter(policy, || rand::thread_rng().gen())
    }

    pub fn with_jitter(policy: &'p RetryPolicy, jitter: fn() -> f64) -> Self {
        Self {
            policy,
            state: RetryState::Pending,
            jitter,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        match self.state {
            RetryState::Pending => 0,
            RetryState::Executing { attempt } | RetryState::Backoff { attempt, .. } => attempt,
            RetryState::Succeeded { attempts } | RetryState::Failed { attempts, .. } => attempts,
        }
    }

    /// Enter `Executing`, returning the 1-based attempt number. `None` once the
    /// request has reached a terminal state.
    pub fn begin_attempt(&mut self) -> Option<u32> {
        let attempt = match self.state {
            RetryState::Pending => 1,
            RetryState::Backoff { attempt, .. } => attempt + 1,
            RetryState::Executing { attempt } => attempt,
            RetryState::Succeeded { .. } | RetryState::Failed { .. } => return None,
        };
        self.state = RetryState::Executing { attempt };
        Some(attempt)
    }

    pub fn on_success(&mut self) -> RetryState {
        self.state = RetryState::Succeeded {
            attempts: self.attempts(),
        };
        self.state
    }

    /// Classify a failed attempt: back off for another try, or fail for good.
    pub fn on_failure(&mut self, kind: ErrorKind) -> RetryState {
        let attempt = self.attempts().max(1);
        self.state = match self.policy.classify(kind) {
            Classification::Retryable if attempt < self.policy.max_attempts => {
                let delay = self.policy.backoff_with(attempt - 1, (self.jitter)());
                RetryState::Backoff { attempt, delay }
            }
            _ => RetryState::Failed {
                attempts: attempt,
                kind,
            },
        };
        self.state
    }
}
