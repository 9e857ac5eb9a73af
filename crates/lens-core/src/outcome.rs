use serde::{Deserialize, Serialize};
use std::fmt;

use crate::timing::TimingBreakdown;

/// Partition key for accumulated statistics: one target under one scenario.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricsKey {
    pub target: String,
    pub scenario: String,
}

impl MetricsKey {
    pub fn new(target: impl Into<String>, scenario: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            scenario: scenario.into(),
        }
    }
}

impl fmt::Display for MetricsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target, self.scenario)
    }
}

/// Error classification reported by a provider adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Timeout,
    ServerError,
    NetworkError,
    AuthError,
    ClientError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::RateLimited,
        ErrorKind::Timeout,
        ErrorKind::ServerError,
        ErrorKind::NetworkError,
        ErrorKind::AuthError,
        ErrorKind::ClientError,
    ];

    /// Transient failures worth another attempt. Auth and malformed-request
    /// errors are terminal.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Timeout
                | ErrorKind::ServerError
                | ErrorKind::NetworkError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServerError => "server_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::ClientError => "client_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counts reported by the adapter. Opaque to the engine apart from sums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
}

impl TokenCounts {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Failed(ErrorKind),
    Cancelled,
}

/// Whether an outcome describes a single attempt or the final disposition of
/// a logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeScope {
    Attempt,
    Final,
}

pub type RequestId = u64;

/// Result of one request attempt, or the final disposition of a request.
///
/// A successful outcome always carries its [`TimingBreakdown`]; failed and
/// cancelled outcomes never do, so latency series only ever see completed work.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub id: RequestId,
    pub key: MetricsKey,
    pub scope: OutcomeScope,
    pub tokens: TokenCounts,
    pub attempts: u32,
    status: OutcomeStatus,
    timing: Option<TimingBreakdown>,
}

impl RequestOutcome {
    pub fn success(
        id: RequestId,
        key: MetricsKey,
        timing: TimingBreakdown,
        tokens: TokenCounts,
        attempts: u32,
    ) -> Self {
        Self {
            id,
            key,
            scope: OutcomeScope::Attempt,
            tokens,
            attempts,
            status: OutcomeStatus::Success,
            timing: Some(timing),
        }
    }

    pub fn failed(id: RequestId, key: MetricsKey, kind: ErrorKind, attempts: u32) -> Self {
        Self {
            id,
            key,
            scope: OutcomeScope::Attempt,
            tokens: TokenCounts::default(),
            attempts,
            status: OutcomeStatus::Failed(kind),
            timing: None,
        }
    }

    /// Cancellation is always a final disposition.
    pub fn cancelled(id: RequestId, key: MetricsKey, attempts: u32) -> Self {
        Self {
            id,
            key,
            scope: OutcomeScope::Final,
            tokens: TokenCounts::default(),
            attempts,
            status: OutcomeStatus::Cancelled,
            timing: None,
        }
    }

    /// Promote an attempt outcome to the request's final disposition.
    pub fn into_final(mut self) -> Self {
        self.scope = OutcomeScope::Final;
        self
    }

    pub fn status(&self) -> OutcomeStatus {
        self.status
    }

    pub fn timing(&self) -> Option<&TimingBreakdown> {
        self.timing.as_ref()
    }

    pub fn is_final(&self) -> bool {
        self.scope == OutcomeScope::Final
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.status {
            OutcomeStatus::Failed(kind) => Some(kind),
            _ => None,
        }
    }
}
