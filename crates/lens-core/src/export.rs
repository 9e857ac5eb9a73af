use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::accumulator::AggregatedMetrics;
use crate::outcome::{MetricsKey, RequestOutcome};

/// Live observer of outcomes as the run records them. Called on the collector
/// task, so implementations should return quickly.
pub trait OutcomeSink: Send + Sync {
    fn on_outcome(&self, outcome: &RequestOutcome);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutcomeSink for NullSink {
    fn on_outcome(&self, _outcome: &RequestOutcome) {}
}

/// Receives the finished run.
pub trait Exporter {
    fn export(&self, report: &RunReport) -> Result<()>;
}

/// Everything a run produced, ordered by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub max_concurrency: usize,
    pub peak_concurrency: usize,
    pub deadline_hit: bool,
    pub metrics: Vec<AggregatedMetrics>,
    /// Anything that degraded the run's bookkeeping
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn new(
        started_at: DateTime<Utc>,
        elapsed: Duration,
        max_concurrency: usize,
        peak_concurrency: usize,
        deadline_hit: bool,
        metrics: BTreeMap<MetricsKey, AggregatedMetrics>,
    ) -> Self {
        Self {
            started_at,
            elapsed_ms: elapsed.as_millis() as u64,
            max_concurrency,
            peak_concurrency,
            deadline_hit,
            metrics: metrics.into_values().collect(),
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn get(&self, key: &MetricsKey) -> Option<&AggregatedMetrics> {
        self.metrics.iter().find(|m| &m.key == key)
    }

    pub fn total_requests(&self) -> u64 {
        self.metrics.iter().map(|m| m.total_requests).sum()
    }

    pub fn successful_requests(&self) -> u64 {
        self.metrics.iter().map(|m| m.successful_requests).sum()
    }

    pub fn failed_requests(&self) -> u64 {
        self.metrics.iter().map(|m| m.failed_requests).sum()
    }

    pub fn cancelled_requests(&self) -> u64 {
        self.metrics.iter().map(|m| m.cancelled_requests).sum()
    }
}
