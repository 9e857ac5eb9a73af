use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::accumulator::Pricing;
use crate::adapter::{ProviderRequest, Target};
use crate::orchestrator::{RunPlan, RunSettings, Workload, WorkloadEntry};
use crate::rate_limiter::RateLimit;
use crate::retry::RetryPolicy;

/// Semantic problems in an otherwise well-formed profile.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("No targets configured")]
    NoTargets,
    #[error("Workload is empty: no scenario has iterations against any target")]
    EmptyWorkload,
    #[error("Duplicate target name: {0}")]
    DuplicateTarget(String),
    #[error("Duplicate scenario name: {0}")]
    DuplicateScenario(String),
    #[error("Scenario {scenario} references unknown target {target}")]
    UnknownTarget { scenario: String, target: String },
    #[error("Target {target} has invalid rate limit: rps must be positive, got {rps}")]
    InvalidRate { target: String, rps: f64 },
    #[error("Invalid retry settings: {0}")]
    InvalidRetry(String),
}

/// Top-level profile, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub targets: Vec<TargetConfig>,
    pub scenarios: Vec<ScenarioConfig>,
}

impl ProfileConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile {}", path.display()))?;
        let config: ProfileConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse profile {}", path.display()))?;
        Ok(config)
    }

    /// Check the profile and turn it into a typed run plan.
    pub fn validate(&self) -> Result<RunPlan, ConfigError> {
        if self.run.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }

        let mut names = HashSet::new();
        for target in &self.targets {
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.name.clone()));
            }
        }
        let mut scenario_names = HashSet::new();
        for scenario in &self.scenarios {
            if !scenario_names.insert(scenario.name.as_str()) {
                return Err(ConfigError::DuplicateScenario(scenario.name.clone()));
            }
            if let Some(unknown) = scenario.targets.iter().find(|t| !names.contains(t.as_str())) {
                return Err(ConfigError::UnknownTarget {
                    scenario: scenario.name.clone(),
                    target: unknown.clone(),
                });
            }
        }

        let retry = self.retry.to_policy()?;

        let mut rate_limits = Vec::new();
        let mut pricing = Vec::new();
        for target in &self.targets {
            if let Some(limit) = &target.rate_limit {
                if !(limit.rps.is_finite() && limit.rps > 0.0) {
                    return Err(ConfigError::InvalidRate {
                        target: target.name.clone(),
                        rps: limit.rps,
                    });
                }
                rate_limits.push((target.name.clone(), limit.to_rate_limit()));
            }
            if let Some(p) = target.pricing {
                pricing.push((target.name.clone(), p));
            }
        }

        let targets: Vec<_> = self.targets.iter().map(TargetConfig::to_target).collect();
        let mut entries = Vec::new();
        for scenario in &self.scenarios {
            let request = ProviderRequest {
                scenario: scenario.name.clone(),
                prompt: scenario.prompt.clone(),
                max_tokens: scenario.max_tokens,
            };
            for target in &targets {
                if scenario.applies_to(&target.name) && scenario.iterations > 0 {
                    entries.push(WorkloadEntry::new(
                        target.clone(),
                        request.clone(),
                        scenario.iterations,
                    ));
                }
            }
        }
        let workload = Workload::new(entries);
        if workload.is_empty() {
            return Err(ConfigError::EmptyWorkload);
        }

        let settings = RunSettings {
            max_concurrency: self.run.max_concurrency,
            workers: self.run.workers.unwrap_or(self.run.max_concurrency).max(1),
            queue_capacity: self.run.queue_capacity.max(1),
            deadline: self.run.deadline_ms.map(Duration::from_millis),
            progress_every: self
                .run
                .progress_every_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        };

        Ok(RunPlan {
            settings,
            retry,
            rate_limits,
            pricing,
            workload,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum requests in flight at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Worker tasks per target; defaults to max_concurrency
    #[serde(default)]
    pub workers: Option<usize>,
    /// Bound of each target's work queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Optional run deadline in milliseconds
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Progress log interval in milliseconds
    #[serde(default)]
    pub progress_every_ms: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            workers: None,
            queue_capacity: default_queue_capacity(),
            deadline_ms: None,
            progress_every_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempt ceiling, first attempt included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter as a fraction of the delay
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryConfig {
    fn to_policy(&self) -> Result<RetryPolicy, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRetry(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::InvalidRetry(format!(
                "max_backoff_ms ({}) is below initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            )));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ConfigError::InvalidRetry(format!(
                "multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::InvalidRetry(format!(
                "jitter_ratio must be within [0, 1], got {}",
                self.jitter_ratio
            )));
        }

        Ok(RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.multiplier,
        )
        .with_jitter_ratio(self.jitter_ratio))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub pricing: Option<Pricing>,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl TargetConfig {
    fn to_target(&self) -> Target {
        Target {
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            streaming: self.streaming,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained requests per second
    pub rps: f64,
    /// Bucket capacity; defaults to one second's worth of requests
    #[serde(default)]
    pub burst: Option<u32>,
}

impl RateLimitConfig {
    fn to_rate_limit(&self) -> RateLimit {
        let burst = self.burst.unwrap_or(self.rps.ceil() as u32).max(1);
        RateLimit::new(self.rps, burst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Requests per target
    pub iterations: u32,
    /// Restrict the scenario to these targets; empty means all
    #[serde(default)]
    pub targets: Vec<String>,
}

impl ScenarioConfig {
    fn applies_to(&self, target: &str) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|t| t == target)
    }
}

fn default_max_concurrency() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_streaming() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_max_tokens() -> u32 {
    256
}
