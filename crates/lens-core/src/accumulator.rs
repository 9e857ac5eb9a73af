use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::outcome::{ErrorKind, MetricsKey, OutcomeStatus, RequestOutcome};
use crate::timing::TimingBreakdown;

/// Price per thousand tokens, in whatever currency the profile uses.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Pricing {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 / 1000.0 * self.input_per_1k
            + output_tokens as f64 / 1000.0 * self.output_per_1k
    }
}

/// Per-request throughput is stored in milli-tokens per second so the
/// histogram keeps three decimal places.
const THROUGHPUT_SCALE: f64 = 1000.0;

fn new_histogram() -> Histogram<u64> {
    Histogram::<u64>::new(3).expect("3 sigfigs is always valid")
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Running statistics for one [`MetricsKey`].
#[derive(Debug)]
struct KeyAccumulator {
    total: u64,
    success: u64,
    failed: u64,
    cancelled: u64,
    total_attempts: u64,
    retries: u64,
    ttft: Histogram<u64>,
    duration: Histogram<u64>,
    inter_token: Histogram<u64>,
    throughput: Histogram<u64>,
    input_tokens: u64,
    output_tokens: u64,
    cost: f64,
    errors: BTreeMap<ErrorKind, u64>,
    attempt_errors: BTreeMap<ErrorKind, u64>,
}

impl KeyAccumulator {
    fn new() -> Self {
        Self {
            total: 0,
            success: 0,
            failed: 0,
            cancelled: 0,
            total_attempts: 0,
            retries: 0,
            ttft: new_histogram(),
            duration: new_histogram(),
            inter_token: new_histogram(),
            throughput: new_histogram(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            errors: BTreeMap::new(),
            attempt_errors: BTreeMap::new(),
        }
    }

    fn record(&mut self, outcome: &RequestOutcome, pricing: Option<&Pricing>) {
        if !outcome.is_final() {
            if let Some(kind) = outcome.error_kind() {
                *self.attempt_errors.entry(kind).or_insert(0) += 1;
            }
            return;
        }

        self.total += 1;
        self.total_attempts += outcome.attempts as u64;
        self.retries += outcome.attempts.saturating_sub(1) as u64;
        match outcome.status() {
            OutcomeStatus::Success => {
                self.success += 1;
                if let Some(timing) = outcome.timing() {
                    self.record_timing(timing, outcome.tokens.output);
                }
                self.input_tokens += outcome.tokens.input;
                self.output_tokens += outcome.tokens.output;
                if let Some(pricing) = pricing {
                    self.cost += pricing.cost(outcome.tokens.input, outcome.tokens.output);
                }
            }
            OutcomeStatus::Failed(kind) => {
                self.failed += 1;
                *self.errors.entry(kind).or_insert(0) += 1;
            }
            OutcomeStatus::Cancelled => self.cancelled += 1,
        }
    }

    fn record_timing(&mut self, timing: &TimingBreakdown, output_tokens: u64) {
        let total = timing.total_duration();
        self.duration.saturating_record(nanos(total));
        if let Some(ttft) = timing.ttft() {
            self.ttft.saturating_record(nanos(ttft));
        }
        for gap in timing.inter_token_latencies() {
            self.inter_token.saturating_record(nanos(gap));
        }
        if output_tokens > 0 && !total.is_zero() {
            let per_second = output_tokens as f64 / total.as_secs_f64();
            self.throughput
                .saturating_record((per_second * THROUGHPUT_SCALE).round() as u64);
        }
    }

    fn summarize(&self, key: &MetricsKey, elapsed: Duration, priced: bool) -> AggregatedMetrics {
        let wall = elapsed.as_secs_f64();
        let per_wall_second = |count: u64| (wall > 0.0).then(|| count as f64 / wall);

        AggregatedMetrics {
            key: key.clone(),
            total_requests: self.total,
            successful_requests: self.success,
            failed_requests: self.failed,
            cancelled_requests: self.cancelled,
            total_attempts: self.total_attempts,
            retries: self.retries,
            success_rate: (self.total > 0).then(|| self.success as f64 / self.total as f64),
            ttft: LatencySummary::from_histogram(&self.ttft),
            total_duration: LatencySummary::from_histogram(&self.duration),
            inter_token_latency: LatencySummary::from_histogram(&self.inter_token),
            request_throughput: ThroughputSummary::from_histogram(&self.throughput),
            output_tokens_per_second: per_wall_second(self.output_tokens),
            requests_per_second: per_wall_second(self.success),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_cost: priced.then_some(self.cost),
            errors: self.errors.clone(),
            attempt_errors: self.attempt_errors.clone(),
        }
    }
}

/// Thread-safe store of running statistics, sharded by [`MetricsKey`].
///
/// The outer map is only write-locked the first time a key is seen; after that
/// every `record` takes a read lock on the map and the key's own mutex, so
/// contention is per key.
#[derive(Debug, Default)]
pub struct MetricsAccumulator {
    shards: RwLock<HashMap<MetricsKey, Arc<Mutex<KeyAccumulator>>>>,
    pricing: HashMap<String, Pricing>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach per-target pricing for cost tracking.
    pub fn with_pricing<I, K>(mut self, pricing: I) -> Self
    where
        I: IntoIterator<Item = (K, Pricing)>,
        K: Into<String>,
    {
        self.pricing
            .extend(pricing.into_iter().map(|(k, p)| (k.into(), p)));
        self
    }

    /// Fold one outcome into its key's statistics.
    ///
    /// Attempt-level outcomes only feed the per-attempt error table; counters,
    /// histograms and sums are driven by final outcomes.
    pub fn record(&self, outcome: &RequestOutcome) {
        let shard = self.shard(&outcome.key);
        let pricing = self.pricing.get(&outcome.key.target);
        shard.lock().record(outcome, pricing);
    }

    /// Number of keys seen so far.
    pub fn key_count(&self) -> usize {
        self.shards.read().len()
    }

    /// Consume the accumulator into immutable per-key summaries. Rates are
    /// computed against `elapsed`, the run's wall time.
    pub fn finalize(self, elapsed: Duration) -> BTreeMap<MetricsKey, AggregatedMetrics> {
        let shards = self.shards.into_inner();
        shards
            .into_iter()
            .map(|(key, shard)| {
                let priced = self.pricing.contains_key(&key.target);
                let metrics = shard.lock().summarize(&key, elapsed, priced);
                (key, metrics)
            })
            .collect()
    }

    fn shard(&self, key: &MetricsKey) -> Arc<Mutex<KeyAccumulator>> {
        if let Some(shard) = self.shards.read().get(key) {
            return Arc::clone(shard);
        }
        let mut shards = self.shards.write();
        Arc::clone(
            shards
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(KeyAccumulator::new()))),
        )
    }
}

/// Distribution of one latency series. Absent (`None` at the use site) when
/// the series recorded nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    #[serde(with = "duration_nanos")]
    pub min: Duration,
    #[serde(with = "duration_nanos")]
    pub max: Duration,
    #[serde(with = "duration_nanos")]
    pub mean: Duration,
    #[serde(with = "duration_nanos")]
    pub stddev: Duration,
    #[serde(with = "duration_nanos")]
    pub p50: Duration,
    #[serde(with = "duration_nanos")]
    pub p75: Duration,
    #[serde(with = "duration_nanos")]
    pub p90: Duration,
    #[serde(with = "duration_nanos")]
    pub p95: Duration,
    #[serde(with = "duration_nanos")]
    pub p99: Duration,
    #[serde(with = "duration_nanos")]
    pub p999: Duration,
}

impl LatencySummary {
    fn from_histogram(hist: &Histogram<u64>) -> Option<Self> {
        if hist.is_empty() {
            return None;
        }
        let at = |q: f64| Duration::from_nanos(hist.value_at_quantile(q));
        Some(Self {
            count: hist.len(),
            min: Duration::from_nanos(hist.min()),
            max: Duration::from_nanos(hist.max()),
            mean: Duration::from_nanos(hist.mean().round() as u64),
            stddev: Duration::from_nanos(hist.stdev().round() as u64),
            p50: at(0.50),
            p75: at(0.75),
            p90: at(0.90),
            p95: at(0.95),
            p99: at(0.99),
            p999: at(0.999),
        })
    }
}

/// Per-request output throughput, in tokens per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p99: f64,
}

impl ThroughputSummary {
    fn from_histogram(hist: &Histogram<u64>) -> Option<Self> {
        if hist.is_empty() {
            return None;
        }
        let scaled = |v: u64| v as f64 / THROUGHPUT_SCALE;
        Some(Self {
            count: hist.len(),
            min: scaled(hist.min()),
            max: scaled(hist.max()),
            mean: hist.mean() / THROUGHPUT_SCALE,
            p50: scaled(hist.value_at_quantile(0.50)),
            p99: scaled(hist.value_at_quantile(0.99)),
        })
    }
}

/// Immutable summary for one key, produced once by
/// [`MetricsAccumulator::finalize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub key: MetricsKey,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cancelled_requests: u64,
    /// Attempts across all requests, retries included
    pub total_attempts: u64,
    /// Attempts beyond the first, summed over final outcomes
    pub retries: u64,
    pub success_rate: Option<f64>,
    pub ttft: Option<LatencySummary>,
    pub total_duration: Option<LatencySummary>,
    pub inter_token_latency: Option<LatencySummary>,
    pub request_throughput: Option<ThroughputSummary>,
    /// Completed output tokens over the run's wall time
    pub output_tokens_per_second: Option<f64>,
    pub requests_per_second: Option<f64>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: Option<f64>,
    /// Final dispositions by error kind
    pub errors: BTreeMap<ErrorKind, u64>,
    /// Every failed attempt by error kind, including ones a retry recovered
    pub attempt_errors: BTreeMap<ErrorKind, u64>,
}

impl AggregatedMetrics {
    /// Number of samples in the total-duration series.
    pub fn duration_samples(&self) -> u64 {
        self.total_duration.as_ref().map_or(0, |s| s.count)
    }
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::TokenCounts;
    use crate::timer::PrecisionTimer;
    use crate::timing::TimingBuilder;
    use tokio::time::advance;

    async fn streamed_timing(ttft_ms: u64, gaps_ms: &[u64]) -> TimingBreakdown {
        let mut builder = TimingBuilder::start();
        advance(Duration::from_millis(ttft_ms)).await;
        builder.record_unit();
        for gap in gaps_ms {
            advance(Duration::from_millis(*gap)).await;
            builder.record_unit();
        }
        builder.finish()
    }

    fn success(id: u64, key: &MetricsKey, timing: TimingBreakdown, output: u64) -> RequestOutcome {
        RequestOutcome::success(id, key.clone(), timing, TokenCounts::new(10, output), 1)
            .into_final()
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_feeds_all_series() {
        let key = MetricsKey::new("t", "s");
        let acc = MetricsAccumulator::new();
        let timing = streamed_timing(100, &[10, 10, 10]).await;
        acc.record(&success(1, &key, timing, 4));

        let metrics = acc.finalize(Duration::from_secs(1));
        let m = &metrics[&key];
        assert_eq!(m.total_requests, 1);
        assert_eq!(m.successful_requests, 1);
        assert_eq!(m.duration_samples(), 1);
        assert_eq!(m.inter_token_latency.as_ref().unwrap().count, 3);
        let ttft = m.ttft.as_ref().unwrap();
        assert!(ttft.p50 >= Duration::from_micros(99_900));
        assert!(ttft.p50 <= Duration::from_micros(100_100));
        assert_eq!(m.output_tokens_per_second, Some(4.0));
        assert_eq!(m.success_rate, Some(1.0));
        assert_eq!(m.total_cost, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_streamed_success_has_no_ttft() {
        let key = MetricsKey::new("t", "s");
        let acc = MetricsAccumulator::new();
        let builder = TimingBuilder::start();
        advance(Duration::from_millis(300)).await;
        acc.record(&success(1, &key, builder.finish(), 20));

        let metrics = acc.finalize(Duration::from_secs(1));
        let m = &metrics[&key];
        assert!(m.ttft.is_none());
        assert!(m.inter_token_latency.is_none());
        assert_eq!(m.duration_samples(), 1);
    }

    #[test]
    fn test_failures_and_attempt_errors() {
        let key = MetricsKey::new("t", "s");
        let acc = MetricsAccumulator::new();
        for attempt in 1..=3 {
            acc.record(&RequestOutcome::failed(1, key.clone(), ErrorKind::ServerError, attempt));
        }
        acc.record(&RequestOutcome::failed(1, key.clone(), ErrorKind::ServerError, 3).into_final());
        acc.record(&RequestOutcome::cancelled(2, key.clone(), 0));
        // Cut off by the deadline during its first attempt
        acc.record(&RequestOutcome::cancelled(3, key.clone(), 1));

        let metrics = acc.finalize(Duration::from_secs(1));
        let m = &metrics[&key];
        assert_eq!(m.total_requests, 3);
        assert_eq!(m.failed_requests, 1);
        assert_eq!(m.cancelled_requests, 2);
        assert_eq!(m.total_attempts, 4);
        assert_eq!(m.retries, 2);
        assert_eq!(m.errors.get(&ErrorKind::ServerError), Some(&1));
        assert_eq!(m.attempt_errors.get(&ErrorKind::ServerError), Some(&3));
        assert!(m.total_duration.is_none());
        assert!(m.ttft.is_none());
        assert_eq!(m.success_rate, Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_tracking() {
        let key = MetricsKey::new("priced", "s");
        let acc = MetricsAccumulator::new().with_pricing([(
            "priced",
            Pricing {
                input_per_1k: 1.0,
                output_per_1k: 2.0,
            },
        )]);
        let timing = TimingBuilder::start().finish();
        acc.record(
            &RequestOutcome::success(1, key.clone(), timing, TokenCounts::new(500, 1000), 1)
                .into_final(),
        );

        let metrics = acc.finalize(Duration::from_secs(1));
        let cost = metrics[&key].total_cost.unwrap();
        assert!((cost - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_run_has_no_rates() {
        let key = MetricsKey::new("t", "s");
        let acc = MetricsAccumulator::new();
        acc.record(&RequestOutcome::cancelled(1, key.clone(), 0));

        let metrics = acc.finalize(Duration::ZERO);
        let m = &metrics[&key];
        assert_eq!(m.output_tokens_per_second, None);
        assert_eq!(m.requests_per_second, None);
        assert!(m.request_throughput.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_record() {
        let acc = Arc::new(MetricsAccumulator::new());
        let keys: Vec<_> = (0..4).map(|i| MetricsKey::new(format!("t{i}"), "s")).collect();
        let start = PrecisionTimer::now();
        advance(Duration::from_millis(5)).await;
        let timing = TimingBuilder::start_at(start).finish();

        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let acc = Arc::clone(&acc);
            let keys = keys.clone();
            let timing = timing.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..250u64 {
                    let key = &keys[(i % 4) as usize];
                    let id = worker * 1000 + i;
                    acc.record(&success(id, key, timing.clone(), 1));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let acc = Arc::try_unwrap(acc).unwrap();
        assert_eq!(acc.key_count(), 4);
        let metrics = acc.finalize(Duration::from_secs(1));
        for key in &keys {
            let m = &metrics[key];
            assert_eq!(m.total_requests, 500);
            assert_eq!(m.successful_requests, 500);
            assert_eq!(m.duration_samples(), 500);
        }
    }

    #[test]
    fn test_summary_serializes_nanos() {
        let mut hist = new_histogram();
        hist.saturating_record(1_500);
        let summary = LatencySummary::from_histogram(&hist).unwrap();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["count"], 1);
        assert_eq!(json["min"], 1_500);
        let back: LatencySummary = serde_json::from_value(json).unwrap();
        assert_eq!(back, summary);
    }
}
