use lens_core::{
    ErrorKind, MetricsKey, MockAdapter, MockBehavior, Orchestrator, OutcomeSink, ProviderRequest,
    RateLimit, RequestOutcome, RetryPolicy, RunPlan, RunReport, RunSettings, Target, Workload,
    WorkloadEntry,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn target(name: &str, streaming: bool) -> Target {
    Target {
        name: name.to_string(),
        endpoint: format!("http://{name}.invalid/v1/chat/completions"),
        model: "mock".to_string(),
        streaming,
        timeout: Duration::from_secs(30),
    }
}

fn scenario(name: &str) -> ProviderRequest {
    ProviderRequest {
        scenario: name.to_string(),
        prompt: format!("prompt for {name}"),
        max_tokens: 32,
    }
}

fn matrix(targets: &[Target], scenarios: &[&str], iterations: u32) -> Workload {
    let mut entries = Vec::new();
    for s in scenarios {
        for t in targets {
            entries.push(WorkloadEntry::new(t.clone(), scenario(s), iterations));
        }
    }
    Workload::new(entries)
}

fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(10),
        Duration::from_millis(50),
        2.0,
    )
}

fn assert_totals(report: &RunReport) {
    for m in &report.metrics {
        assert_eq!(
            m.total_requests,
            m.successful_requests + m.failed_requests + m.cancelled_requests,
            "totals mismatch for {}",
            m.key
        );
        assert_eq!(m.duration_samples(), m.successful_requests);
    }
}

#[derive(Default)]
struct CountingSink {
    attempts: AtomicU64,
    finals: AtomicU64,
}

impl OutcomeSink for CountingSink {
    fn on_outcome(&self, outcome: &RequestOutcome) {
        if outcome.is_final() {
            self.finals.fetch_add(1, Ordering::Relaxed);
        } else {
            self.attempts.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_failing_target_does_not_abort_run() {
    let targets = [target("alpha", true), target("beta", true), target("down", true)];
    let mut plan = RunPlan::new(matrix(&targets, &["short", "long"], 50));
    plan.settings = RunSettings::default().with_max_concurrency(10);
    plan.retry = fast_retries(3);

    let adapter = Arc::new(
        MockAdapter::new(MockBehavior::streaming(
            8,
            Duration::from_millis(30),
            Duration::from_millis(5),
        ))
        .with_target("down", MockBehavior::always_failing(ErrorKind::ServerError)),
    );
    let sink = Arc::new(CountingSink::default());
    let orchestrator =
        Orchestrator::new(adapter.clone(), &plan).with_sink(sink.clone());

    let report = orchestrator.run(&plan.workload).await;

    assert_eq!(report.metrics.len(), 6);
    assert_eq!(report.total_requests(), 300);
    for s in ["short", "long"] {
        for t in ["alpha", "beta"] {
            let m = report.get(&MetricsKey::new(t, s)).unwrap();
            assert_eq!(m.successful_requests, 50);
            assert_eq!(m.failed_requests, 0);
            assert_eq!(m.total_attempts, 50);
            assert!(m.ttft.is_some());
        }
        let down = report.get(&MetricsKey::new("down", s)).unwrap();
        assert_eq!(down.successful_requests, 0);
        assert_eq!(down.failed_requests, 50);
        assert_eq!(down.errors.get(&ErrorKind::ServerError), Some(&50));
        assert_eq!(down.total_attempts, 150);
        assert_eq!(down.attempt_errors.get(&ErrorKind::ServerError), Some(&150));
        assert!(down.total_duration.is_none());
    }
    assert_eq!(adapter.calls("down"), 300);
    assert_totals(&report);

    assert!(report.peak_concurrency <= 10);
    assert!(!report.deadline_hit);
    assert_eq!(orchestrator.controller().in_flight(), 0);
    assert_eq!(orchestrator.controller().available(), 10);

    assert_eq!(sink.finals.load(Ordering::Relaxed), 300);
    // 200 successful attempts plus 300 failed ones against "down"
    assert_eq!(sink.attempts.load(Ordering::Relaxed), 500);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_cancels_outstanding_work() {
    let targets = [target("quick", true), target("stuck", true)];
    let mut plan = RunPlan::new(matrix(&targets, &["only"], 10));
    plan.settings = RunSettings::default()
        .with_max_concurrency(4)
        .with_deadline(Duration::from_secs(5));
    plan.retry = RetryPolicy::no_retries();

    let adapter = Arc::new(
        MockAdapter::new(MockBehavior::streaming(
            4,
            Duration::from_millis(20),
            Duration::from_millis(10),
        ))
        .with_target(
            "stuck",
            MockBehavior::streaming(10, Duration::from_secs(1), Duration::from_secs(1)),
        ),
    );
    let orchestrator = Orchestrator::new(adapter, &plan);

    let report = orchestrator.run(&plan.workload).await;

    assert!(report.deadline_hit);
    assert_eq!(report.total_requests(), 20);
    assert!(report.successful_requests() > 0);
    assert!(report.cancelled_requests() > 0);
    assert_eq!(report.failed_requests(), 0);
    assert_totals(&report);

    let stuck = report.get(&MetricsKey::new("stuck", "only")).unwrap();
    assert_eq!(stuck.successful_requests, 0);
    assert_eq!(stuck.cancelled_requests, 10);
    // Single-attempt policy: cancelled attempts are not retries
    assert!(stuck.total_attempts > 0);
    for m in &report.metrics {
        assert_eq!(m.retries, 0, "unexpected retries for {}", m.key);
    }

    assert!(report.elapsed_ms >= 5_000);
    assert!(report.elapsed_ms < 6_000);
    assert_eq!(orchestrator.controller().in_flight(), 0);
    assert_eq!(orchestrator.controller().available(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_accounted() {
    let targets = [target("flaky", true)];
    let mut plan = RunPlan::new(matrix(&targets, &["s"], 20));
    plan.settings = RunSettings::default().with_max_concurrency(4);
    plan.retry = fast_retries(3);

    let adapter = Arc::new(MockAdapter::default().with_target(
        "flaky",
        MockBehavior::default().failing_first(ErrorKind::RateLimited, 2),
    ));
    let report = Orchestrator::new(adapter, &plan).run(&plan.workload).await;

    let m = report.get(&MetricsKey::new("flaky", "s")).unwrap();
    assert_eq!(m.successful_requests, 20);
    assert_eq!(m.total_attempts, 22);
    assert_eq!(m.retries, 2);
    assert_eq!(m.attempt_errors.get(&ErrorKind::RateLimited), Some(&2));
    assert!(m.errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_paces_the_run() {
    let targets = [target("limited", true)];
    let mut plan = RunPlan::new(matrix(&targets, &["s"], 20));
    plan.settings = RunSettings::default().with_max_concurrency(8);
    plan.rate_limits = vec![("limited".to_string(), RateLimit::new(10.0, 1))];

    let adapter = Arc::new(MockAdapter::new(MockBehavior::streaming(
        2,
        Duration::from_millis(5),
        Duration::from_millis(5),
    )));
    let report = Orchestrator::new(adapter, &plan).run(&plan.workload).await;

    assert_eq!(report.successful_requests(), 20);
    // One token up front, then one every 100ms
    assert!(report.elapsed_ms >= 1_900, "finished in {}ms", report.elapsed_ms);
}

#[tokio::test(start_paused = true)]
async fn test_non_streaming_target_reports_no_ttft() {
    let targets = [target("batch", false)];
    let plan = RunPlan::new(matrix(&targets, &["s"], 5));
    let adapter = Arc::new(MockAdapter::default());

    let report = Orchestrator::new(adapter, &plan).run(&plan.workload).await;

    let m = report.get(&MetricsKey::new("batch", "s")).unwrap();
    assert_eq!(m.successful_requests, 5);
    assert!(m.ttft.is_none());
    assert!(m.inter_token_latency.is_none());
    assert_eq!(m.duration_samples(), 5);
    assert_eq!(m.output_tokens, 5 * 16);
}

#[tokio::test(start_paused = true)]
async fn test_finalized_report_is_stable() {
    let targets = [target("a", true)];
    let plan = RunPlan::new(matrix(&targets, &["s"], 10));
    let report = Orchestrator::new(Arc::new(MockAdapter::default()), &plan)
        .run(&plan.workload)
        .await;

    let first = serde_json::to_string(&report).unwrap();
    let second = serde_json::to_string(&report).unwrap();
    assert_eq!(first, second);
    assert_eq!(report.clone(), report);
}

/// Records when each final outcome of one target lands.
struct FinishTimes {
    target: String,
    start: Instant,
    at: Mutex<Vec<Duration>>,
}

impl OutcomeSink for FinishTimes {
    fn on_outcome(&self, outcome: &RequestOutcome) {
        if outcome.is_final() && outcome.key.target == self.target {
            self.at.lock().push(self.start.elapsed());
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_target_does_not_pace_others() {
    let targets = [target("a", true), target("b", true)];
    let mut plan = RunPlan::new(matrix(&targets, &["s"], 10));
    plan.settings = RunSettings::default().with_max_concurrency(2);
    plan.rate_limits = vec![("a".to_string(), RateLimit::new(1.0, 1))];

    let adapter = Arc::new(MockAdapter::new(MockBehavior::streaming(
        2,
        Duration::from_millis(5),
        Duration::from_millis(5),
    )));
    let sink = Arc::new(FinishTimes {
        target: "b".to_string(),
        start: Instant::now(),
        at: Mutex::new(Vec::new()),
    });
    let report = Orchestrator::new(adapter, &plan)
        .with_sink(sink.clone())
        .run(&plan.workload)
        .await;

    assert_eq!(report.successful_requests(), 20);
    assert!(report.peak_concurrency <= 2);
    // "a" needs nine more tokens at 1 rps
    assert!(report.elapsed_ms >= 9_000, "finished in {}ms", report.elapsed_ms);

    let finished = sink.at.lock().clone();
    assert_eq!(finished.len(), 10);
    let last = finished.iter().max().copied().unwrap_or_default();
    assert!(last < Duration::from_millis(500), "b finished at {:?}", last);
}

struct PanickingSink {
    seen: AtomicU64,
}

impl OutcomeSink for PanickingSink {
    fn on_outcome(&self, _outcome: &RequestOutcome) {
        if self.seen.fetch_add(1, Ordering::Relaxed) == 2 {
            panic!("sink failure");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_sink_keeps_full_report() {
    let targets = [target("a", true)];
    let plan = RunPlan::new(matrix(&targets, &["s"], 10));
    let sink = Arc::new(PanickingSink {
        seen: AtomicU64::new(0),
    });

    let report = Orchestrator::new(Arc::new(MockAdapter::default()), &plan)
        .with_sink(sink.clone())
        .run(&plan.workload)
        .await;

    let m = report.get(&MetricsKey::new("a", "s")).unwrap();
    assert_eq!(m.total_requests, 10);
    assert_eq!(m.successful_requests, 10);
    assert_totals(&report);

    // Detached after the panic
    assert_eq!(sink.seen.load(Ordering::Relaxed), 3);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("sink panicked"));
}
