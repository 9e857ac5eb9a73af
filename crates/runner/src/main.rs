use anyhow::{Context, Result};
use chrono::SecondsFormat;
use clap::Parser;
use lens_core::{
    AggregatedMetrics, Exporter, HttpAdapter, LatencySummary, MockAdapter, MockBehavior,
    Orchestrator, OutcomeSink, OutcomeStatus, ProfileConfig, ProviderAdapter, RequestOutcome,
    RunReport,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "runner")]
#[command(about = "LLM latency profiler - drives a workload profile against inference endpoints")]
struct Args {
    /// Path to the workload profile
    #[arg(long, default_value = "config/example.toml")]
    config: PathBuf,

    /// Adapter: mock or http
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Environment variable holding the API key (http mode)
    #[arg(long, default_value = "LLM_API_KEY")]
    api_key_env: String,

    /// Directory for the JSON results file
    #[arg(long, default_value = "results")]
    output_dir: PathBuf,

    /// Run deadline in milliseconds (overrides the profile)
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Log a progress line every N completed requests
    #[arg(long, default_value = "100")]
    log_every: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut profile = ProfileConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load profile from {:?}", args.config))?;
    if let Some(deadline_ms) = args.deadline_ms {
        profile.run.deadline_ms = Some(deadline_ms);
    }
    let plan = profile.validate().context("Invalid profile")?;

    info!(
        "Loaded profile {:?}: {} targets, {} scenarios, {} requests",
        args.config,
        profile.targets.len(),
        profile.scenarios.len(),
        plan.workload.total_requests()
    );

    let adapter: Arc<dyn ProviderAdapter> = match args.mode.as_str() {
        "mock" => Arc::new(MockAdapter::new(MockBehavior::default())),
        "http" => {
            let api_key = std::env::var(&args.api_key_env).ok();
            if api_key.is_none() {
                warn!("{} is not set, sending requests without credentials", args.api_key_env);
            }
            Arc::new(HttpAdapter::new(api_key).context("Failed to create HTTP adapter")?)
        }
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };

    info!("Using adapter: {}", adapter.name());

    let sink = Arc::new(ProgressSink::new(plan.workload.total_requests(), args.log_every));
    let orchestrator = Orchestrator::new(adapter, &plan).with_sink(sink);
    let report = orchestrator.run(&plan.workload).await;

    let exporters: Vec<Box<dyn Exporter>> = vec![
        Box::new(JsonFileExporter::new(args.output_dir)),
        Box::new(StdoutSummary),
    ];
    for exporter in &exporters {
        exporter.export(&report)?;
    }

    Ok(())
}

/// Logs progress from the live outcome stream.
struct ProgressSink {
    total: u64,
    log_every: u64,
    state: Mutex<Progress>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Progress {
    done: u64,
    failed: u64,
    cancelled: u64,
    failed_attempts: u64,
}

impl ProgressSink {
    fn new(total: u64, log_every: u64) -> Self {
        Self {
            total,
            log_every: log_every.max(1),
            state: Mutex::new(Progress::default()),
        }
    }

    fn snapshot(&self) -> Progress {
        *self.state.lock()
    }
}

impl OutcomeSink for ProgressSink {
    fn on_outcome(&self, outcome: &RequestOutcome) {
        let mut state = self.state.lock();
        if !outcome.is_final() {
            if let Some(kind) = outcome.error_kind() {
                state.failed_attempts += 1;
                debug!(
                    "Request {} ({}) attempt {} failed: {}",
                    outcome.id, outcome.key, outcome.attempts, kind
                );
            }
            return;
        }

        state.done += 1;
        match outcome.status() {
            OutcomeStatus::Failed(_) => state.failed += 1,
            OutcomeStatus::Cancelled => state.cancelled += 1,
            OutcomeStatus::Success => {}
        }
        if state.done % self.log_every == 0 || state.done == self.total {
            info!(
                "Progress: {}/{} done, failed={} cancelled={} failed_attempts={}",
                state.done, self.total, state.failed, state.cancelled, state.failed_attempts
            );
        }
    }
}

/// Writes the report as pretty JSON to `<dir>/run_<timestamp>.json`.
struct JsonFileExporter {
    dir: PathBuf,
}

impl JsonFileExporter {
    fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, report: &RunReport) -> PathBuf {
        let timestamp = report.started_at.format("%Y%m%d_%H%M%S");
        self.dir.join(format!("run_{}.json", timestamp))
    }
}

impl Exporter for JsonFileExporter {
    fn export(&self, report: &RunReport) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {:?}", self.dir))?;
        let path = self.path_for(report);
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
        info!("Results written to {}", path.display());
        Ok(())
    }
}

/// Human-readable summary on stdout.
struct StdoutSummary;

impl Exporter for StdoutSummary {
    fn export(&self, report: &RunReport) -> Result<()> {
        print_summary(report);
        Ok(())
    }
}

fn print_summary(report: &RunReport) {
    println!("\n=== Run Summary ===");
    println!(
        "Started: {}",
        report.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    println!("Duration: {}ms", report.elapsed_ms);
    println!(
        "Concurrency: peak {} of {}",
        report.peak_concurrency, report.max_concurrency
    );
    if report.deadline_hit {
        println!("Deadline reached, outstanding requests were cancelled");
    }
    for warning in &report.warnings {
        println!("Warning: {}", warning);
    }
    println!(
        "Requests: total={} ok={} failed={} cancelled={}",
        report.total_requests(),
        report.successful_requests(),
        report.failed_requests(),
        report.cancelled_requests()
    );

    for m in &report.metrics {
        print_key(m);
    }
    println!();
}

fn print_key(m: &AggregatedMetrics) {
    println!("\n--- {} ---", m.key);
    println!(
        "Requests: total={} ok={} failed={} cancelled={} attempts={} retries={}",
        m.total_requests,
        m.successful_requests,
        m.failed_requests,
        m.cancelled_requests,
        m.total_attempts,
        m.retries
    );
    if let Some(rate) = m.success_rate {
        println!("Success rate: {:.1}%", rate * 100.0);
    }
    print_latency("TTFT", m.ttft.as_ref());
    print_latency("Total", m.total_duration.as_ref());
    print_latency("Inter-token", m.inter_token_latency.as_ref());
    if let Some(tps) = m.output_tokens_per_second {
        println!("Output throughput: {:.1} tokens/s", tps);
    }
    if let Some(t) = &m.request_throughput {
        println!(
            "Per-request throughput: mean {:.1} p50 {:.1} p99 {:.1} tokens/s",
            t.mean, t.p50, t.p99
        );
    }
    println!("Tokens: input={} output={}", m.input_tokens, m.output_tokens);
    if let Some(cost) = m.total_cost {
        println!("Cost: {:.4}", cost);
    }
    for (kind, count) in &m.errors {
        println!("Error {}: {}", kind, count);
    }
    for (kind, count) in &m.attempt_errors {
        println!("Failed attempts {}: {}", kind, count);
    }
}

fn print_latency(label: &str, summary: Option<&LatencySummary>) {
    match summary {
        Some(s) => println!(
            "{} latency: p50 {} p90 {} p95 {} p99 {} p99.9 {} (min {} max {} mean {} stddev {}, n={})",
            label,
            ms(s.p50),
            ms(s.p90),
            ms(s.p95),
            ms(s.p99),
            ms(s.p999),
            ms(s.min),
            ms(s.max),
            ms(s.mean),
            ms(s.stddev),
            s.count
        ),
        None => println!("{} latency: no data", label),
    }
}

fn ms(d: Duration) -> String {
    format!("{:.3}ms", d.as_secs_f64() * 1000.0)
}
