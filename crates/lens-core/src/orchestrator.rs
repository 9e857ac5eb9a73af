use chrono::Utc;
use futures::future::join_all;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::accumulator::{MetricsAccumulator, Pricing};
use crate::adapter::{ProviderAdapter, ProviderRequest, Target};
use crate::concurrency::ConcurrencyController;
use crate::executor::{RequestExecutor, RequestTask};
use crate::export::{NullSink, OutcomeSink, RunReport};
use crate::outcome::{MetricsKey, RequestOutcome};
use crate::rate_limiter::{RateLimit, RateLimiter};
use crate::retry::RetryPolicy;

/// Capacity of the channel carrying outcomes to the collector.
const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

/// Run-level knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub max_concurrency: usize,
    /// Worker tasks per target, pulling from that target's queue
    pub workers: usize,
    /// Bound of each target's work queue
    pub queue_capacity: usize,
    /// Cancel outstanding work once this much time has passed
    pub deadline: Option<Duration>,
    /// Interval between progress log lines
    pub progress_every: Option<Duration>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            workers: 10,
            queue_capacity: 256,
            deadline: None,
            progress_every: None,
        }
    }
}

impl RunSettings {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self.workers = max_concurrency;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// One `(target, scenario, iterations)` tuple of the request matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadEntry {
    pub target: Arc<Target>,
    pub request: Arc<ProviderRequest>,
    pub iterations: u32,
}

impl WorkloadEntry {
    pub fn new(target: Target, request: ProviderRequest, iterations: u32) -> Self {
        Self {
            target: Arc::new(target),
            request: Arc::new(request),
            iterations,
        }
    }

    pub fn key(&self) -> MetricsKey {
        MetricsKey::new(self.target.name.as_str(), self.request.scenario.as_str())
    }
}

/// Finite request matrix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workload {
    entries: Vec<WorkloadEntry>,
}

impl Workload {
    pub fn new(entries: Vec<WorkloadEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[WorkloadEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.total_requests() == 0
    }

    pub fn total_requests(&self) -> u64 {
        self.entries.iter().map(|e| e.iterations as u64).sum()
    }

    /// Distinct target names, in the order they first appear.
    pub fn target_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !names.contains(&entry.target.name) {
                names.push(entry.target.name.clone());
            }
        }
        names
    }

    /// Enumerate tasks round-robin across entries, so every key makes progress
    /// from the start. Ids are assigned sequentially from 1.
    pub fn tasks(&self) -> impl Iterator<Item = RequestTask> + '_ {
        let rounds = self.entries.iter().map(|e| e.iterations).max().unwrap_or(0);
        (0..rounds)
            .flat_map(move |round| self.entries.iter().filter(move |e| e.iterations > round))
            .zip(1u64..)
            .map(|(entry, id)| RequestTask {
                id,
                key: entry.key(),
                target: Arc::clone(&entry.target),
                request: Arc::clone(&entry.request),
            })
    }
}

/// Validated, strongly typed description of a run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub settings: RunSettings,
    pub retry: RetryPolicy,
    pub rate_limits: Vec<(String, RateLimit)>,
    pub pricing: Vec<(String, Pricing)>,
    pub workload: Workload,
}

impl RunPlan {
    pub fn new(workload: Workload) -> Self {
        Self {
            settings: RunSettings::default(),
            retry: RetryPolicy::default(),
            rate_limits: Vec::new(),
            pricing: Vec::new(),
            workload,
        }
    }
}

/// Owns the run lifecycle: enumerate, dispatch, collect, finalize.
pub struct Orchestrator {
    executor: Arc<RequestExecutor>,
    controller: Arc<ConcurrencyController>,
    settings: RunSettings,
    pricing: Vec<(String, Pricing)>,
    sink: Arc<dyn OutcomeSink>,
}

impl Orchestrator {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, plan: &RunPlan) -> Self {
        let controller = Arc::new(ConcurrencyController::new(plan.settings.max_concurrency));
        let limiter = if plan.rate_limits.is_empty() {
            RateLimiter::unlimited()
        } else {
            RateLimiter::new(plan.rate_limits.iter().cloned())
        };
        let executor = RequestExecutor::new(
            adapter,
            Arc::new(limiter),
            Arc::clone(&controller),
            plan.retry.clone(),
        );

        Self {
            executor: Arc::new(executor),
            controller,
            settings: plan.settings.clone(),
            pricing: plan.pricing.clone(),
            sink: Arc::new(NullSink),
        }
    }

    /// Receive every outcome as it is recorded.
    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn controller(&self) -> &ConcurrencyController {
        &self.controller
    }

    /// Execute the workload to completion or until the deadline.
    ///
    /// Always returns a full report: failures and cancellations are outcomes,
    /// never errors. Every task yields exactly one final outcome.
    pub async fn run(&self, workload: &Workload) -> RunReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let total = workload.total_requests();
        let workers = self.settings.workers.max(1);
        let lanes = workload.target_names();

        info!(
            "Starting run: {} requests over {} keys, max concurrency {}, {} workers per target",
            total,
            workload.entries().len(),
            self.controller.max_concurrency(),
            workers
        );

        let (outcome_tx, mut outcome_rx) = mpsc::channel::<RequestOutcome>(OUTCOME_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let completed = Arc::new(AtomicU64::new(0));

        // Collector: sole owner of the accumulator
        let collector = {
            let accumulator = MetricsAccumulator::new().with_pricing(self.pricing.iter().cloned());
            let mut sink = Some(Arc::clone(&self.sink));
            let completed = Arc::clone(&completed);
            tokio::spawn(async move {
                let mut warnings = Vec::new();
                while let Some(outcome) = outcome_rx.recv().await {
                    accumulator.record(&outcome);
                    if outcome.is_final() {
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                    let panicked = sink.as_ref().is_some_and(|sink| {
                        catch_unwind(AssertUnwindSafe(|| sink.on_outcome(&outcome))).is_err()
                    });
                    if panicked {
                        warn!("Outcome sink panicked on request {}, detaching it", outcome.id);
                        warnings.push(format!(
                            "outcome sink panicked on request {} and was detached",
                            outcome.id
                        ));
                        sink = None;
                    }
                }
                (accumulator, warnings)
            })
        };

        let progress = self.settings.progress_every.map(|every| {
            let completed = Arc::clone(&completed);
            let controller = Arc::clone(&self.controller);
            tokio::spawn(async move {
                let mut ticker = interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    info!(
                        "Progress: {}/{} complete, {} in flight",
                        completed.load(Ordering::Relaxed),
                        total,
                        controller.in_flight()
                    );
                }
            })
        });

        // One lane per target, so a throttled target only parks its own workers
        let mut producers = Vec::with_capacity(lanes.len());
        let mut queues = Vec::with_capacity(lanes.len());
        let mut handles = Vec::with_capacity(lanes.len() * workers);
        for lane in lanes {
            let (task_tx, task_rx) =
                mpsc::channel::<RequestTask>(self.settings.queue_capacity.max(1));
            let task_rx = Arc::new(Mutex::new(task_rx));

            for worker_id in 0..workers {
                handles.push(spawn_worker(
                    format!("{}/{}", lane, worker_id),
                    Arc::clone(&self.executor),
                    Arc::clone(&task_rx),
                    outcome_tx.clone(),
                    shutdown_rx.clone(),
                ));
            }
            producers.push(spawn_producer(
                workload.clone(),
                lane,
                task_tx,
                outcome_tx.clone(),
                shutdown_rx.clone(),
            ));
            queues.push(task_rx);
        }

        let workers_done = join_all(handles);
        tokio::pin!(workers_done);
        let deadline_hit = match self.settings.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = &mut workers_done => false,
                    _ = sleep_until(start + deadline) => {
                        warn!("Run deadline of {:?} reached, cancelling outstanding requests", deadline);
                        let _ = shutdown_tx.send(true);
                        (&mut workers_done).await;
                        true
                    }
                }
            }
            None => {
                (&mut workers_done).await;
                false
            }
        };

        for producer in join_all(producers).await {
            if let Err(e) = producer {
                warn!("Producer task failed: {}", e);
            }
        }

        // Tasks still queued when the deadline fired
        for queue in queues {
            let mut rx = queue.lock().await;
            rx.close();
            while let Ok(task) = rx.try_recv() {
                cancel(&outcome_tx, &task).await;
            }
        }
        drop(outcome_tx);

        let (accumulator, warnings) = match collector.await {
            Ok(collected) => collected,
            Err(e) => {
                warn!("Collector task failed, metrics are incomplete: {}", e);
                (
                    MetricsAccumulator::new(),
                    vec![format!("collector task failed, metrics are incomplete: {}", e)],
                )
            }
        };
        if let Some(progress) = progress {
            progress.abort();
        }

        let elapsed = start.elapsed();
        let metrics = accumulator.finalize(elapsed);
        let report = RunReport::new(
            started_at,
            elapsed,
            self.controller.max_concurrency(),
            self.controller.peak(),
            deadline_hit,
            metrics,
        )
        .with_warnings(warnings);

        info!(
            "Run finished in {:?}: {} succeeded, {} failed, {} cancelled",
            elapsed,
            report.successful_requests(),
            report.failed_requests(),
            report.cancelled_requests()
        );

        report
    }
}

/// Feed one target's tasks into its queue, cancelling whatever is left once
/// the deadline fires.
fn spawn_producer(
    workload: Workload,
    lane: String,
    task_tx: mpsc::Sender<RequestTask>,
    outcome_tx: mpsc::Sender<RequestOutcome>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tasks = workload.tasks().filter(|task| task.target.name == lane);
        while let Some(task) = tasks.next() {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => {
                    let mut unsent = 1;
                    cancel(&outcome_tx, &task).await;
                    for task in tasks.by_ref() {
                        cancel(&outcome_tx, &task).await;
                        unsent += 1;
                    }
                    debug!("Producer for {} stopped, {} tasks never dispatched", lane, unsent);
                    break;
                }
                sent = task_tx.send(task.clone()) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_worker(
    name: String,
    executor: Arc<RequestExecutor>,
    task_rx: Arc<Mutex<mpsc::Receiver<RequestTask>>>,
    outcome_tx: mpsc::Sender<RequestOutcome>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Worker {} started", name);
        loop {
            let task = {
                let mut rx = task_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => None,
                    task = rx.recv() => task,
                }
            };
            let Some(task) = task else { break };

            let attempts = AtomicU32::new(0);
            let outcome = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => {
                    RequestOutcome::cancelled(
                        task.id,
                        task.key.clone(),
                        attempts.load(Ordering::Acquire),
                    )
                }
                outcome = executor.execute(&task, &attempts, &outcome_tx) => outcome,
            };

            if outcome_tx.send(outcome).await.is_err() {
                break;
            }
        }
        debug!("Worker {} stopped", name);
    })
}

/// Resolves once the deadline has fired.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn cancel(outcomes: &mpsc::Sender<RequestOutcome>, task: &RequestTask) {
    let _ = outcomes
        .send(RequestOutcome::cancelled(task.id, task.key.clone(), 0))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(target: &str, scenario: &str, iterations: u32) -> WorkloadEntry {
        WorkloadEntry::new(
            Target {
                name: target.to_string(),
                endpoint: String::new(),
                model: "m".to_string(),
                streaming: true,
                timeout: Duration::from_secs(30),
            },
            ProviderRequest {
                scenario: scenario.to_string(),
                prompt: "p".to_string(),
                max_tokens: 8,
            },
            iterations,
        )
    }

    #[test]
    fn test_tasks_round_robin_with_sequential_ids() {
        let workload = Workload::new(vec![entry("a", "s", 3), entry("b", "s", 1)]);
        let tasks: Vec<_> = workload
            .tasks()
            .map(|t| (t.id, t.key.to_string()))
            .collect();

        assert_eq!(
            tasks,
            vec![
                (1, "a/s".to_string()),
                (2, "b/s".to_string()),
                (3, "a/s".to_string()),
                (4, "a/s".to_string()),
            ]
        );
        assert_eq!(workload.total_requests(), 4);
    }

    #[test]
    fn test_empty_workload() {
        let workload = Workload::new(vec![entry("a", "s", 0)]);
        assert!(workload.is_empty());
        assert_eq!(workload.tasks().count(), 0);
        assert_eq!(Workload::default().tasks().count(), 0);
    }

    #[test]
    fn test_settings_builder() {
        let settings = RunSettings::default()
            .with_max_concurrency(4)
            .with_deadline(Duration::from_secs(1));
        assert_eq!(settings.max_concurrency, 4);
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.deadline, Some(Duration::from_secs(1)));
    }
}
