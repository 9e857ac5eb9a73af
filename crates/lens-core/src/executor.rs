use futures::StreamExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::adapter::{ProviderAdapter, ProviderEvent, ProviderRequest, Target};
use crate::concurrency::ConcurrencyController;
use crate::outcome::{ErrorKind, MetricsKey, RequestId, RequestOutcome};
use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryPolicy, RetryState, RetryTracker};
use crate::timing::TimingBuilder;

/// One logical request of the workload.
#[derive(Debug, Clone)]
pub struct RequestTask {
    pub id: RequestId,
    pub key: MetricsKey,
    pub target: Arc<Target>,
    pub request: Arc<ProviderRequest>,
}

/// Drives logical requests through the adapter under the shared concurrency
/// bound, rate limiter and retry policy.
pub struct RequestExecutor {
    adapter: Arc<dyn ProviderAdapter>,
    limiter: Arc<RateLimiter>,
    controller: Arc<ConcurrencyController>,
    policy: RetryPolicy,
}

impl RequestExecutor {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        limiter: Arc<RateLimiter>,
        controller: Arc<ConcurrencyController>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            adapter,
            limiter,
            controller,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run exactly one attempt and time it.
    ///
    /// The adapter's stream is lazy, so `request_start` is stamped immediately
    /// before the request is dispatched by the first poll.
    pub async fn attempt(&self, task: &RequestTask, attempt: u32) -> RequestOutcome {
        let mut events = self.adapter.send(&task.target, &task.request);
        let mut timing = TimingBuilder::start();

        while let Some(event) = events.next().await {
            match event {
                ProviderEvent::Unit => {
                    timing.record_unit();
                }
                ProviderEvent::Completed(tokens) => {
                    let timing = timing.finish();
                    return RequestOutcome::success(
                        task.id,
                        task.key.clone(),
                        timing,
                        tokens,
                        attempt,
                    );
                }
                ProviderEvent::Failed(kind) => {
                    return RequestOutcome::failed(task.id, task.key.clone(), kind, attempt);
                }
            }
        }

        warn!(
            "{} adapter ended the stream for {} without a terminal event",
            self.adapter.name(),
            task.key
        );
        RequestOutcome::failed(task.id, task.key.clone(), ErrorKind::NetworkError, attempt)
    }

    /// Run a logical request to its final disposition.
    ///
    /// Every attempt outcome is forwarded on `outcomes`; the final outcome is
    /// returned. `attempts` tracks the attempt in progress so a caller that
    /// cancels this future can still report how far the request got.
    ///
    /// Per attempt the rate token is taken first, then the concurrency
    /// permit, so a throttled target never holds capacity while it waits.
    /// The permit is released before any backoff sleep.
    pub async fn execute(
        &self,
        task: &RequestTask,
        attempts: &AtomicU32,
        outcomes: &mpsc::Sender<RequestOutcome>,
    ) -> RequestOutcome {
        let mut tracker = RetryTracker::new(&self.policy);
        let mut last = None;

        while let Some(attempt) = tracker.begin_attempt() {
            attempts.store(attempt, Ordering::Release);
            let outcome = {
                self.limiter.acquire(&task.target.name).await;
                let _permit = self.controller.acquire().await;
                self.attempt(task, attempt).await
            };

            // A closed channel means nobody is listening any more
            let _ = outcomes.send(outcome.clone()).await;

            match outcome.error_kind() {
                None => {
                    tracker.on_success();
                }
                Some(kind) => {
                    if let RetryState::Backoff { attempt, delay } = tracker.on_failure(kind) {
                        debug!(
                            "Retrying {} (request {}) after {} on attempt {}, backoff {:?}",
                            task.key, task.id, kind, attempt, delay
                        );
                        sleep(delay).await;
                    }
                }
            }
            last = Some(outcome);
        }

        // begin_attempt only stops after a terminal state, so an attempt ran
        match last {
            Some(outcome) => outcome.into_final(),
            None => RequestOutcome::cancelled(task.id, task.key.clone(), 0),
        }
    }
}
