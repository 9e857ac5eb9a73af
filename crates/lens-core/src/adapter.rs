use anyhow::{Context, Result};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;

use crate::outcome::{ErrorKind, TokenCounts};

/// An inference endpoint under test.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Target identifier used in metrics keys
    pub name: String,
    pub endpoint: String,
    pub model: String,
    /// Ask the provider for incremental output
    pub streaming: bool,
    /// Per-request timeout enforced by the adapter
    pub timeout: Duration,
}

/// The payload of one scenario request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub scenario: String,
    pub prompt: String,
    pub max_tokens: u32,
}

/// Events an adapter yields for one attempt: any number of `Unit`s followed by
/// exactly one `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderEvent {
    Unit,
    Completed(TokenCounts),
    Failed(ErrorKind),
}

impl ProviderEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProviderEvent::Unit)
    }
}

pub type EventStream<'a> = Pin<Box<dyn futures::Stream<Item = ProviderEvent> + Send + 'a>>;

/// Trait for provider adapters. The engine only ever sees this capability.
///
/// The returned stream is lazy: the request goes out when it is first polled,
/// so the caller can stamp its start time immediately before.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn send<'a>(&'a self, target: &'a Target, request: &'a ProviderRequest) -> EventStream<'a>;
}

/// Scripted behaviour of the mock adapter for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct MockBehavior {
    pub first_unit_delay: Duration,
    pub unit_interval: Duration,
    pub units: u32,
    /// Overrides the gap before the unit at this index
    pub delayed_units: Vec<(usize, Duration)>,
    pub input_tokens: u64,
    /// Every call fails with this kind
    pub fail_with: Option<ErrorKind>,
    /// The first `n` calls fail with this kind, later calls succeed
    pub fail_first: Option<(ErrorKind, u32)>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            first_unit_delay: Duration::from_millis(50),
            unit_interval: Duration::from_millis(10),
            units: 16,
            delayed_units: Vec::new(),
            input_tokens: 32,
            fail_with: None,
            fail_first: None,
        }
    }
}

impl MockBehavior {
    pub fn streaming(units: u32, first_unit_delay: Duration, unit_interval: Duration) -> Self {
        Self {
            first_unit_delay,
            unit_interval,
            units,
            ..Self::default()
        }
    }

    pub fn always_failing(kind: ErrorKind) -> Self {
        Self {
            fail_with: Some(kind),
            ..Self::default()
        }
    }

    pub fn with_delayed_unit(mut self, index: usize, gap: Duration) -> Self {
        self.delayed_units.push((index, gap));
        self
    }

    pub fn failing_first(mut self, kind: ErrorKind, calls: u32) -> Self {
        self.fail_first = Some((kind, calls));
        self
    }

    pub fn with_input_tokens(mut self, input_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self
    }

    fn gap_before(&self, index: usize) -> Duration {
        if let Some((_, gap)) = self.delayed_units.iter().find(|(i, _)| *i == index) {
            return *gap;
        }
        if index == 0 {
            self.first_unit_delay
        } else {
            self.unit_interval
        }
    }

    fn failure_for_call(&self, call: u32) -> Option<ErrorKind> {
        if let Some(kind) = self.fail_with {
            return Some(kind);
        }
        match self.fail_first {
            Some((kind, calls)) if call <= calls => Some(kind),
            _ => None,
        }
    }

    /// (delay, event) pairs for the `call`-th call (1-based).
    fn script(&self, streaming: bool, call: u32) -> Vec<(Duration, ProviderEvent)> {
        if let Some(kind) = self.failure_for_call(call) {
            return vec![(self.first_unit_delay, ProviderEvent::Failed(kind))];
        }

        let units = self.units as usize;
        let tokens = TokenCounts::new(self.input_tokens, self.units as u64);
        if streaming {
            let mut script: Vec<_> = (0..units)
                .map(|i| (self.gap_before(i), ProviderEvent::Unit))
                .collect();
            script.push((Duration::ZERO, ProviderEvent::Completed(tokens)));
            script
        } else {
            // Same generation time, delivered in one piece
            let total: Duration = (0..units.max(1)).map(|i| self.gap_before(i)).sum();
            vec![(total, ProviderEvent::Completed(tokens))]
        }
    }
}

/// Mock adapter for testing and dry runs (scripted latencies, no network).
#[derive(Debug, Default)]
pub struct MockAdapter {
    default: MockBehavior,
    per_target: HashMap<String, MockBehavior>,
    calls: Mutex<HashMap<String, u32>>,
}

impl MockAdapter {
    pub fn new(default: MockBehavior) -> Self {
        Self {
            default,
            per_target: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>, behavior: MockBehavior) -> Self {
        self.per_target.insert(target.into(), behavior);
        self
    }

    /// Calls made so far against `target`.
    pub fn calls(&self, target: &str) -> u32 {
        self.calls.lock().get(target).copied().unwrap_or(0)
    }

    fn next_call(&self, target: &str) -> u32 {
        let mut calls = self.calls.lock();
        let count = calls.entry(target.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn send<'a>(&'a self, target: &'a Target, _request: &'a ProviderRequest) -> EventStream<'a> {
        let behavior = self.per_target.get(&target.name).unwrap_or(&self.default);
        let call = self.next_call(&target.name);
        let script = behavior.script(target.streaming, call);

        stream::iter(script)
            .then(|(delay, event)| async move {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                event
            })
            .boxed()
    }
}

/// HTTP/JSON adapter for OpenAI-compatible chat completion endpoints.
///
/// In streaming mode every non-empty body chunk counts as one unit; otherwise
/// token counts come from the response's `usage` object when present.
pub struct HttpAdapter {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpAdapter {
    pub fn new(api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, api_key })
    }

    async fn dispatch(
        &self,
        target: &Target,
        request: &ProviderRequest,
    ) -> Result<reqwest::Response, ErrorKind> {
        let body = json!({
            "model": target.model,
            "messages": [
                {
                    "role": "user",
                    "content": request.prompt,
                }
            ],
            "max_tokens": request.max_tokens,
            "stream": target.streaming,
        });

        let mut builder = self
            .client
            .post(&target.endpoint)
            .timeout(target.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        match classify_status(response.status()) {
            Some(kind) => Err(kind),
            None => Ok(response),
        }
    }
}

enum HttpPhase {
    Dispatch,
    Streaming {
        body: BoxStream<'static, reqwest::Result<usize>>,
        units: u64,
    },
    Done,
}

impl ProviderAdapter for HttpAdapter {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send<'a>(&'a self, target: &'a Target, request: &'a ProviderRequest) -> EventStream<'a> {
        stream::unfold(HttpPhase::Dispatch, move |phase| async move {
            match phase {
                HttpPhase::Done => None,
                HttpPhase::Streaming { body, units } => next_chunk(body, units).await,
                HttpPhase::Dispatch => {
                    let response = match self.dispatch(target, request).await {
                        Ok(response) => response,
                        Err(kind) => return Some((ProviderEvent::Failed(kind), HttpPhase::Done)),
                    };

                    if target.streaming {
                        let body = response
                            .bytes_stream()
                            .map(|chunk| chunk.map(|bytes| bytes.len()))
                            .boxed();
                        next_chunk(body, 0).await
                    } else {
                        let event = match response.bytes().await {
                            Ok(bytes) => ProviderEvent::Completed(usage_from_body(&bytes)),
                            Err(e) => ProviderEvent::Failed(classify_transport(&e)),
                        };
                        Some((event, HttpPhase::Done))
                    }
                }
            }
        })
        .boxed()
    }
}

async fn next_chunk(
    mut body: BoxStream<'static, reqwest::Result<usize>>,
    units: u64,
) -> Option<(ProviderEvent, HttpPhase)> {
    loop {
        match body.next().await {
            Some(Ok(0)) => continue,
            Some(Ok(_)) => {
                return Some((
                    ProviderEvent::Unit,
                    HttpPhase::Streaming {
                        body,
                        units: units + 1,
                    },
                ))
            }
            Some(Err(e)) => {
                return Some((
                    ProviderEvent::Failed(classify_transport(&e)),
                    HttpPhase::Done,
                ))
            }
            None => {
                return Some((
                    ProviderEvent::Completed(TokenCounts::new(0, units)),
                    HttpPhase::Done,
                ))
            }
        }
    }
}

/// Map an HTTP status onto the error taxonomy; `None` for success.
pub fn classify_status(status: StatusCode) -> Option<ErrorKind> {
    if status.is_success() {
        return None;
    }
    let kind = match status {
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::AuthError,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorKind::Timeout,
        s if s.is_server_error() => ErrorKind::ServerError,
        // Unfollowed redirects and stray informational statuses carry no completion
        s if s.is_informational() || s.is_redirection() => ErrorKind::ClientError,
        _ => ErrorKind::ClientError,
    };
    Some(kind)
}

fn classify_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::NetworkError
    }
}

fn usage_from_body(bytes: &[u8]) -> TokenCounts {
    let Ok(payload) = serde_json::from_slice::<Value>(bytes) else {
        return TokenCounts::default();
    };
    let usage = payload.get("usage");
    let field = |name: &str| {
        usage
            .and_then(|u| u.get(name))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };
    TokenCounts::new(field("prompt_tokens"), field("completion_tokens"))
}
