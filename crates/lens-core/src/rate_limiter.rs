use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Sustained rate and burst size for one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl RateLimit {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        Self {
            requests_per_second,
            burst,
        }
    }
}

/// One token, in bucket units. The refill rate is kept in milli-tokens per
/// second and elapsed time in microseconds, so `rate * micros` lands directly
/// in these units without floating point on the hot path.
const TOKEN: u128 = 1_000_000_000;

/// Token bucket using integer-only math.
///
/// Starts full. Over any window of length `T` it admits at most
/// `rate * T + burst` requests.
#[derive(Debug)]
pub struct TokenBucket {
    /// Refill rate in milli-tokens per second
    milli_rate: u64,
    /// Maximum stored tokens, in bucket units
    capacity: u128,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u128,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(limit: RateLimit) -> Self {
        let milli_rate = (limit.requests_per_second * 1000.0).round().max(1.0) as u64;
        let capacity = (limit.burst.max(1) as u128) * TOKEN;
        Self {
            milli_rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to take a token without waiting.
    pub fn try_acquire(&self) -> bool {
        self.take_or_wait(Instant::now()).is_ok()
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            match self.take_or_wait(Instant::now()) {
                Ok(()) => return,
                Err(wait) => sleep(wait).await,
            }
        }
    }

    /// Whole tokens currently stored.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        (state.tokens / TOKEN) as u64
    }

    /// Takes a token, or reports how long until one is due.
    fn take_or_wait(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens >= TOKEN {
            state.tokens -= TOKEN;
            return Ok(());
        }

        let deficit = TOKEN - state.tokens;
        let rate = self.milli_rate as u128;
        let wait_micros = deficit.div_ceil(rate);
        Err(Duration::from_micros(wait_micros as u64))
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed_micros = now.saturating_duration_since(state.last_refill).as_micros();
        if elapsed_micros == 0 {
            return;
        }

        let added = (self.milli_rate as u128) * elapsed_micros;
        state.tokens = state.tokens.saturating_add(added).min(self.capacity);
        // Advance by whole microseconds only so sub-microsecond time is not lost
        state.last_refill += Duration::from_micros(elapsed_micros as u64);
    }
}

/// Per-target admission throttle.
///
/// Targets without a configured limit take the no-op path: no bucket, no lock,
/// no clock read.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: HashMap<String, TokenBucket>,
}

impl RateLimiter {
    /// A limiter that never throttles.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn new<I, K>(limits: I) -> Self
    where
        I: IntoIterator<Item = (K, RateLimit)>,
        K: Into<String>,
    {
        let buckets = limits
            .into_iter()
            .map(|(key, limit)| (key.into(), TokenBucket::new(limit)))
            .collect();
        Self { buckets }
    }

    /// Wait until `key` may issue a request.
    pub async fn acquire(&self, key: &str) {
        if let Some(bucket) = self.bucket(key) {
            bucket.acquire().await;
        }
    }

    /// Non-blocking check; always `true` for unlimited targets.
    pub fn try_acquire(&self, key: &str) -> bool {
        match self.bucket(key) {
            Some(bucket) => bucket.try_acquire(),
            None => true,
        }
    }

    pub fn is_limited(&self, key: &str) -> bool {
        self.bucket(key).is_some()
    }

    #[inline]
    fn bucket(&self, key: &str) -> Option<&TokenBucket> {
        if self.buckets.is_empty() {
            return None;
        }
        self.buckets.get(key)
    }
}
