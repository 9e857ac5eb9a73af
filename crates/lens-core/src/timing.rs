use std::time::Duration;

use crate::timer::{PrecisionTimer, Timestamp};

/// Timing breakpoints of one completed attempt.
///
/// Built by a single worker through [`TimingBuilder`] and immutable afterwards.
/// `first_token_time` is absent when the provider streamed nothing, in which case
/// [`TimingBreakdown::ttft`] reports `None` rather than a made-up value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingBreakdown {
    request_start: Timestamp,
    first_token_time: Option<Timestamp>,
    per_token_times: Vec<Timestamp>,
    completion_time: Timestamp,
}

impl TimingBreakdown {
    pub fn request_start(&self) -> Timestamp {
        self.request_start
    }

    pub fn first_token_time(&self) -> Option<Timestamp> {
        self.first_token_time
    }

    pub fn per_token_times(&self) -> &[Timestamp] {
        &self.per_token_times
    }

    pub fn completion_time(&self) -> Timestamp {
        self.completion_time
    }

    /// Time to first token; `None` for non-streamed responses.
    pub fn ttft(&self) -> Option<Duration> {
        self.first_token_time
            .map(|first| PrecisionTimer::delta(self.request_start, first))
    }

    pub fn total_duration(&self) -> Duration {
        PrecisionTimer::delta(self.request_start, self.completion_time)
    }

    /// Gaps between consecutive units: entry `k` is the time between unit `k` and
    /// unit `k + 1`. Empty when fewer than two units arrived.
    pub fn inter_token_latencies(&self) -> Vec<Duration> {
        self.per_token_times
            .windows(2)
            .map(|pair| PrecisionTimer::delta(pair[0], pair[1]))
            .collect()
    }

    /// Number of streamed units observed.
    pub fn unit_count(&self) -> usize {
        self.per_token_times.len()
    }

    pub fn is_streamed(&self) -> bool {
        self.first_token_time.is_some()
    }
}

/// Single-writer recorder for the breakpoints of an in-flight attempt.
///
/// Timestamps passed in are clamped so that the ordering
/// `request_start <= first_token_time <= per_token_times.. <= completion_time`
/// always holds, even for callers supplying their own clock readings.
#[derive(Debug)]
pub struct TimingBuilder {
    request_start: Timestamp,
    first_token_time: Option<Timestamp>,
    per_token_times: Vec<Timestamp>,
}

impl TimingBuilder {
    /// Stamp `request_start` now.
    #[inline]
    pub fn start() -> Self {
        Self::start_at(PrecisionTimer::now())
    }

    pub fn start_at(request_start: Timestamp) -> Self {
        Self {
            request_start,
            first_token_time: None,
            per_token_times: Vec::new(),
        }
    }

    /// Record the arrival of one output unit now.
    #[inline]
    pub fn record_unit(&mut self) -> Timestamp {
        self.record_unit_at(PrecisionTimer::now())
    }

    pub fn record_unit_at(&mut self, at: Timestamp) -> Timestamp {
        let at = at.max(self.last_mark());
        // first_token_time is written once and never overwritten
        if self.first_token_time.is_none() {
            self.first_token_time = Some(at);
        }
        self.per_token_times.push(at);
        at
    }

    pub fn units(&self) -> usize {
        self.per_token_times.len()
    }

    pub fn request_start(&self) -> Timestamp {
        self.request_start
    }

    /// Stamp `completion_time` now and freeze the breakdown.
    #[inline]
    pub fn finish(self) -> TimingBreakdown {
        self.finish_at(PrecisionTimer::now())
    }

    pub fn finish_at(self, at: Timestamp) -> TimingBreakdown {
        let completion_time = at.max(self.last_mark());
        TimingBreakdown {
            request_start: self.request_start,
            first_token_time: self.first_token_time,
            per_token_times: self.per_token_times,
            completion_time,
        }
    }

    fn last_mark(&self) -> Timestamp {
        self.per_token_times
            .last()
            .copied()
            .unwrap_or(self.request_start)
    }
}
