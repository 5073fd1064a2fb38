//! Per-round timeout policies for the interleaved merge loop

use super::coverage::DegradedReason;
use crate::clock::Clock;
use crate::config::DispatchConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Decides how long the merge loop waits for the next node.
pub trait TimeoutHandler: Send {
    /// Time to wait for the next reply, given how many nodes answered so far.
    fn next_timeout(&mut self, answered_nodes: u32) -> Duration;

    /// Degradation reason to report if the loop ends with nodes pending.
    fn reason(&self) -> DegradedReason;
}

/// Always waits for whatever time is left of the query.
pub struct SimpleTimeoutHandler {
    clock: Arc<dyn Clock>,
    deadline: Instant,
}

impl SimpleTimeoutHandler {
    pub fn new(clock: Arc<dyn Clock>, deadline: Instant) -> Self {
        Self { clock, deadline }
    }
}

impl TimeoutHandler for SimpleTimeoutHandler {
    fn next_timeout(&mut self, _answered_nodes: u32) -> Duration {
        self.deadline.saturating_duration_since(self.clock.now())
    }

    fn reason(&self) -> DegradedReason {
        DegradedReason::TIMEOUT
    }
}

/// Stops waiting early once enough nodes have answered.
///
/// When `ceil(asked * min_coverage / 100)` nodes have answered, the time left
/// at that moment fixes a grace window `[min_factor, max_factor] * left`.
/// Each further wait slopes linearly inside that window with the number of
/// nodes still pending, and the deadline only ever moves earlier.
pub struct AdaptiveTimeoutHandler {
    clock: Arc<dyn Clock>,
    deadline: Instant,
    asked_nodes: u32,
    min_responses: u32,
    min_coverage: f64,
    min_factor: f64,
    max_factor: f64,
    /// (minimum, maximum) grace, fixed on first crossing of `min_responses`
    grace: Option<(Duration, Duration)>,
}

impl AdaptiveTimeoutHandler {
    pub fn new(
        clock: Arc<dyn Clock>,
        deadline: Instant,
        asked_nodes: u32,
        min_coverage: f64,
        min_factor: f64,
        max_factor: f64,
    ) -> Self {
        let min_responses = (asked_nodes as f64 * min_coverage / 100.0).ceil() as u32;
        Self {
            clock,
            deadline,
            asked_nodes,
            min_responses,
            min_coverage,
            min_factor,
            max_factor,
            grace: None,
        }
    }

    pub fn min_responses(&self) -> u32 {
        self.min_responses
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl TimeoutHandler for AdaptiveTimeoutHandler {
    fn next_timeout(&mut self, answered_nodes: u32) -> Duration {
        let now = self.clock.now();
        let left = self.deadline.saturating_duration_since(now);
        if answered_nodes < self.min_responses {
            return left;
        }

        let (min_wait, max_wait) = *self.grace.get_or_insert_with(|| {
            (
                left.mul_f64(self.min_factor),
                left.mul_f64(self.max_factor),
            )
        });

        let pending = self.asked_nodes.saturating_sub(answered_nodes);
        let miss_width = (100.0 - self.min_coverage) * self.asked_nodes as f64 / 100.0 - 1.0;
        let mut sloped = min_wait.as_secs_f64();
        if pending > 1 && miss_width > 0.0 {
            sloped += (max_wait.as_secs_f64() - min_wait.as_secs_f64()) * (pending - 1) as f64
                / miss_width;
        }
        let sloped = Duration::from_secs_f64(sloped.max(0.0));

        if sloped >= left {
            return left;
        }
        self.deadline = now + sloped;
        sloped
    }

    /// Adaptive only once the response threshold was reached, a plain
    /// timeout otherwise.
    fn reason(&self) -> DegradedReason {
        if self.grace.is_some() {
            DegradedReason::ADAPTIVE_TIMEOUT
        } else {
            DegradedReason::TIMEOUT
        }
    }
}

/// Pick the timeout policy for one fan-out of `asked_nodes` nodes.
pub fn timeout_handler(
    config: &DispatchConfig,
    clock: Arc<dyn Clock>,
    deadline: Instant,
    asked_nodes: u32,
) -> Box<dyn TimeoutHandler> {
    if config.adaptive_timeout_enabled() {
        Box::new(AdaptiveTimeoutHandler::new(
            clock,
            deadline,
            asked_nodes,
            config.min_search_coverage,
            config.min_wait_after_coverage_factor,
            config.max_wait_after_coverage_factor,
        ))
    } else {
        Box::new(SimpleTimeoutHandler::new(clock, deadline))
    }
}
