//! Scripted handler.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use drainpipe_core::{CancellationToken, Event, Handler, HandlerError, HandlerFuture, Position};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Succeed,
    FailTimes(usize),
    AlwaysFail,
}

/// Handler whose outcome per event is scripted by the test.
///
/// Each event fails a configured number of times before succeeding. Calls are counted
/// per position, so a retried event is recognised across attempts.
///
/// # Example
///
/// ```
/// use drainpipe_testing::ScriptedHandler;
///
/// // Offset 4 fails twice then succeeds; every other event succeeds at once.
/// let handler = ScriptedHandler::succeeding().with_failures(4, 2);
/// # let _ = handler;
/// ```
#[derive(Debug)]
pub struct ScriptedHandler {
    default: Behavior,
    overrides: HashMap<i64, Behavior>,
    delay: Duration,
    calls: Mutex<HashMap<Position, usize>>,
}

impl ScriptedHandler {
    fn with_default(default: Behavior) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
            delay: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Every call succeeds.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::with_default(Behavior::Succeed)
    }

    /// Every call fails.
    #[must_use]
    pub fn failing() -> Self {
        Self::with_default(Behavior::AlwaysFail)
    }

    /// Every event fails `times` times, then succeeds.
    #[must_use]
    pub fn failing_times(times: usize) -> Self {
        Self::with_default(Behavior::FailTimes(times))
    }

    /// The event at `offset` fails `times` times, then succeeds.
    #[must_use]
    pub fn with_failures(mut self, offset: i64, times: usize) -> Self {
        self.overrides.insert(offset, Behavior::FailTimes(times));
        self
    }

    /// The event at `offset` always fails.
    #[must_use]
    pub fn always_failing_at(mut self, offset: i64) -> Self {
        self.overrides.insert(offset, Behavior::AlwaysFail);
        self
    }

    /// Sleep for `delay` inside every call, after it has been counted.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Calls made for `position`.
    #[must_use]
    pub fn call_count(&self, position: &Position) -> usize {
        self.calls.lock().unwrap().get(position).copied().unwrap_or(0)
    }

    /// Calls made across all events.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    fn record_call(&self, position: &Position) -> usize {
        let mut calls = self.calls.lock().unwrap();
        let count = calls.entry(position.clone()).or_insert(0);
        *count += 1;
        *count
    }
}

impl Handler for ScriptedHandler {
    fn handle(&self, _cancel: CancellationToken, event: Arc<Event>) -> HandlerFuture<'_> {
        Box::pin(async move {
            let position = event.position();
            let call = self.record_call(position);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let behavior = self
                .overrides
                .get(&position.offset)
                .copied()
                .unwrap_or(self.default);
            match behavior {
                Behavior::Succeed => Ok(()),
                Behavior::FailTimes(times) if call > times => Ok(()),
                Behavior::FailTimes(_) | Behavior::AlwaysFail => Err(HandlerError::new(format!(
                    "scripted failure {call} for {position}"
                ))),
            }
        })
    }
}
