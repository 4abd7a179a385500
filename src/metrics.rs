//! Agent metrics
//!
//! Two OpenTelemetry instruments on the global meter; exported over OTLP
//! when telemetry was initialized with an endpoint, discarded otherwise.

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for permbot metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("permbot"));

/// Counter of completed change cycles
///
/// Labels:
/// - `outcome`: success, error
pub static CHANGES_APPLIED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("permbot_agent_changes_applied_total")
        .with_description("Number of policy changes processed by the agent")
        .with_unit("{changes}")
        .build()
});

/// Histogram of apply cycle duration
pub static APPLY_TIME: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("permbot_agent_applytime_secs")
        .with_description("Time taken to apply the compiled policy in seconds")
        .with_unit("s")
        .build()
});

/// Outcome label of a change cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Policy fetched and global resources applied
    Success,
    /// Fetch failed, source deleted, or a global resource failed
    Error,
}

impl CycleOutcome {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Whether this is [`CycleOutcome::Success`]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Count one processed change
pub fn record_change(outcome: CycleOutcome) {
    CHANGES_APPLIED.add(1, &[KeyValue::new("outcome", outcome.as_str())]);
}

/// Times an apply cycle
pub struct ApplyTimer {
    start: Instant,
}

impl ApplyTimer {
    /// Start timing
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record the elapsed time and return it in seconds
    pub fn complete(self) -> f64 {
        let secs = self.start.elapsed().as_secs_f64();
        APPLY_TIME.record(secs, &[]);
        secs
    }
}
