//! Workflow definitions: steps as data, actions referenced by name.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::ContextKind;

/// Retry schedule for a single step.
///
/// `max_attempts` counts the first attempt, so `1` means no retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            backoff_multiplier,
            max_delay,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (zero-based):
    /// `min(initial_delay * backoff_multiplier^retry, max_delay)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(scaled.max(0.0).round() as u64)
    }

    /// True when another attempt is allowed after `attempt` failed.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

/// How completed steps are reversed once a workflow fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationStrategy {
    /// One reversal at a time, newest first; stops at the first failure.
    #[default]
    Sequential,
    /// All reversals at once; every failure is collected.
    Parallel,
    /// Every reversal runs; failures are recorded and the workflow still
    /// ends compensated.
    BestEffort,
}

impl CompensationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationStrategy::Sequential => "sequential",
            CompensationStrategy::Parallel => "parallel",
            CompensationStrategy::BestEffort => "best_effort",
        }
    }
}

impl fmt::Display for CompensationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompensationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(CompensationStrategy::Sequential),
            "parallel" => Ok(CompensationStrategy::Parallel),
            "best_effort" | "best-effort" => Ok(CompensationStrategy::BestEffort),
            other => Err(format!("unknown compensation strategy: {other}")),
        }
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDescriptor {
    pub name: String,
    pub action: String,
    pub compensation: Option<String>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            compensation: None,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    pub fn compensated_by(mut self, action: impl Into<String>) -> Self {
        self.compensation = Some(action.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// An immutable, versioned workflow. Instances pin the `(id, version)`
/// they started with.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    pub version: u32,
    pub context_kind: ContextKind,
    pub steps: Vec<StepDescriptor>,
    pub compensation_strategy: CompensationStrategy,
    pub on_completed: Option<String>,
    pub on_compensated: Option<String>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, version: u32, context_kind: ContextKind) -> Self {
        Self {
            id: id.into(),
            version,
            context_kind,
            steps: Vec::new(),
            compensation_strategy: CompensationStrategy::default(),
            on_completed: None,
            on_compensated: None,
        }
    }

    pub fn step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    pub fn compensation_strategy(mut self, strategy: CompensationStrategy) -> Self {
        self.compensation_strategy = strategy;
        self
    }

    pub fn on_completed(mut self, finalizer: impl Into<String>) -> Self {
        self.on_completed = Some(finalizer.into());
        self
    }

    pub fn on_compensated(mut self, finalizer: impl Into<String>) -> Self {
        self.on_compensated = Some(finalizer.into());
        self
    }

    pub fn step_at(&self, index: usize) -> Option<&StepDescriptor> {
        self.steps.get(index)
    }
}
