// Copyright (c) 2025 LoadLab Team
// SPDX-License-Identifier: Apache-2.0

//! Workload registry and step timer.
//!
//! A [`LocalWorker`] holds the name-to-step mapping and executes a
//! comma-separated workload string for one iteration, timing each step on
//! the monotonic clock and stopping at the first failure.

use crate::context::IterationContext;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Error raised while executing a workload.
///
/// Travels on the experiment's error channel, so it is cheap to clone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkloadError {
    /// The workload referenced a name with no registered step.
    #[error("unknown workload step `{0}`")]
    UnknownStep(String),

    /// A step action returned a failure.
    #[error("step `{command}` failed: {message}")]
    StepFailed {
        /// Name of the failing step.
        command: String,
        /// Rendered failure message.
        message: String,
    },
}

type ActionFn = Arc<dyn Fn(IterationContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A named, timed, possibly context-aware unit of work.
///
/// Immutable once registered. The action is opaque to the engine; it either
/// ignores the iteration context or reads and writes it.
#[derive(Clone)]
pub struct Step {
    name: String,
    description: String,
    action: ActionFn,
}

impl Step {
    /// Creates a step whose action ignores the iteration context.
    pub fn new<F, Fut>(name: impl Into<String>, action: F, description: impl Into<String>) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            action: Arc::new(move |_ctx| Box::pin(action())),
        }
    }

    /// Creates a step whose action reads and writes the iteration context.
    pub fn with_context<F, Fut>(
        name: impl Into<String>,
        action: F,
        description: impl Into<String>,
    ) -> Self
    where
        F: Fn(IterationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            action: Arc::new(move |ctx| Box::pin(action(ctx))),
        }
    }

    /// The name the step is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human description of what the step does.
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Timing record for one executed step, including a failing one.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Name of the executed step.
    pub command: String,
    /// Monotonic duration of the step action.
    pub duration: Duration,
    /// Failure returned by the action, if any.
    pub error: Option<WorkloadError>,
}

/// Outcome of one pass through a workload. Exactly one per iteration.
#[derive(Debug, Clone, Default)]
pub struct IterationResult {
    /// Sum of the executed step durations.
    pub duration: Duration,
    /// Results of the steps that actually ran, in execution order.
    pub steps: Vec<StepResult>,
    /// First step failure encountered, if any. When set, the last element
    /// of `steps` is the failing step and no further step ran.
    pub error: Option<WorkloadError>,
}

/// Per-step duration event, published independently of the iteration result
/// so the sampler can bin latencies by command name.
#[derive(Debug, Clone)]
pub struct BenchmarkResult {
    /// Name of the timed step.
    pub command: String,
    /// Monotonic duration of the step action.
    pub duration: Duration,
}

/// Registry of named steps plus the per-iteration step timer.
#[derive(Debug, Default)]
pub struct LocalWorker {
    steps: DashMap<String, Step>,
}

impl LocalWorker {
    /// Creates a worker with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `step` under its name. An existing step with the same name
    /// is replaced.
    pub fn add_step(&self, step: Step) {
        self.steps.insert(step.name.clone(), step);
    }

    /// Returns true when a step is registered under `name`.
    pub fn has_step(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Executes the comma-separated `workload` once against `ctx`.
    ///
    /// Every name is resolved before anything runs; an unknown name fails
    /// the iteration with no step executed. Execution stops at the first
    /// failing step, whose result is still recorded.
    pub async fn time(&self, workload: &str, ctx: IterationContext) -> IterationResult {
        let mut resolved = Vec::new();
        for name in workload.split(',') {
            match self.steps.get(name) {
                Some(step) => resolved.push(step.clone()),
                None => {
                    return IterationResult {
                        duration: Duration::ZERO,
                        steps: Vec::new(),
                        error: Some(WorkloadError::UnknownStep(name.to_string())),
                    }
                }
            }
        }

        let mut steps = Vec::with_capacity(resolved.len());
        let mut total = Duration::ZERO;
        let mut error = None;

        for step in resolved {
            let start = Instant::now();
            let outcome = (step.action)(ctx.clone()).await;
            let duration = start.elapsed();
            total += duration;

            let step_error = outcome.err().map(|e| WorkloadError::StepFailed {
                command: step.name.clone(),
                message: e.to_string(),
            });
            debug!(command = %step.name, ?duration, failed = step_error.is_some(), "step timed");

            let failed = step_error.is_some();
            steps.push(StepResult {
                command: step.name.clone(),
                duration,
                error: step_error.clone(),
            });
            if failed {
                error = step_error;
                break;
            }
        }

        IterationResult {
            duration: total,
            steps,
            error,
        }
    }
}
