// Copyright (c) 2025 LoadLab Team
// SPDX-License-Identifier: Apache-2.0

//! Experiment execution and sampling engine.
//!
//! This crate schedules iterations of a named workload across concurrent
//! workers, times every step of every iteration, and fuses the resulting
//! event streams into a single monotonic stream of [`Sample`] snapshots
//! that is fanned out to any number of consumers.
//!
//! The moving parts:
//!
//! - [`worker::LocalWorker`]: the step registry and per-iteration timer.
//! - [`scheduler`]: composable combinators (`repeat`, `execute_concurrently`,
//!   `repeat_every_until`, `counted`, `time_worker`) that shape a run.
//! - [`experiment::RunnableExperiment`]: wires a configuration to the
//!   scheduler and drives one run to completion.
//! - the sampler: the single consumer of all event channels, emitting one
//!   [`Sample`] per observed event and on every one-second tick.
//! - [`lab::Laboratory`]: assigns experiment identifiers, multiplexes the
//!   sample stream to handlers, and serves previously-run experiments.

pub mod context;
pub mod experiment;
pub mod lab;
pub mod multiplexer;
mod sampler;
pub mod scheduler;
pub mod worker;

pub use context::{ContextValue, IterationContext};
pub use experiment::{
    Command, ExperimentConfig, ExperimentError, RunnableExperiment, Sample, SampleHandler,
    SampleType, Stopper, DEFAULT_WORKLOAD,
};
pub use lab::{Experiment, Laboratory, Store, StoreError, StoreResult};
pub use multiplexer::Multiplexer;
pub use worker::{
    BenchmarkResult, IterationResult, LocalWorker, Step, StepResult, WorkloadError,
};
