// Copyright (c) 2025 LoadLab Team
// SPDX-License-Identifier: Apache-2.0

//! Experiment configuration, sample types, and the experiment runner.

use crate::sampler::{ticker, Sampler};
use crate::scheduler::{counted, execute_concurrently, repeat, repeat_every_until, time_worker};
use crate::worker::LocalWorker;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Default workload executed when the configured workload string is empty.
pub const DEFAULT_WORKLOAD: &str = "push";

/// Capacity of the event channels between the workers and the sampler.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Classification of the event that produced a sample.
///
/// `Worker` and `Error` are defined for consumers, but the sampler tags
/// worker-delta and error events as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleType {
    /// An iteration result was folded in.
    Result,
    /// Reserved: a worker-count change.
    Worker,
    /// A one-second tick refreshed per-command throughput.
    Throughput,
    /// Reserved: a step failure.
    Error,
    /// Any other event (per-step benchmark, error, worker delta).
    Other,
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleType::Result => "Result",
            SampleType::Worker => "Worker",
            SampleType::Throughput => "Throughput",
            SampleType::Error => "Error",
            SampleType::Other => "Other",
        };
        f.write_str(name)
    }
}

/// Error for unrecognized [`SampleType`] names.
#[derive(Debug, Error)]
#[error("unknown sample type `{0}`")]
pub struct ParseSampleTypeError(String);

impl FromStr for SampleType {
    type Err = ParseSampleTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Result" => Ok(SampleType::Result),
            "Worker" => Ok(SampleType::Worker),
            "Throughput" => Ok(SampleType::Throughput),
            "Error" => Ok(SampleType::Error),
            "Other" => Ok(SampleType::Other),
            other => Err(ParseSampleTypeError(other.to_string())),
        }
    }
}

/// Running aggregate for one command name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Benchmark results observed for this command.
    pub count: u64,
    /// Results per elapsed second, refreshed on every tick.
    pub throughput: f64,
    /// Mean duration over all observed results.
    pub average: Duration,
    /// Sum of all observed durations.
    pub total_time: Duration,
    /// Most recently observed duration.
    pub last_time: Duration,
    /// Largest observed duration.
    pub worst_time: Duration,
}

/// Immutable snapshot of the running aggregates, emitted once per event the
/// sampler observes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Per-command aggregates, keyed by step name.
    pub commands: HashMap<String, Command>,
    /// Mean iteration duration.
    pub average: Duration,
    /// Sum of all iteration durations.
    pub total_time: Duration,
    /// Iterations observed so far. Monotonically non-decreasing across the
    /// emitted stream.
    pub total: u64,
    /// Step failures observed so far.
    pub total_errors: u64,
    /// Live worker count (sum of observed deltas).
    pub total_workers: i64,
    /// Duration of the most recent iteration.
    pub last_result: Duration,
    /// Rendered message of the most recent failure, if any.
    pub last_error: Option<String>,
    /// Largest observed iteration duration.
    pub worst_result: Duration,
    /// Time since the sampler started.
    pub wall_time: Duration,
    /// Classification of the event that produced this sample.
    pub kind: SampleType,
}

/// An independent consumer of the sample stream: the persistence writer, a
/// live console display, an HTTP subscriber.
pub type SampleHandler = Box<dyn FnOnce(mpsc::Receiver<Sample>) -> BoxFuture<'static, ()> + Send>;

/// Recognized experiment options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Total iteration count per round.
    pub iterations: usize,
    /// Parallel actors per round.
    pub concurrency: usize,
    /// Repeat cadence in seconds; zero means a single round.
    pub interval: u64,
    /// Total wall-clock bound in seconds; zero means unbounded.
    pub stop: u64,
    /// Comma-separated step names; empty means [`DEFAULT_WORKLOAD`].
    pub workload: String,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            iterations: 1,
            concurrency: 1,
            interval: 0,
            stop: 0,
            workload: DEFAULT_WORKLOAD.to_string(),
        }
    }
}

/// Error surfaced out of an experiment run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExperimentError {
    /// The configured concurrency was zero.
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
}

/// Cloneable handle that asks a running experiment to stop scheduling
/// further rounds. In-flight iterations finish naturally.
#[derive(Debug, Clone)]
pub struct Stopper {
    quit: Arc<watch::Sender<bool>>,
}

impl Stopper {
    /// Fires the quit signal. Idempotent.
    pub fn stop(&self) {
        let _ = self.quit.send(true);
    }
}

/// A configured experiment, ready to be driven to completion once.
pub struct RunnableExperiment {
    config: ExperimentConfig,
    worker: Arc<LocalWorker>,
    quit: Arc<watch::Sender<bool>>,
}

impl RunnableExperiment {
    /// Creates an experiment from `config`, executing steps registered on
    /// `worker`.
    pub fn new(config: ExperimentConfig, worker: Arc<LocalWorker>) -> Self {
        let (quit, _) = watch::channel(false);
        Self {
            config,
            worker,
            quit: Arc::new(quit),
        }
    }

    /// The configuration this experiment was built from.
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Handle for stopping the experiment early.
    pub fn stopper(&self) -> Stopper {
        Stopper {
            quit: self.quit.clone(),
        }
    }

    /// Drives one experiment run to completion.
    ///
    /// Spawns the sampler and `tracker`, then executes the scheduler
    /// composition on the calling task. Once the last round has finished,
    /// the iteration channel is closed; the sampler observes the close and
    /// closes the sample stream, which lets `tracker` finish. Closing the
    /// iteration channel is the final event: every benchmark, error, and
    /// worker event was published before it.
    pub async fn run(self, tracker: SampleHandler) -> Result<(), ExperimentError> {
        if self.config.concurrency == 0 {
            return Err(ExperimentError::ZeroConcurrency);
        }

        let (iteration_tx, iteration_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (benchmark_tx, benchmark_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (worker_tx, worker_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (sample_tx, sample_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = watch::channel(false);
        let mut quit_rx = self.quit.subscribe();

        let ticks = ticker(done_rx);
        let sampler = Sampler::new(
            iteration_rx,
            benchmark_rx,
            error_rx,
            worker_rx,
            ticks,
            sample_tx,
        );
        let sampler_task = tokio::spawn(sampler.run());
        let tracker_task = tokio::spawn(tracker(sample_rx));

        let workload = if self.config.workload.is_empty() {
            DEFAULT_WORKLOAD.to_string()
        } else {
            self.config.workload.clone()
        };
        info!(
            workload = %workload,
            iterations = self.config.iterations,
            concurrency = self.config.concurrency,
            interval = self.config.interval,
            stop = self.config.stop,
            "starting experiment"
        );

        repeat_every_until(
            self.config.interval,
            self.config.stop,
            || {
                let job = counted(
                    worker_tx.clone(),
                    time_worker(
                        iteration_tx.clone(),
                        benchmark_tx.clone(),
                        error_tx.clone(),
                        self.worker.clone(),
                        workload.clone(),
                    ),
                );
                execute_concurrently(self.config.concurrency, repeat(self.config.iterations, job))
            },
            &mut quit_rx,
        )
        .await;
        debug!("scheduler drained, closing iteration channel");

        // The worker tasks are gone; dropping the original senders closes
        // the event channels, iteration included.
        drop(iteration_tx);
        drop(benchmark_tx);
        drop(error_tx);
        drop(worker_tx);

        let _ = sampler_task.await;
        let _ = tracker_task.await;
        let _ = done_tx.send(true);
        info!("experiment finished");
        Ok(())
    }
}

impl fmt::Debug for RunnableExperiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableExperiment")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
