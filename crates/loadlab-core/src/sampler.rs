// Copyright (c) 2025 LoadLab Team
// SPDX-License-Identifier: Apache-2.0

//! Single-threaded fusion of experiment events into sample snapshots.
//!
//! The sampler is the sole owner of all aggregate state. It consumes the
//! iteration, benchmark, error, and worker channels plus a one-second tick,
//! and emits exactly one [`Sample`] per observed event. It terminates when
//! the iteration channel closes, which the runner guarantees is the final
//! event of an experiment.

use crate::experiment::{Command, Sample, SampleType};
use crate::worker::{BenchmarkResult, IterationResult, WorkloadError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

/// Spawns the 1 Hz tick source.
///
/// Delivers an incrementing whole-second counter, the first one a second
/// after the call. The task exits when `done` fires or when the receiving
/// half is dropped; late ticks after the experiment ends are discarded.
pub(crate) fn ticker(mut done: watch::Receiver<bool>) -> mpsc::Receiver<u64> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut tick = time::interval_at(
            Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut seconds: u64 = 0;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    seconds += 1;
                    if tx.send(seconds).await.is_err() {
                        return;
                    }
                }
                _ = done.changed() => return,
            }
        }
    });
    rx
}

/// The single consumer of all event channels.
pub(crate) struct Sampler {
    iterations: mpsc::Receiver<IterationResult>,
    benchmarks: mpsc::Receiver<BenchmarkResult>,
    errors: mpsc::Receiver<WorkloadError>,
    workers: mpsc::Receiver<i64>,
    ticks: mpsc::Receiver<u64>,
    samples: mpsc::Sender<Sample>,
}

impl Sampler {
    pub(crate) fn new(
        iterations: mpsc::Receiver<IterationResult>,
        benchmarks: mpsc::Receiver<BenchmarkResult>,
        errors: mpsc::Receiver<WorkloadError>,
        workers: mpsc::Receiver<i64>,
        ticks: mpsc::Receiver<u64>,
        samples: mpsc::Sender<Sample>,
    ) -> Self {
        Self {
            iterations,
            benchmarks,
            errors,
            workers,
            ticks,
            samples,
        }
    }

    /// Consumes events until the iteration channel closes, emitting one
    /// snapshot per event. Dropping `self.samples` on return is what closes
    /// the sample stream for downstream consumers.
    pub(crate) async fn run(mut self) {
        let mut commands: HashMap<String, Command> = HashMap::new();
        let mut total: u64 = 0;
        let mut total_time = Duration::ZERO;
        let mut average = Duration::ZERO;
        let mut last_result = Duration::ZERO;
        let mut worst_result = Duration::ZERO;
        let mut last_error: Option<String> = None;
        let mut total_errors: u64 = 0;
        let mut total_workers: i64 = 0;
        let started = Instant::now();

        loop {
            let mut kind = SampleType::Other;

            // Biased toward the per-step channels: every benchmark, error,
            // and worker event enqueued ahead of an iteration result is
            // folded before that result, and before close is observed.
            tokio::select! {
                biased;
                Some(benchmark) = self.benchmarks.recv() => {
                    let command = commands.entry(benchmark.command).or_default();
                    command.count += 1;
                    command.total_time += benchmark.duration;
                    command.last_time = benchmark.duration;
                    command.average = command.total_time / command.count.max(1) as u32;
                    if benchmark.duration > command.worst_time {
                        command.worst_time = benchmark.duration;
                    }
                }
                Some(error) = self.errors.recv() => {
                    // Error events keep the `Other` tag; the `Error`
                    // variant stays reserved.
                    last_error = Some(error.to_string());
                    total_errors += 1;
                }
                Some(delta) = self.workers.recv() => {
                    total_workers += delta;
                }
                Some(seconds) = self.ticks.recv() => {
                    kind = SampleType::Throughput;
                    for command in commands.values_mut() {
                        command.throughput = command.count as f64 / seconds as f64;
                    }
                }
                result = self.iterations.recv() => match result {
                    Some(iteration) => {
                        kind = SampleType::Result;
                        total += 1;
                        total_time += iteration.duration;
                        average = total_time / total.max(1) as u32;
                        last_result = iteration.duration;
                        if iteration.duration > worst_result {
                            worst_result = iteration.duration;
                        }
                    }
                    None => {
                        debug!(total, total_errors, "iteration channel closed, sampler done");
                        return;
                    }
                },
            }

            let sample = Sample {
                commands: commands.clone(),
                average,
                total_time,
                total,
                total_errors,
                total_workers,
                last_result,
                last_error: last_error.clone(),
                worst_result,
                wall_time: started.elapsed(),
                kind,
            };
            if self.samples.send(sample).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::EVENT_CHANNEL_CAPACITY;
    use crate::worker::StepResult;
    use tokio_test::assert_err;

    struct Channels {
        iterations: mpsc::Sender<IterationResult>,
        benchmarks: mpsc::Sender<BenchmarkResult>,
        errors: mpsc::Sender<WorkloadError>,
        workers: mpsc::Sender<i64>,
        ticks: mpsc::Sender<u64>,
        samples: mpsc::Receiver<Sample>,
    }

    fn start_sampler() -> Channels {
        let (iteration_tx, iteration_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (benchmark_tx, benchmark_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (worker_tx, worker_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (tick_tx, tick_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (sample_tx, sample_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let sampler = Sampler::new(
            iteration_rx,
            benchmark_rx,
            error_rx,
            worker_rx,
            tick_rx,
            sample_tx,
        );
        tokio::spawn(sampler.run());

        Channels {
            iterations: iteration_tx,
            benchmarks: benchmark_tx,
            errors: error_tx,
            workers: worker_tx,
            ticks: tick_tx,
            samples: sample_rx,
        }
    }

    fn iteration(duration: Duration) -> IterationResult {
        IterationResult {
            duration,
            steps: vec![StepResult {
                command: "noop".to_string(),
                duration,
                error: None,
            }],
            error: None,
        }
    }

    #[tokio::test]
    async fn iteration_results_update_the_totals() {
        let mut ch = start_sampler();

        ch.iterations
            .send(iteration(Duration::from_secs(2)))
            .await
            .unwrap();
        ch.iterations
            .send(iteration(Duration::from_secs(4)))
            .await
            .unwrap();

        let first = ch.samples.recv().await.unwrap();
        assert_eq!(first.kind, SampleType::Result);
        assert_eq!(first.total, 1);
        assert_eq!(first.average, Duration::from_secs(2));
        assert_eq!(first.last_result, Duration::from_secs(2));

        let second = ch.samples.recv().await.unwrap();
        assert_eq!(second.total, 2);
        assert_eq!(second.total_time, Duration::from_secs(6));
        assert_eq!(second.average, Duration::from_secs(3));
        assert_eq!(second.worst_result, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn benchmarks_aggregate_per_command() {
        let mut ch = start_sampler();

        ch.benchmarks
            .send(BenchmarkResult {
                command: "push".to_string(),
                duration: Duration::from_secs(1),
            })
            .await
            .unwrap();
        ch.benchmarks
            .send(BenchmarkResult {
                command: "push".to_string(),
                duration: Duration::from_secs(3),
            })
            .await
            .unwrap();

        let first = ch.samples.recv().await.unwrap();
        assert_eq!(first.kind, SampleType::Other);
        assert_eq!(first.commands["push"].count, 1);

        let second = ch.samples.recv().await.unwrap();
        let push = &second.commands["push"];
        assert_eq!(push.count, 2);
        assert_eq!(push.total_time, Duration::from_secs(4));
        assert_eq!(push.average, Duration::from_secs(2));
        assert_eq!(push.last_time, Duration::from_secs(3));
        assert_eq!(push.worst_time, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn errors_are_counted_and_tagged_other() {
        let mut ch = start_sampler();

        ch.errors
            .send(WorkloadError::UnknownStep("zap".to_string()))
            .await
            .unwrap();

        let sample = ch.samples.recv().await.unwrap();
        assert_eq!(sample.kind, SampleType::Other);
        assert_eq!(sample.total_errors, 1);
        assert!(sample.last_error.as_deref().unwrap().contains("zap"));
    }

    #[tokio::test]
    async fn worker_deltas_accumulate() {
        let mut ch = start_sampler();

        for delta in [1, 1, -1] {
            ch.workers.send(delta).await.unwrap();
        }

        assert_eq!(ch.samples.recv().await.unwrap().total_workers, 1);
        assert_eq!(ch.samples.recv().await.unwrap().total_workers, 2);
        assert_eq!(ch.samples.recv().await.unwrap().total_workers, 1);
    }

    #[tokio::test]
    async fn ticks_refresh_throughput() {
        let mut ch = start_sampler();

        for _ in 0..6 {
            ch.benchmarks
                .send(BenchmarkResult {
                    command: "push".to_string(),
                    duration: Duration::from_millis(10),
                })
                .await
                .unwrap();
            ch.samples.recv().await.unwrap();
        }
        ch.ticks.send(2).await.unwrap();

        let sample = ch.samples.recv().await.unwrap();
        assert_eq!(sample.kind, SampleType::Throughput);
        assert!((sample.commands["push"].throughput - 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn step_events_fold_before_their_iteration() {
        let (iteration_tx, iteration_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (benchmark_tx, benchmark_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (_worker_tx, worker_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (_tick_tx, tick_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (sample_tx, mut sample_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        // Both events are enqueued before the sampler starts; the biased
        // select must fold the benchmark first.
        benchmark_tx
            .send(BenchmarkResult {
                command: "push".to_string(),
                duration: Duration::from_secs(1),
            })
            .await
            .unwrap();
        iteration_tx
            .send(iteration(Duration::from_secs(1)))
            .await
            .unwrap();

        let sampler = Sampler::new(
            iteration_rx,
            benchmark_rx,
            error_rx,
            worker_rx,
            tick_rx,
            sample_tx,
        );
        tokio::spawn(sampler.run());
        drop(error_tx);

        let first = sample_rx.recv().await.unwrap();
        assert_eq!(first.kind, SampleType::Other);
        assert_eq!(first.commands["push"].count, 1);

        let second = sample_rx.recv().await.unwrap();
        assert_eq!(second.kind, SampleType::Result);
        assert_eq!(second.total, 1);
        assert_eq!(second.commands["push"].count, 1);
    }

    #[tokio::test]
    async fn closing_the_iteration_channel_ends_the_stream() {
        let Channels {
            iterations,
            benchmarks,
            errors,
            workers,
            ticks,
            mut samples,
        } = start_sampler();

        iterations
            .send(iteration(Duration::from_secs(1)))
            .await
            .unwrap();
        samples.recv().await.unwrap();

        drop(iterations);

        // The remaining senders stay open; the sampler still terminates.
        assert!(samples.recv().await.is_none());
        drop((benchmarks, errors, workers, ticks));
    }

    #[tokio::test]
    async fn emits_exactly_one_sample_per_event() {
        let mut ch = start_sampler();

        ch.iterations
            .send(iteration(Duration::from_secs(1)))
            .await
            .unwrap();
        ch.workers.send(1).await.unwrap();
        ch.errors
            .send(WorkloadError::UnknownStep("x".to_string()))
            .await
            .unwrap();

        for _ in 0..3 {
            ch.samples.recv().await.unwrap();
        }
        assert_err!(ch.samples.try_recv());
    }
}
