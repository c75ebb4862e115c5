// Copyright (c) 2025 LoadLab Team
// SPDX-License-Identifier: Apache-2.0

//! Composable scheduling combinators.
//!
//! An experiment is assembled from small higher-order operations over
//! "a thing to do": [`repeat`] shares an iteration counter, [`counted`]
//! publishes concurrency deltas, [`time_worker`] produces the innermost
//! timed iteration, [`execute_concurrently`] fans a work function out over
//! parallel actors, and [`repeat_every_until`] repeats whole rounds on a
//! fixed cadence.

use crate::context::IterationContext;
use crate::worker::{BenchmarkResult, IterationResult, LocalWorker, WorkloadError};
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

/// A unit of schedulable work.
///
/// Cheap to clone; every clone runs the same job.
pub type WorkFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps `f` so that invocations collectively run it `n` times.
///
/// All clones of the returned work function share one counter: concurrent
/// callers each pull the next iteration off the counter until `n` have
/// started, which self-balances when individual runs have skewed durations.
pub fn repeat(n: usize, f: WorkFn) -> WorkFn {
    let remaining = Arc::new(AtomicUsize::new(n));
    Arc::new(move || {
        let remaining = remaining.clone();
        let f = f.clone();
        Box::pin(async move {
            while remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                f().await;
            }
        })
    })
}

/// Runs `f` on `workers` parallel actors and waits for all of them.
pub async fn execute_concurrently(workers: usize, f: WorkFn) {
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let f = f.clone();
        handles.push(tokio::spawn(async move { f().await }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

/// Runs `round` once when `interval` is zero; otherwise repeats it every
/// `interval` seconds until `stop` seconds have elapsed or `quit` fires.
///
/// A `stop` of zero repeats until `quit`. Firing `quit` cancels the pending
/// interval wait only; the round in flight finishes naturally.
pub async fn repeat_every_until<F, Fut>(
    interval: u64,
    stop: u64,
    mut round: F,
    quit: &mut watch::Receiver<bool>,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    if interval == 0 {
        round().await;
        return;
    }

    let start = Instant::now();
    let mut tick = time::interval_at(
        start + Duration::from_secs(interval),
        Duration::from_secs(interval),
    );
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut deadline: Option<Pin<Box<time::Sleep>>> =
        (stop > 0).then(|| Box::pin(time::sleep_until(start + Duration::from_secs(stop))));

    round().await;
    loop {
        tokio::select! {
            _ = tick.tick() => round().await,
            _ = async {
                match deadline.as_mut() {
                    Some(sleep) => sleep.await,
                    None => std::future::pending().await,
                }
            } => return,
            changed = quit.changed() => {
                if changed.is_err() || *quit.borrow() {
                    return;
                }
            }
        }
    }
}

/// Brackets `f` with `+1`/`-1` deltas on `workers` so the sampler can track
/// the live concurrency level.
pub fn counted(workers: mpsc::Sender<i64>, f: WorkFn) -> WorkFn {
    Arc::new(move || {
        let workers = workers.clone();
        let f = f.clone();
        Box::pin(async move {
            let _ = workers.send(1).await;
            f().await;
            let _ = workers.send(-1).await;
        })
    })
}

/// Produces the innermost work item: time one iteration of `workload` on
/// `worker` against a fresh context and publish its events.
///
/// Per-step benchmark results and the error, when present, are published
/// before the iteration result, so a consumer that has observed an
/// iteration has already been handed all of its step data.
pub fn time_worker(
    iterations: mpsc::Sender<IterationResult>,
    benchmarks: mpsc::Sender<BenchmarkResult>,
    errors: mpsc::Sender<WorkloadError>,
    worker: Arc<LocalWorker>,
    workload: String,
) -> WorkFn {
    Arc::new(move || {
        let iterations = iterations.clone();
        let benchmarks = benchmarks.clone();
        let errors = errors.clone();
        let worker = worker.clone();
        let workload = workload.clone();
        Box::pin(async move {
            let result = worker.time(&workload, IterationContext::new()).await;
            for step in &result.steps {
                let _ = benchmarks
                    .send(BenchmarkResult {
                        command: step.command.clone(),
                        duration: step.duration,
                    })
                    .await;
            }
            if let Some(error) = &result.error {
                let _ = errors.send(error.clone()).await;
            }
            let _ = iterations.send(result).await;
        })
    })
}
