// Copyright (c) 2025 LoadLab Team
// SPDX-License-Identifier: Apache-2.0

//! Sample stream fan-out.

use crate::experiment::{Sample, SampleHandler};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Capacity of the per-handler delivery queue.
const HANDLER_QUEUE_CAPACITY: usize = 64;

/// Duplicates one sample stream to any number of handlers.
///
/// Each handler gets its own bounded queue and its own task. A handler that
/// falls more than [`HANDLER_QUEUE_CAPACITY`] samples behind misses the
/// newest samples rather than stalling the sampler; every miss increments
/// the overflow counter.
pub struct Multiplexer {
    handlers: Vec<SampleHandler>,
    overflow: Arc<AtomicU64>,
}

impl Multiplexer {
    /// Creates a multiplexer over `handlers`.
    pub fn new(handlers: Vec<SampleHandler>) -> Self {
        Self {
            handlers,
            overflow: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of samples dropped on full handler queues.
    pub fn overflow_counter(&self) -> Arc<AtomicU64> {
        self.overflow.clone()
    }

    /// Delivers every sample on `samples` to every handler, then waits for
    /// all handlers to finish.
    pub async fn multiplex(self, mut samples: mpsc::Receiver<Sample>) {
        let mut senders = Vec::with_capacity(self.handlers.len());
        let mut tasks = Vec::with_capacity(self.handlers.len());
        for handler in self.handlers {
            let (tx, rx) = mpsc::channel(HANDLER_QUEUE_CAPACITY);
            senders.push(tx);
            tasks.push(tokio::spawn(handler(rx)));
        }

        while let Some(sample) = samples.recv().await {
            for sender in &senders {
                match sender.try_send(sample.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        let dropped = self.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(dropped, "handler queue full, dropping newest sample");
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }

        drop(senders);
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::SampleType;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn sample(total: u64) -> Sample {
        Sample {
            commands: HashMap::new(),
            average: Duration::ZERO,
            total_time: Duration::ZERO,
            total,
            total_errors: 0,
            total_workers: 0,
            last_result: Duration::ZERO,
            last_error: None,
            worst_result: Duration::ZERO,
            wall_time: Duration::ZERO,
            kind: SampleType::Result,
        }
    }

    fn collecting_handler() -> (SampleHandler, oneshot::Receiver<Vec<u64>>) {
        let (tx, rx) = oneshot::channel();
        let handler: SampleHandler = Box::new(move |mut samples| {
            Box::pin(async move {
                let mut seen = Vec::new();
                while let Some(sample) = samples.recv().await {
                    seen.push(sample.total);
                }
                let _ = tx.send(seen);
            })
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn every_handler_sees_every_sample() {
        let (first, first_seen) = collecting_handler();
        let (second, second_seen) = collecting_handler();
        let multiplexer = Multiplexer::new(vec![first, second]);

        let (tx, rx) = mpsc::channel(8);
        for total in 0..5 {
            tx.send(sample(total)).await.unwrap();
        }
        drop(tx);
        multiplexer.multiplex(rx).await;

        let expected: Vec<u64> = (0..5).collect();
        assert_eq!(first_seen.await.unwrap(), expected);
        assert_eq!(second_seen.await.unwrap(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn a_full_handler_queue_drops_newest_and_counts() {
        let (done_tx, done_rx) = oneshot::channel();
        // Stalls for a minute before reading anything; under the paused
        // clock the stall outlasts the whole forwarding loop.
        let handler: SampleHandler = Box::new(move |mut samples| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                let mut seen = 0u64;
                while samples.recv().await.is_some() {
                    seen += 1;
                }
                let _ = done_tx.send(seen);
            })
        });

        let multiplexer = Multiplexer::new(vec![handler]);
        let overflow = multiplexer.overflow_counter();

        let (tx, rx) = mpsc::channel(128);
        for total in 0..100 {
            tx.send(sample(total)).await.unwrap();
        }
        drop(tx);

        multiplexer.multiplex(rx).await;

        let delivered = done_rx.await.unwrap();
        let dropped = overflow.load(Ordering::Relaxed);
        assert_eq!(delivered, 64);
        assert_eq!(dropped, 36);
        assert_eq!(delivered + dropped, 100);
    }
}
