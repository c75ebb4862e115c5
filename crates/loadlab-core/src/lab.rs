// Copyright (c) 2025 LoadLab Team
// SPDX-License-Identifier: Apache-2.0

//! The laboratory: launches experiments, fans their sample streams out to
//! handlers, and serves previously-run experiments from a [`Store`].

use crate::experiment::{ExperimentError, RunnableExperiment, Sample, SampleHandler};
use crate::multiplexer::Multiplexer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Error raised by sample stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored sample data could not be decoded.
    #[error("malformed sample data: {0}")]
    Malformed(String),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A previously-run experiment exposed by a store.
#[async_trait]
pub trait Experiment: Send + Sync {
    /// The opaque identifier assigned when the experiment was launched.
    fn guid(&self) -> &str;

    /// When the experiment's samples were first persisted.
    fn started_at(&self) -> DateTime<Utc>;

    /// The stored sample sequence.
    async fn samples(&self) -> StoreResult<Vec<Sample>>;
}

/// Persistence supplied to the laboratory.
///
/// The laboratory treats the store as opaque: it only asks for a writer
/// handler per launched experiment and for the list of stored ones.
#[async_trait]
pub trait Store: Send + Sync {
    /// A handler that persists the sample stream of experiment `guid`.
    fn writer(&self, guid: &str) -> SampleHandler;

    /// All experiments currently persisted.
    async fn load_all(&self) -> StoreResult<Vec<Arc<dyn Experiment>>>;
}

/// Runs experiments and answers questions about past ones.
pub struct Laboratory {
    store: Arc<dyn Store>,
    loaded: RwLock<Vec<Arc<dyn Experiment>>>,
}

impl Laboratory {
    /// Creates a laboratory over `store` and loads the existing experiment
    /// list.
    pub async fn new(store: Arc<dyn Store>) -> Self {
        let lab = Self {
            store,
            loaded: RwLock::new(Vec::new()),
        };
        lab.reload().await;
        lab
    }

    async fn reload(&self) {
        match self.store.load_all().await {
            Ok(experiments) => *self.loaded.write() = experiments,
            Err(error) => warn!(%error, "failed to reload the experiment list"),
        }
    }

    /// Launches `experiment` with only the persistence handler attached.
    ///
    /// Returns the fresh experiment guid and a handle that resolves when
    /// the run has completed and every handler has finished.
    pub fn run(
        &self,
        experiment: RunnableExperiment,
    ) -> (String, JoinHandle<Result<(), ExperimentError>>) {
        self.run_with_handlers(experiment, Vec::new())
    }

    /// Launches `experiment`, delivering its samples to the persistence
    /// handler plus every handler in `additional`.
    pub fn run_with_handlers(
        &self,
        experiment: RunnableExperiment,
        additional: Vec<SampleHandler>,
    ) -> (String, JoinHandle<Result<(), ExperimentError>>) {
        let guid = Uuid::new_v4().to_string();
        let mut handlers = vec![self.store.writer(&guid)];
        handlers.extend(additional);

        info!(guid = %guid, handlers = handlers.len(), "launching experiment");
        let multiplexer = Multiplexer::new(handlers);
        let handle = tokio::spawn(
            experiment.run(Box::new(move |samples| Box::pin(multiplexer.multiplex(samples)))),
        );
        (guid, handle)
    }

    /// Reloads the experiment list from the store and visits each entry.
    pub async fn visit<F>(&self, mut f: F)
    where
        F: FnMut(&dyn Experiment),
    {
        self.reload().await;
        for experiment in self.loaded.read().iter() {
            f(experiment.as_ref());
        }
    }

    /// The stored samples for `guid`; empty when the identifier is unknown.
    pub async fn sample_data(&self, guid: &str) -> StoreResult<Vec<Sample>> {
        self.reload().await;
        let found = self
            .loaded
            .read()
            .iter()
            .find(|e| e.guid() == guid)
            .cloned();
        match found {
            Some(experiment) => experiment.samples().await,
            None => Ok(Vec::new()),
        }
    }
}
