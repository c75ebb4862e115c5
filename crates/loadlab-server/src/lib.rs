// Copyright (c) 2025 LoadLab Team
// SPDX-License-Identifier: Apache-2.0

//! HTTP adapter over the laboratory.
//!
//! Endpoints:
//!
//! - `GET /experiments/` lists stored experiments.
//! - `GET /experiments/{guid}` returns an experiment's samples as JSON.
//! - `GET /experiments/{guid}.csv` returns them in the stable CSV layout.
//! - `POST /experiments/` launches an experiment from the optional form
//!   fields `iterations`, `concurrency`, and `workload`.

use axum::extract::{Form, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use loadlab_core::{
    ExperimentConfig, Laboratory, LocalWorker, RunnableExperiment, Sample, DEFAULT_WORKLOAD,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Name of the environment variable holding the listen port.
pub const PORT_VAR: &str = "LOADLAB_PORT";

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    /// Laboratory used to launch and look up experiments.
    pub lab: Arc<Laboratory>,
    /// Worker carrying the registered workload steps.
    pub worker: Arc<LocalWorker>,
}

/// Builds the experiment router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/experiments/",
            get(list_experiments).post(create_experiment),
        )
        .route("/experiments/:guid", get(get_experiment))
        .with_state(state)
}

/// Binds `port` on all interfaces and serves the router until the process
/// ends.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "experiment server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// The listen port from [`PORT_VAR`], defaulting to 8080.
pub fn port_from_env() -> u16 {
    parse_port(std::env::var(PORT_VAR).ok())
}

fn parse_port(value: Option<String>) -> u16 {
    value.and_then(|port| port.parse().ok()).unwrap_or(8080)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ListResponse<T> {
    items: Vec<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ExperimentSummary {
    name: String,
    location: String,
    csv_location: String,
    state: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedResponse {
    location: String,
    csv_location: String,
}

#[derive(Debug, Deserialize)]
struct CreateExperiment {
    iterations: Option<usize>,
    concurrency: Option<usize>,
    workload: Option<String>,
}

async fn list_experiments(State(state): State<AppState>) -> Json<ListResponse<ExperimentSummary>> {
    let mut items = Vec::new();
    state
        .lab
        .visit(|experiment| {
            let guid = experiment.guid();
            items.push(ExperimentSummary {
                name: format!("Experiment ({guid})"),
                location: format!("/experiments/{guid}"),
                csv_location: format!("/experiments/{guid}.csv"),
                state: "Unknown".to_string(),
            });
        })
        .await;
    Json(ListResponse { items })
}

async fn get_experiment(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    // A `.csv` suffix selects the CSV rendering of the same experiment.
    let (guid, as_csv) = match guid.strip_suffix(".csv") {
        Some(stem) => (stem.to_string(), true),
        None => (guid, false),
    };

    let samples: Vec<Sample> = state
        .lab
        .sample_data(&guid)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if as_csv {
        let body = loadlab_store::csv_string(&samples);
        Ok(([(header::CONTENT_TYPE, "text/csv")], body).into_response())
    } else {
        Ok(Json(ListResponse { items: samples }).into_response())
    }
}

async fn create_experiment(
    State(state): State<AppState>,
    Form(form): Form<CreateExperiment>,
) -> Response {
    let config = ExperimentConfig {
        iterations: form.iterations.unwrap_or(1),
        concurrency: form.concurrency.unwrap_or(1),
        interval: 0,
        stop: 0,
        workload: form
            .workload
            .filter(|workload| !workload.is_empty())
            .unwrap_or_else(|| DEFAULT_WORKLOAD.to_string()),
    };
    info!(?config, "launching experiment over http");

    let experiment = RunnableExperiment::new(config, state.worker.clone());
    let (guid, _handle) = state.lab.run(experiment);

    let location = format!("/experiments/{guid}");
    let body = CreatedResponse {
        location: location.clone(),
        csv_location: format!("/experiments/{guid}.csv"),
    };
    ([(header::LOCATION, location)], Json(body)).into_response()
}
