// Copyright (c) 2025 LoadLab Team
// SPDX-License-Identifier: Apache-2.0

//! LoadLab CLI.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use humantime::format_duration;
use loadlab_core::{
    ExperimentConfig, Laboratory, LocalWorker, RunnableExperiment, Sample, SampleHandler,
    SampleType,
};
use loadlab_server::AppState;
use loadlab_store::{csv_string, CsvStore};
use loadlab_workloads::register_defaults;
use std::fs;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "loadlab")]
#[command(version, about = "Performance-assessment harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one experiment to completion
    Run {
        /// Iterations per round
        #[arg(short, long)]
        iterations: Option<usize>,

        /// Parallel workers
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Repeat cadence in seconds (0 runs a single round)
        #[arg(long)]
        interval: Option<u64>,

        /// Total wall-clock bound in seconds (0 means unbounded)
        #[arg(long)]
        stop: Option<u64>,

        /// Comma-separated step names
        #[arg(short, long)]
        workload: Option<String>,

        /// YAML experiment configuration; flags override its values
        #[arg(long, value_name = "FILE")]
        config: Option<String>,

        /// Directory for the CSV results
        #[arg(short, long, default_value = "output/csvs")]
        output: String,
    },

    /// Serve the experiment HTTP API
    Serve {
        /// Listen port; falls back to LOADLAB_PORT, then 8080
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory for the CSV results
        #[arg(short, long, default_value = "output/csvs")]
        output: String,
    },

    /// List stored experiments
    List {
        /// Directory holding the CSV results
        #[arg(short, long, default_value = "output/csvs")]
        output: String,
    },

    /// Print the samples of a stored experiment
    Show {
        /// Experiment identifier
        #[arg(value_name = "GUID")]
        guid: String,

        /// Print CSV instead of JSON
        #[arg(long)]
        csv: bool,

        /// Directory holding the CSV results
        #[arg(short, long, default_value = "output/csvs")]
        output: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "loadlab_core={0},loadlab_store={0},loadlab_server={0},loadlab_cli={0}",
                    log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Run {
            iterations,
            concurrency,
            interval,
            stop,
            workload,
            config,
            output,
        } => {
            run_experiment(
                iterations,
                concurrency,
                interval,
                stop,
                workload,
                config.as_deref(),
                &output,
            )
            .await
        }
        Commands::Serve { port, output } => serve_experiments(port, &output).await,
        Commands::List { output } => list_experiments(&output).await,
        Commands::Show { guid, csv, output } => show_experiment(&guid, csv, &output).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run_experiment(
    iterations: Option<usize>,
    concurrency: Option<usize>,
    interval: Option<u64>,
    stop: Option<u64>,
    workload: Option<String>,
    config_file: Option<&str>,
    output: &str,
) -> Result<()> {
    let base = match config_file {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config YAML: {}", path))?
        }
        None => ExperimentConfig::default(),
    };

    let config = ExperimentConfig {
        iterations: iterations.unwrap_or(base.iterations),
        concurrency: concurrency.unwrap_or(base.concurrency),
        interval: interval.unwrap_or(base.interval),
        stop: stop.unwrap_or(base.stop),
        workload: workload.unwrap_or(base.workload),
    };
    info!(?config, "running experiment");

    let worker = LocalWorker::new();
    register_defaults(&worker);
    let lab = Laboratory::new(Arc::new(CsvStore::new(output))).await;

    let experiment = RunnableExperiment::new(config, Arc::new(worker));
    let stopper = experiment.stopper();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n{}", "Stopping after in-flight iterations...".yellow());
            stopper.stop();
        }
    });

    let (console, finished) = console_handler();
    let (guid, handle) = lab.run_with_handlers(experiment, vec![console]);
    println!("{} {}", "Running experiment".cyan().bold(), guid);

    handle
        .await
        .context("experiment task panicked")?
        .context("experiment failed")?;

    match finished.await {
        Ok(Some(last)) => print_summary(&last),
        _ => println!("{}", "No samples were produced.".yellow()),
    }
    println!(
        "{} {}/{}.csv",
        "✓ Results written to".green().bold(),
        output,
        guid
    );

    Ok(())
}

/// Live subscriber for the sample stream: one line per throughput sample,
/// and the final snapshot handed back for the summary.
fn console_handler() -> (SampleHandler, oneshot::Receiver<Option<Sample>>) {
    let (tx, rx) = oneshot::channel();
    let handler: SampleHandler = Box::new(move |mut samples| {
        Box::pin(async move {
            let mut last: Option<Sample> = None;
            while let Some(sample) = samples.recv().await {
                if sample.kind == SampleType::Throughput {
                    print_progress(&sample);
                }
                last = Some(sample);
            }
            let _ = tx.send(last);
        })
    });
    (handler, rx)
}

fn print_progress(sample: &Sample) {
    println!(
        "  {} {} iterations  avg {}  last {}  errors {}  workers {}",
        "●".green(),
        sample.total,
        format_duration(sample.average),
        format_duration(sample.last_result),
        sample.total_errors,
        sample.total_workers
    );
}

fn print_summary(sample: &Sample) {
    println!();
    println!("{}", "Results:".cyan().bold());
    println!("  iterations  {}", sample.total);
    println!("  average     {}", format_duration(sample.average));
    println!("  worst       {}", format_duration(sample.worst_result));
    println!("  errors      {}", sample.total_errors);
    println!("  wall time   {}", format_duration(sample.wall_time));

    if !sample.commands.is_empty() {
        println!();
        println!("{}", "Per step:".cyan().bold());
        let mut names: Vec<_> = sample.commands.keys().collect();
        names.sort();
        for name in names {
            let command = &sample.commands[name];
            println!(
                "  {} count {}  avg {}  worst {}  {:.2}/s",
                name.cyan(),
                command.count,
                format_duration(command.average),
                format_duration(command.worst_time),
                command.throughput
            );
        }
    }

    if let Some(last_error) = &sample.last_error {
        println!();
        println!("{} {}", "Last error:".yellow().bold(), last_error);
    }
}

async fn serve_experiments(port: Option<u16>, output: &str) -> Result<()> {
    let worker = LocalWorker::new();
    register_defaults(&worker);
    let lab = Laboratory::new(Arc::new(CsvStore::new(output))).await;

    let state = AppState {
        lab: Arc::new(lab),
        worker: Arc::new(worker),
    };
    let port = port.unwrap_or_else(loadlab_server::port_from_env);
    println!(
        "{} http://localhost:{}/experiments/",
        "Serving on".cyan().bold(),
        port
    );

    loadlab_server::serve(state, port).await
}

async fn list_experiments(output: &str) -> Result<()> {
    let lab = Laboratory::new(Arc::new(CsvStore::new(output))).await;

    let mut count = 0;
    lab.visit(|experiment| {
        count += 1;
        println!(
            "{}  {}",
            experiment
                .started_at()
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
                .dimmed(),
            experiment.guid().cyan()
        );
    })
    .await;

    if count == 0 {
        println!("{}", "No experiments stored.".dimmed());
    }
    Ok(())
}

async fn show_experiment(guid: &str, csv: bool, output: &str) -> Result<()> {
    let lab = Laboratory::new(Arc::new(CsvStore::new(output))).await;

    let samples = lab.sample_data(guid).await?;
    if samples.is_empty() {
        bail!("no experiment with guid {}", guid);
    }

    if csv {
        print!("{}", csv_string(&samples));
    } else {
        println!("{}", serde_json::to_string_pretty(&samples)?);
    }
    Ok(())
}
