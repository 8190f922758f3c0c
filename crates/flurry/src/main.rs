//! Flurry CLI: ingest new and modified CSV objects into a Delta Lake table.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use flurry::{CliArgs, Config, RunOrchestrator, RunStatus, init_metrics, init_tracing, shutdown_signal};

/// Exit code for a run in which some objects failed.
const PARTIAL_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    info!("Loading config from {}", args.config.display());
    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(address) = &config.metrics.address
        && let Err(e) = init_metrics(address)
    {
        eprintln!("Failed to start metrics exporter: {e}");
        return ExitCode::FAILURE;
    }

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_clone.cancel();
    });

    let orchestrator = match RunOrchestrator::from_config(&config, shutdown).await {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Failed to initialize: {e}");
            return ExitCode::FAILURE;
        }
    };

    if args.check {
        let report = orchestrator.check().await;
        println!("{report}");
        return if report.is_healthy() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    if args.dry_run {
        return match orchestrator.detect_only().await {
            Ok(pending) => {
                println!("{} object(s) pending:", pending.len());
                for object in pending {
                    println!(
                        "  {}@{} ({} bytes)",
                        object.key, object.modification_marker, object.size_bytes
                    );
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Detection failed: {e}");
                ExitCode::FAILURE
            }
        };
    }

    match orchestrator.run().await {
        Ok(summary) => {
            println!("{summary}");
            match summary.status() {
                RunStatus::Success => ExitCode::SUCCESS,
                RunStatus::PartialFailure => ExitCode::from(PARTIAL_FAILURE),
            }
        }
        Err(e) => {
            eprintln!("Run failed: {e}");
            ExitCode::FAILURE
        }
    }
}
