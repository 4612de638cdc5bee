//! Archive Pipeline Binary
//!
//! Runs the structural half of the pipeline (split, chunk) over one export
//! with the fixed-stride breakpoint decider. Model-backed stages need
//! collaborators wired in through the library API and are reported as
//! skipped here.
//!
//! ## Configuration
//!
//! Environment variables (see `archive_resegmenter::config` for the full list):
//! - `ARCHIVE_INPUT`: export file to split
//! - `ARCHIVE_BASE_DIR`: base output directory (default: archive)
//! - `ARCHIVE_ONLY_STAGE` / `ARCHIVE_FROM_STAGE`: stage selection
//! - `RUST_LOG`: Log level filter (default: archive_resegmenter=info)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: json)
//!
//! ## Usage
//!
//! ```bash
//! ARCHIVE_INPUT=conversations.json ARCHIVE_BASE_DIR=out cargo run --bin archive_pipeline
//! ```

use std::process::ExitCode;
use std::time::Instant;

use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use archive_resegmenter::{CancellationToken, Pipeline, PipelineConfig};

/// Initialize the tracing subscriber with JSON or pretty format
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "archive_resegmenter=info,archive_pipeline=info".into());

    if log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true),
            )
            .init();
    }
}

fn main() -> ExitCode {
    init_tracing();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting archive pipeline");

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(2);
        }
    };

    info!(
        input = ?config.input,
        base_dir = %config.out_dir.display(),
        stages = ?config.stages,
        target_turns = config.target_turns_per_chunk,
        "Configuration loaded"
    );

    let started = Instant::now();
    let pipeline = Pipeline::new(config);

    match pipeline.run(&CancellationToken::new()) {
        Ok(report) => {
            info!(
                threads_written = report.split.as_ref().map(|s| s.threads_written),
                chunks_written = report.chunk.as_ref().map(|c| c.chunk_paths.len()),
                skipped_stages = ?report.skipped,
                latency_ms = started.elapsed().as_millis() as u64,
                "Pipeline complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, latency_ms = started.elapsed().as_millis() as u64, "Pipeline failed");
            ExitCode::FAILURE
        }
    }
}
