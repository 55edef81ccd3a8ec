//! `lighter` binary over the dense reference backend.

use clap::Parser;
use lighter_cli::{Cli, commands};
use lighter_core::config::Registry;
use lighter_core::dense::{self, DenseBackend};
use lighter_core::{RunOutput, Stage};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

fn main() {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing(&cli);

    if let Err(err) = run(&cli) {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

/// Human-readable stderr logging, plus a JSON file layer with `--log-json`.
fn init_tracing(cli: &Cli) -> Option<WorkerGuard> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(cli.log_filter()));

    let (json_layer, guard) = if cli.log_json {
        let log_dir = directories::ProjectDirs::from("dev", "lighter", "lighter")
            .map(|d| d.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("."));
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "lighter.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(EnvFilter::new("debug"));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let stage = cli.command.stage();
    let args = cli.command.args();

    let mut registry = Registry::<DenseBackend>::with_builtins();
    dense::register(&mut registry);

    let output: RunOutput<DenseBackend> = commands::run_stage(stage, args, registry)?;
    if stage == Stage::Predict {
        match &args.output {
            Some(path) => commands::write_predictions(path, &output.predictions)?,
            None => {
                for prediction in &output.predictions {
                    println!("{}", serde_json::to_string(&prediction.pred)?);
                }
            }
        }
    } else {
        println!("{}", commands::render_summary(&output)?);
    }
    Ok(())
}
