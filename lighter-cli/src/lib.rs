//! Lighter CLI: run a stage of a config-driven training system.
//!
//! The binary wires the dense reference backend. Projects with their own backend can reuse
//! [`Cli`] and [`commands::run_stage`] with a registry holding their components.

pub mod commands;

use clap::Parser;
use lighter_core::Stage;
use std::path::PathBuf;

/// Lighter: config-driven training runs
#[derive(Parser, Debug)]
#[command(name = "lighter", version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Also write JSON logs to a daily rolling file
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Train, validating along the way when a val dataloader is configured
    Fit(StageArgs),
    /// Run one pass over the val dataloader
    Validate(StageArgs),
    /// Run one pass over the test dataloader
    Test(StageArgs),
    /// Predict over the predict dataloader
    Predict(StageArgs),
    /// Tune hyperparameters (needs an engine with a tuner)
    Tune(StageArgs),
}

impl Commands {
    pub fn stage(&self) -> Stage {
        match self {
            Commands::Fit(_) => Stage::Fit,
            Commands::Validate(_) => Stage::Validate,
            Commands::Test(_) => Stage::Test,
            Commands::Predict(_) => Stage::Predict,
            Commands::Tune(_) => Stage::Tune,
        }
    }

    pub fn args(&self) -> &StageArgs {
        match self {
            Commands::Fit(args)
            | Commands::Validate(args)
            | Commands::Test(args)
            | Commands::Predict(args)
            | Commands::Tune(args) => args,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct StageArgs {
    /// Config file; repeat to merge several, later files win
    #[arg(short, long = "config", required = true)]
    pub config: Vec<PathBuf>,

    /// Write predictions as JSON lines to this file (predict only)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Overrides such as `trainer.max_epochs=3` or `system#optimizer#lr=0.1`
    pub overrides: Vec<String>,
}

impl Cli {
    /// Log filter for the stderr layer.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_fit_with_overrides() {
        let cli = Cli::try_parse_from([
            "lighter",
            "fit",
            "-c",
            "base.yaml",
            "--config",
            "exp.yaml",
            "trainer.max_epochs=3",
            "system#optimizer#lr=0.1",
        ])
        .unwrap();
        assert_eq!(cli.command.stage(), Stage::Fit);
        let args = cli.command.args();
        assert_eq!(
            args.config,
            vec![PathBuf::from("base.yaml"), PathBuf::from("exp.yaml")]
        );
        assert_eq!(
            args.overrides,
            vec!["trainer.max_epochs=3", "system#optimizer#lr=0.1"]
        );
        assert_eq!(cli.log_filter(), "info");
    }

    #[test]
    fn test_config_is_required() {
        assert!(Cli::try_parse_from(["lighter", "test"]).is_err());
        assert!(Cli::try_parse_from(["lighter", "train", "-c", "a.yaml"]).is_err());
    }

    #[test]
    fn test_verbosity_flags() {
        let cli = Cli::try_parse_from(["lighter", "-vv", "predict", "-c", "a.yaml"]).unwrap();
        assert_eq!(cli.log_filter(), "trace");
        let cli = Cli::try_parse_from(["lighter", "validate", "-q", "-c", "a.yaml"]).unwrap();
        assert_eq!(cli.log_filter(), "error");
        assert_eq!(cli.command.stage(), Stage::Validate);
    }
}
