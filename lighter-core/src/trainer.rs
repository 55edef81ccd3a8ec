//! A single-process reference engine.
//!
//! Drives a [`System`] through `fit`, `validate`, `test` and `predict` the way a full
//! training engine would, minus distribution, checkpointing and callbacks.

use crate::backend::Backend;
use crate::error::{LighterError, Result};
use crate::logging::{LoggerConfig, StatsLogger};
use crate::mode::{Mode, Stage};
use crate::system::{Prediction, StepContext, StepResult, System};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// The `trainer` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerConfig {
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default)]
    pub limit_train_batches: Option<usize>,
    #[serde(default)]
    pub limit_val_batches: Option<usize>,
    #[serde(default)]
    pub limit_test_batches: Option<usize>,
    #[serde(default)]
    pub limit_predict_batches: Option<usize>,
    #[serde(default = "default_check_val_every_n_epoch")]
    pub check_val_every_n_epoch: usize,
    #[serde(default)]
    pub seed: u64,
    /// `null` disables stats logging.
    #[serde(default = "default_logger")]
    pub logger: Option<LoggerConfig>,
}

fn default_max_epochs() -> usize {
    1
}

fn default_check_val_every_n_epoch() -> usize {
    1
}

fn default_logger() -> Option<LoggerConfig> {
    Some(LoggerConfig::Tracing)
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            limit_train_batches: None,
            limit_val_batches: None,
            limit_test_batches: None,
            limit_predict_batches: None,
            check_val_every_n_epoch: default_check_val_every_n_epoch(),
            seed: 0,
            logger: default_logger(),
        }
    }
}

impl TrainerConfig {
    fn limit(&self, mode: Mode) -> Option<usize> {
        match mode {
            Mode::Train => self.limit_train_batches,
            Mode::Val => self.limit_val_batches,
            Mode::Test => self.limit_test_batches,
            Mode::Predict => self.limit_predict_batches,
        }
    }
}

/// What one pass over a dataloader produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochSummary {
    pub mode: Mode,
    pub epoch: usize,
    pub batches: usize,
    /// Mean of the per-batch losses. `None` when the mode computes no loss.
    pub loss: Option<f64>,
    /// Accumulated metric values.
    pub metrics: BTreeMap<String, f64>,
    /// Epoch-level records emitted by the stats logger.
    pub logged: BTreeMap<String, f64>,
}

/// Everything a stage produced.
#[derive(Debug, Clone)]
pub struct RunOutput<B: Backend> {
    pub stage: Stage,
    pub epochs: Vec<EpochSummary>,
    pub predictions: Vec<Prediction<B>>,
}

pub struct Trainer {
    config: TrainerConfig,
    logger: StatsLogger,
    global_step: usize,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Result<Self> {
        let logger = StatsLogger::from_config(config.logger.as_ref())?;
        Ok(Self::with_logger(config, logger))
    }

    pub fn with_logger(config: TrainerConfig, logger: StatsLogger) -> Self {
        Self {
            config,
            logger,
            global_step: 0,
        }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Run `stage` with its `args.<stage>` keyword arguments.
    pub fn run<B: Backend>(
        &mut self,
        stage: Stage,
        system: &mut System<B>,
        args: &Map<String, Value>,
    ) -> Result<RunOutput<B>> {
        for (key, value) in args {
            if key == "ckpt_path" {
                warn!(%value, "checkpoint loading is not supported by the reference trainer; ignoring ckpt_path");
            } else {
                debug!(%key, "ignoring unsupported stage argument");
            }
        }
        info!(%stage, "starting");
        let mut output = RunOutput {
            stage,
            epochs: Vec::new(),
            predictions: Vec::new(),
        };
        match stage {
            Stage::Fit => output.epochs = self.fit(system)?,
            Stage::Validate => output.epochs.push(self.validate(system)?),
            Stage::Test => output.epochs.push(self.test(system)?),
            Stage::Predict => output.predictions = self.predict(system)?,
            Stage::Tune => {
                return Err(LighterError::Unsupported(
                    "`tune` needs an engine with a tuner; the reference trainer has none".into(),
                ));
            }
        }
        Ok(output)
    }

    /// Train for `max_epochs`, validating every `check_val_every_n_epoch` epochs when a val
    /// dataloader exists, and stepping the scheduler after each epoch.
    pub fn fit<B: Backend>(&mut self, system: &mut System<B>) -> Result<Vec<EpochSummary>> {
        system.configure_optimizers()?;
        let mut summaries = Vec::new();
        let every = self.config.check_val_every_n_epoch.max(1);
        for epoch in 0..self.config.max_epochs {
            summaries.push(self.run_epoch(system, Mode::Train, epoch)?);
            if system.has_dataloader(Mode::Val) && (epoch + 1) % every == 0 {
                summaries.push(self.run_epoch(system, Mode::Val, epoch)?);
            }
            system.scheduler_step();
        }
        Ok(summaries)
    }

    pub fn validate<B: Backend>(&mut self, system: &mut System<B>) -> Result<EpochSummary> {
        self.run_epoch(system, Mode::Val, 0)
    }

    pub fn test<B: Backend>(&mut self, system: &mut System<B>) -> Result<EpochSummary> {
        self.run_epoch(system, Mode::Test, 0)
    }

    pub fn predict<B: Backend>(&mut self, system: &mut System<B>) -> Result<Vec<Prediction<B>>> {
        let loader = system.dataloader(Mode::Predict, self.config.seed)?;
        let limit = self.config.limit(Mode::Predict).unwrap_or(usize::MAX);
        let mut predictions = Vec::new();
        for (batch_idx, batch) in loader.enumerate().take(limit) {
            let mut ctx = StepContext::new(&mut self.logger).at(0, self.global_step);
            predictions.push(system.predict_step(batch?, batch_idx, &mut ctx)?);
        }
        info!(batches = predictions.len(), "prediction complete");
        Ok(predictions)
    }

    fn run_epoch<B: Backend>(
        &mut self,
        system: &mut System<B>,
        mode: Mode,
        epoch: usize,
    ) -> Result<EpochSummary> {
        let loader = system.dataloader(mode, self.config.seed.wrapping_add(epoch as u64))?;
        let limit = self.config.limit(mode).unwrap_or(usize::MAX);
        system.reset_metrics(mode);

        let mut batches = 0;
        let mut losses = Vec::new();
        for (batch_idx, batch) in loader.enumerate().take(limit) {
            let batch = batch?;
            let mut ctx = StepContext::new(&mut self.logger).at(epoch, self.global_step);
            let result: StepResult<B> = match mode {
                Mode::Train => system.training_step(batch, batch_idx, &mut ctx)?,
                Mode::Val => system.validation_step(batch, batch_idx, &mut ctx)?,
                Mode::Test => system.test_step(batch, batch_idx, &mut ctx)?,
                Mode::Predict => {
                    return Err(LighterError::Unsupported(
                        "predict batches are not part of an epoch".into(),
                    ));
                }
            };
            if let Some(loss) = &result.loss {
                losses.push(B::scalar_value(loss));
                if mode == Mode::Train {
                    system.optimizer_step(loss)?;
                }
            }
            if mode == Mode::Train {
                self.global_step += 1;
            }
            batches += 1;
        }

        let logged = self.logger.end_epoch(mode, epoch)?;
        let summary = EpochSummary {
            mode,
            epoch,
            batches,
            loss: (!losses.is_empty()).then(|| losses.iter().sum::<f64>() / losses.len() as f64),
            metrics: system.compute_metrics(mode),
            logged,
        };
        info!(%mode, epoch, batches, loss = ?summary.loss, metrics = ?summary.metrics, "epoch complete");
        Ok(summary)
    }
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("config", &self.config)
            .field("logger", &self.logger)
            .field("global_step", &self.global_step)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trainer_config_defaults() {
        let config: TrainerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, TrainerConfig::default());
        assert_eq!(config.max_epochs, 1);
        assert_eq!(config.logger, Some(LoggerConfig::Tracing));
    }

    #[test]
    fn test_trainer_config_null_logger() {
        let config: TrainerConfig = serde_yaml::from_str("logger: null\nmax_epochs: 3").unwrap();
        assert_eq!(config.logger, None);
        assert_eq!(config.max_epochs, 3);
        assert!(serde_yaml::from_str::<TrainerConfig>("epochs: 3").is_err());
    }

    #[test]
    fn test_limits_per_mode() {
        let config: TrainerConfig = serde_yaml::from_str("limit_val_batches: 2").unwrap();
        assert_eq!(config.limit(Mode::Val), Some(2));
        assert_eq!(config.limit(Mode::Train), None);
    }
}
