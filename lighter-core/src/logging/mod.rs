//! Step and epoch statistics logging.
//!
//! Every step's loss, metrics and (once per epoch) optimizer hyperparameters are sent to a
//! [`LogBackend`] under flat names such as `train/loss/step` or `val/metrics/mae/epoch`.
//! Step records go out immediately and stay local to the replica. Epoch records are
//! accumulated as batch-size weighted sums, combined across replicas by a [`Reducer`] in
//! [`StatsLogger::end_epoch`], and emitted as weighted means.

pub mod backends;
pub mod reduce;

pub use backends::{JsonlBackend, MemoryBackend, TracingBackend};
pub use reduce::{LocalReducer, Reducer};

use crate::criterion::Loss;
use crate::error::Result;
use crate::mode::Mode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Whether a record describes one step or a whole epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum LogScope {
    Step { global_step: usize },
    Epoch { epoch: usize },
}

/// A single named value sent to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub name: String,
    pub value: f64,
    #[serde(flatten)]
    pub scope: LogScope,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(name: impl Into<String>, value: f64, scope: LogScope) -> Self {
        Self {
            name: name.into(),
            value,
            scope,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for log records.
pub trait LogBackend: Send {
    fn record(&mut self, record: &LogRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// `trainer.logger` in the config. `null` disables logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoggerConfig {
    Tracing,
    Jsonl { path: PathBuf },
}

impl LoggerConfig {
    pub fn build(&self) -> Result<Box<dyn LogBackend>> {
        match self {
            LoggerConfig::Tracing => Ok(Box::new(TracingBackend)),
            LoggerConfig::Jsonl { path } => Ok(Box::new(JsonlBackend::create(path)?)),
        }
    }
}

/// What one step reports to the logger.
#[derive(Debug, Clone, Copy)]
pub struct StepStats<'a> {
    pub mode: Mode,
    pub loss: Option<&'a Loss<f64>>,
    pub metrics: Option<&'a BTreeMap<String, f64>>,
    /// Optimizer hyperparameters, keyed as produced by [`crate::optim::optimizer_stats`].
    pub optimizer: Option<&'a BTreeMap<String, f64>>,
    pub batch_idx: usize,
    pub batch_size: usize,
    pub global_step: usize,
}

/// Weighted running sums for epoch-level records, keyed by full record name.
#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    entries: BTreeMap<String, (f64, f64)>,
}

impl EpochAccumulator {
    pub fn add(&mut self, name: impl Into<String>, value: f64, weight: f64) {
        let entry = self.entries.entry(name.into()).or_insert((0.0, 0.0));
        entry.0 += value * weight;
        entry.1 += weight;
    }

    /// Remove and return every `(name, weighted_sum, weight)` whose name starts with `prefix`.
    pub fn drain_prefix(&mut self, prefix: &str) -> Vec<(String, f64, f64)> {
        let names: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        names
            .into_iter()
            .filter_map(|name| {
                self.entries
                    .remove(&name)
                    .map(|(sum, weight)| (name, sum, weight))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sends step statistics to an optional backend.
pub struct StatsLogger {
    backend: Option<Box<dyn LogBackend>>,
    reducer: Box<dyn Reducer>,
    accumulator: EpochAccumulator,
}

impl StatsLogger {
    /// A logger that drops everything.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            reducer: Box::new(LocalReducer),
            accumulator: EpochAccumulator::default(),
        }
    }

    pub fn new(backend: Box<dyn LogBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::disabled()
        }
    }

    pub fn from_config(config: Option<&LoggerConfig>) -> Result<Self> {
        match config {
            Some(config) => Ok(Self::new(config.build()?)),
            None => Ok(Self::disabled()),
        }
    }

    pub fn with_reducer(mut self, reducer: Box<dyn Reducer>) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Log one step. A no-op when no backend is attached.
    pub fn log_stats(&mut self, stats: StepStats<'_>) -> Result<()> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        let mode = stats.mode;
        let weight = stats.batch_size as f64;
        let step_scope = LogScope::Step {
            global_step: stats.global_step,
        };

        let mut step_values: Vec<(String, f64)> = Vec::new();
        match stats.loss {
            Some(Loss::Scalar(value)) => step_values.push((format!("{mode}/loss"), *value)),
            Some(Loss::Terms(terms)) => {
                for (name, value) in terms {
                    step_values.push((format!("{mode}/loss/{name}"), *value));
                }
            }
            None => {}
        }
        if let Some(metrics) = stats.metrics {
            for (name, value) in metrics {
                step_values.push((format!("{mode}/metrics/{name}"), *value));
            }
        }

        for (base, value) in step_values {
            backend.record(&LogRecord::new(format!("{base}/step"), value, step_scope))?;
            self.accumulator.add(format!("{base}/epoch"), value, weight);
        }

        if mode == Mode::Train && stats.batch_idx == 0 {
            if let Some(optimizer) = stats.optimizer {
                for (name, value) in optimizer {
                    self.accumulator.add(format!("{mode}/{name}"), *value, weight);
                }
            }
        }
        Ok(())
    }

    /// Reduce and emit the epoch-level records of `mode`. Returns the emitted values.
    ///
    /// Every replica must call this with the same accumulated names, since values are
    /// reduced positionally in name order.
    pub fn end_epoch(&mut self, mode: Mode, epoch: usize) -> Result<BTreeMap<String, f64>> {
        let entries = self.accumulator.drain_prefix(&format!("{mode}/"));
        let Some(backend) = self.backend.as_mut() else {
            return Ok(BTreeMap::new());
        };

        let mut buffer: Vec<f64> = entries
            .iter()
            .flat_map(|(_, sum, weight)| [*sum, *weight])
            .collect();
        self.reducer.all_reduce_sum(&mut buffer)?;

        let mut values = BTreeMap::new();
        let scope = LogScope::Epoch { epoch };
        for ((name, _, _), pair) in entries.into_iter().zip(buffer.chunks(2)) {
            let [sum, weight] = pair else { continue };
            if *weight <= 0.0 {
                continue;
            }
            let value = sum / weight;
            backend.record(&LogRecord::new(name.clone(), value, scope))?;
            values.insert(name, value);
        }
        backend.flush()?;
        Ok(values)
    }
}

impl std::fmt::Debug for StatsLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsLogger")
            .field("enabled", &self.is_enabled())
            .field("pending", &!self.accumulator.is_empty())
            .finish()
    }
}
