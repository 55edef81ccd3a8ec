//! # Lighter Core
//!
//! Configuration-driven orchestration for training systems.
//! Provides the `System` step protocol, batch validation, loss and metric adapters,
//! stats logging, config resolution and a single-process reference trainer.

pub mod backend;
pub mod batch;
pub mod config;
pub mod criterion;
pub mod data;
pub mod dense;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod mode;
pub mod model;
pub mod optim;
pub mod system;
pub mod trainer;

// Re-export commonly used types at the crate root.
pub use backend::Backend;
pub use batch::{Batch, BatchField, RawBatch, SampleId};
pub use config::{ConfigResolver, ConfigSchema, Registry, ResolvedConfig, SystemBuilder};
pub use criterion::{Criterion, CriterionInput, Loss};
pub use data::{DataLoader, DataLoaderFactory, Dataset, LoaderSettings};
pub use dense::{DenseBackend, DenseTensor};
pub use error::{ConfigError, InvalidBatchError, LighterError, Result};
pub use logging::{LogBackend, LoggerConfig, StatsLogger};
pub use metrics::{Metric, MetricCollection};
pub use mode::{Mode, ModeSlots, Stage};
pub use model::{Inferer, Model, ModelCapabilities, ParameterUpdate};
pub use optim::{LrScheduler, Optimizer, ParamGroup};
pub use system::{Prediction, StepContext, StepOutput, StepResult, System};
pub use trainer::{EpochSummary, RunOutput, Trainer, TrainerConfig};
