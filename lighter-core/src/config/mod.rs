//! Configuration schema, resolution and system construction.
//!
//! A run is described by one or more YAML files plus `key=value` overrides. The
//! [`ConfigResolver`] merges them into a single tree, the tree is extracted into a
//! [`ConfigSchema`], and the [`SystemBuilder`] instantiates the `system` section through a
//! component [`Registry`].

pub mod builder;
pub mod loader;
pub mod registry;

pub use builder::SystemBuilder;
pub use loader::{ConfigResolver, ResolvedConfig};
pub use registry::{Namespace, Registry, parse_args};

use crate::data::{CollateKind, LoaderSettings};
use crate::mode::{Mode, Stage};
use crate::trainer::TrainerConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Keys allowed at the top level of a config.
pub const TOP_LEVEL_KEYS: [&str; 5] = ["project", "vars", "args", "system", "trainer"];

/// Keys that may not appear under any `args.<stage>` section.
pub const PROHIBITED_ARGS: [&str; 5] = [
    "model",
    "train_loaders",
    "validation_loaders",
    "dataloaders",
    "datamodule",
];

/// The fully merged configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSchema {
    /// Directory of the user's project. Its final path component selects the namespace
    /// that `project.*` targets resolve in.
    #[serde(default)]
    pub project: Option<PathBuf>,
    /// Free-form values for `@vars.*` references.
    #[serde(default)]
    pub vars: Map<String, Value>,
    #[serde(default)]
    pub args: ArgsConfig,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
}

/// Keyword arguments forwarded to each engine entry point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArgsConfig {
    #[serde(default)]
    pub fit: Map<String, Value>,
    #[serde(default)]
    pub validate: Map<String, Value>,
    #[serde(default)]
    pub test: Map<String, Value>,
    #[serde(default)]
    pub predict: Map<String, Value>,
    #[serde(default)]
    pub tune: Map<String, Value>,
    #[serde(default)]
    pub lr_find: Map<String, Value>,
    #[serde(default)]
    pub scale_batch_size: Map<String, Value>,
}

impl ArgsConfig {
    /// Arguments of the given stage.
    pub fn for_stage(&self, stage: Stage) -> &Map<String, Value> {
        match stage {
            Stage::Fit => &self.fit,
            Stage::Validate => &self.validate,
            Stage::Test => &self.test,
            Stage::Predict => &self.predict,
            Stage::Tune => &self.tune,
        }
    }

    /// Every section with its name, in declaration order.
    pub fn sections(&self) -> [(&'static str, &Map<String, Value>); 7] {
        [
            ("fit", &self.fit),
            ("validate", &self.validate),
            ("test", &self.test),
            ("predict", &self.predict),
            ("tune", &self.tune),
            ("lr_find", &self.lr_find),
            ("scale_batch_size", &self.scale_batch_size),
        ]
    }
}

/// A component to instantiate: `_target_` names a registry entry, other keys are its
/// arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    #[serde(rename = "_target_")]
    pub target: String,
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

impl ComponentSpec {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            args: Map::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn args_value(&self) -> Value {
        Value::Object(self.args.clone())
    }
}

/// The `system` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    #[serde(default)]
    pub model: Option<ComponentSpec>,
    #[serde(default)]
    pub criterion: Option<ComponentSpec>,
    #[serde(default)]
    pub optimizer: Option<ComponentSpec>,
    #[serde(default)]
    pub scheduler: Option<ComponentSpec>,
    #[serde(default)]
    pub inferer: Option<ComponentSpec>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub dataloaders: DataloadersConfig,
}

/// One metric, a list of metrics, or metrics under explicit names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricsSpec {
    Single(ComponentSpec),
    List(Vec<ComponentSpec>),
    Named(BTreeMap<String, ComponentSpec>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub train: Option<MetricsSpec>,
    #[serde(default)]
    pub val: Option<MetricsSpec>,
    #[serde(default)]
    pub test: Option<MetricsSpec>,
}

impl MetricsConfig {
    pub fn get(&self, mode: Mode) -> Option<&MetricsSpec> {
        match mode {
            Mode::Train => self.train.as_ref(),
            Mode::Val => self.val.as_ref(),
            Mode::Test => self.test.as_ref(),
            Mode::Predict => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataloadersConfig {
    #[serde(default)]
    pub train: Option<DataloaderSpec>,
    #[serde(default)]
    pub val: Option<DataloaderSpec>,
    #[serde(default)]
    pub test: Option<DataloaderSpec>,
    #[serde(default)]
    pub predict: Option<DataloaderSpec>,
}

impl DataloadersConfig {
    pub fn get(&self, mode: Mode) -> Option<&DataloaderSpec> {
        match mode {
            Mode::Train => self.train.as_ref(),
            Mode::Val => self.val.as_ref(),
            Mode::Test => self.test.as_ref(),
            Mode::Predict => self.predict.as_ref(),
        }
    }
}

/// `system.dataloaders.<mode>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataloaderSpec {
    pub dataset: ComponentSpec,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub shuffle: Option<bool>,
    #[serde(default)]
    pub drop_last: bool,
    #[serde(default)]
    pub collate: CollateKind,
}

fn default_batch_size() -> usize {
    1
}

impl DataloaderSpec {
    pub fn settings(&self) -> LoaderSettings {
        LoaderSettings {
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            drop_last: self.drop_last,
            collate: self.collate,
        }
    }
}
