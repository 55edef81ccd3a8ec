//! Component registry: maps `_target_` names to constructors.
//!
//! Built-in and backend components live in the root namespace. A binary can register one
//! namespace per user project; when the config declares `project: path/to/<name>`, that
//! namespace is activated and `project.<Component>` targets resolve inside it.

use super::ComponentSpec;
use crate::backend::Backend;
use crate::criterion::Criterion;
use crate::data::Dataset;
use crate::error::{ConfigError, Result};
use crate::metrics::Metric;
use crate::model::{ChunkedInferer, Inferer, Model};
use crate::optim::{LrScheduler, Optimizer, ParamGroup, Schedule, ScheduledLr};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Prefix of targets that resolve in the active project namespace.
pub const PROJECT_PREFIX: &str = "project.";

pub type ModelFactory<B> = Arc<dyn Fn(&Value) -> Result<Box<dyn Model<B>>> + Send + Sync>;
pub type CriterionFactory<B> = Arc<dyn Fn(&Value) -> Result<Box<dyn Criterion<B>>> + Send + Sync>;
pub type MetricFactory<B> = Arc<dyn Fn(&Value) -> Result<Box<dyn Metric<B>>> + Send + Sync>;
pub type InfererFactory<B> = Arc<dyn Fn(&Value) -> Result<Box<dyn Inferer<B>>> + Send + Sync>;
pub type DatasetFactory<B> = Arc<dyn Fn(&Value) -> Result<Arc<dyn Dataset<B>>> + Send + Sync>;
pub type OptimizerFactory<B> =
    Arc<dyn Fn(Vec<ParamGroup>, &Value) -> Result<Box<dyn Optimizer<B>>> + Send + Sync>;
pub type SchedulerFactory =
    Arc<dyn Fn(&mut [ParamGroup], &Value) -> Result<Box<dyn LrScheduler>> + Send + Sync>;

/// Parse component arguments into a typed struct.
pub fn parse_args<T: DeserializeOwned>(target: &str, args: &Value) -> Result<T> {
    serde_json::from_value(args.clone())
        .map_err(|e| ConfigError::invalid(format!("{target} arguments"), e.to_string()).into())
}

/// One set of named constructors per component kind.
pub struct Namespace<B: Backend> {
    models: BTreeMap<String, ModelFactory<B>>,
    criteria: BTreeMap<String, CriterionFactory<B>>,
    metrics: BTreeMap<String, MetricFactory<B>>,
    inferers: BTreeMap<String, InfererFactory<B>>,
    datasets: BTreeMap<String, DatasetFactory<B>>,
    optimizers: BTreeMap<String, OptimizerFactory<B>>,
    schedulers: BTreeMap<String, SchedulerFactory>,
}

impl<B: Backend> Default for Namespace<B> {
    fn default() -> Self {
        Self {
            models: BTreeMap::new(),
            criteria: BTreeMap::new(),
            metrics: BTreeMap::new(),
            inferers: BTreeMap::new(),
            datasets: BTreeMap::new(),
            optimizers: BTreeMap::new(),
            schedulers: BTreeMap::new(),
        }
    }
}

impl<B: Backend> Namespace<B> {
    pub fn register_model<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Box<dyn Model<B>>> + Send + Sync + 'static,
    {
        self.models.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_criterion<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Box<dyn Criterion<B>>> + Send + Sync + 'static,
    {
        self.criteria.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_metric<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Box<dyn Metric<B>>> + Send + Sync + 'static,
    {
        self.metrics.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_inferer<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Box<dyn Inferer<B>>> + Send + Sync + 'static,
    {
        self.inferers.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_dataset<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Arc<dyn Dataset<B>>> + Send + Sync + 'static,
    {
        self.datasets.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_optimizer<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(Vec<ParamGroup>, &Value) -> Result<Box<dyn Optimizer<B>>> + Send + Sync + 'static,
    {
        self.optimizers.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_scheduler<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&mut [ParamGroup], &Value) -> Result<Box<dyn LrScheduler>> + Send + Sync + 'static,
    {
        self.schedulers.insert(name.into(), Arc::new(factory));
        self
    }

    /// Every registered name, prefixed by its kind.
    pub fn names(&self) -> Vec<String> {
        let kinds: [(&str, Vec<&String>); 7] = [
            ("model", self.models.keys().collect()),
            ("criterion", self.criteria.keys().collect()),
            ("metric", self.metrics.keys().collect()),
            ("inferer", self.inferers.keys().collect()),
            ("dataset", self.datasets.keys().collect()),
            ("optimizer", self.optimizers.keys().collect()),
            ("scheduler", self.schedulers.keys().collect()),
        ];
        kinds
            .into_iter()
            .flat_map(|(kind, names)| names.into_iter().map(move |n| format!("{kind}:{n}")))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ChunkedArgs {
    chunk_size: usize,
}

/// Root namespace plus per-project namespaces.
pub struct Registry<B: Backend> {
    root: Namespace<B>,
    projects: BTreeMap<String, Namespace<B>>,
    active: Option<(String, PathBuf)>,
}

impl<B: Backend> Default for Registry<B> {
    fn default() -> Self {
        Self {
            root: Namespace::default(),
            projects: BTreeMap::new(),
            active: None,
        }
    }
}

impl<B: Backend> Registry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the backend-independent components: the epoch schedulers and the
    /// `chunked` inferer.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for name in Schedule::NAMES {
            registry
                .root
                .register_scheduler(name, move |groups: &mut [ParamGroup], args: &Value| {
                    let schedule = Schedule::from_args(name, args.clone())?;
                    Ok(Box::new(ScheduledLr::new(name, schedule, groups)) as Box<dyn LrScheduler>)
                });
        }
        registry.root.register_inferer("chunked", |args| {
            let args: ChunkedArgs = parse_args("chunked", args)?;
            Ok(Box::new(ChunkedInferer::new(args.chunk_size)?))
        });
        registry
    }

    pub fn root_mut(&mut self) -> &mut Namespace<B> {
        &mut self.root
    }

    /// Namespace for the project directory named `name`, created on first use.
    pub fn project_mut(&mut self, name: impl Into<String>) -> &mut Namespace<B> {
        self.projects.entry(name.into()).or_default()
    }

    pub fn has_project(&self, name: &str) -> bool {
        self.projects.contains_key(name)
    }

    /// Import the project at `path`: its final component must name a registered namespace.
    pub fn activate_project(&mut self, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if !self.projects.contains_key(&name) {
            return Err(ConfigError::ProjectNotRegistered {
                name,
                path: path.display().to_string(),
            }
            .into());
        }
        info!(project = %name, path = %path.display(), "project namespace imported");
        self.active = Some((name, path.to_path_buf()));
        Ok(())
    }

    pub fn active_project(&self) -> Option<&str> {
        self.active.as_ref().map(|(name, _)| name.as_str())
    }

    fn lookup<'a, F>(
        &'a self,
        kind: &str,
        key: &str,
        target: &str,
        pick: impl Fn(&'a Namespace<B>) -> &'a BTreeMap<String, F>,
    ) -> Result<&'a F> {
        let (namespace, name) = match target.strip_prefix(PROJECT_PREFIX) {
            Some(name) => {
                let Some((project, _)) = &self.active else {
                    return Err(ConfigError::invalid(
                        key,
                        format!("'{target}' refers to the project namespace but no `project` is set"),
                    )
                    .into());
                };
                match self.projects.get(project) {
                    Some(ns) => (ns, name),
                    None => {
                        return Err(ConfigError::ProjectNotRegistered {
                            name: project.clone(),
                            path: project.clone(),
                        }
                        .into());
                    }
                }
            }
            None => (&self.root, target),
        };
        pick(namespace).get(name).ok_or_else(|| {
            ConfigError::UnknownTarget {
                kind: kind.to_string(),
                target: target.to_string(),
                key: key.to_string(),
            }
            .into()
        })
    }

    pub fn build_model(&self, key: &str, spec: &ComponentSpec) -> Result<Box<dyn Model<B>>> {
        let factory = self.lookup("model", key, &spec.target, |ns| &ns.models)?;
        debug!(key, target = %spec.target, "building model");
        factory(&spec.args_value())
    }

    pub fn build_criterion(&self, key: &str, spec: &ComponentSpec) -> Result<Box<dyn Criterion<B>>> {
        let factory = self.lookup("criterion", key, &spec.target, |ns| &ns.criteria)?;
        debug!(key, target = %spec.target, "building criterion");
        factory(&spec.args_value())
    }

    pub fn build_metric(&self, key: &str, spec: &ComponentSpec) -> Result<Box<dyn Metric<B>>> {
        let factory = self.lookup("metric", key, &spec.target, |ns| &ns.metrics)?;
        factory(&spec.args_value())
    }

    pub fn build_inferer(&self, key: &str, spec: &ComponentSpec) -> Result<Box<dyn Inferer<B>>> {
        let factory = self.lookup("inferer", key, &spec.target, |ns| &ns.inferers)?;
        debug!(key, target = %spec.target, "building inferer");
        factory(&spec.args_value())
    }

    pub fn build_dataset(&self, key: &str, spec: &ComponentSpec) -> Result<Arc<dyn Dataset<B>>> {
        let factory = self.lookup("dataset", key, &spec.target, |ns| &ns.datasets)?;
        debug!(key, target = %spec.target, "building dataset");
        factory(&spec.args_value())
    }

    pub fn build_optimizer(
        &self,
        key: &str,
        spec: &ComponentSpec,
        groups: Vec<ParamGroup>,
    ) -> Result<Box<dyn Optimizer<B>>> {
        let factory = self.lookup("optimizer", key, &spec.target, |ns| &ns.optimizers)?;
        debug!(key, target = %spec.target, groups = groups.len(), "building optimizer");
        factory(groups, &spec.args_value())
    }

    pub fn build_scheduler(
        &self,
        key: &str,
        spec: &ComponentSpec,
        groups: &mut [ParamGroup],
    ) -> Result<Box<dyn LrScheduler>> {
        let factory = self.lookup("scheduler", key, &spec.target, |ns| &ns.schedulers)?;
        debug!(key, target = %spec.target, "building scheduler");
        factory(groups, &spec.args_value())
    }
}
