//! Staged construction of a [`System`] from the `system` config section.
//!
//! Components that depend on each other are built in order: the model first, then the
//! optimizer over the model's parameters, then the scheduler over the optimizer's
//! parameter groups. Nothing is instantiated with a placeholder.

use super::{MetricsSpec, Registry, SystemConfig, parse_args};
use crate::backend::Backend;
use crate::data::DataLoaderFactory;
use crate::error::{ConfigError, Result};
use crate::metrics::MetricCollection;
use crate::mode::{Mode, Stage};
use crate::optim::{OptimizerHyperparams, build_param_groups};
use crate::system::System;
use tracing::{debug, info};

pub struct SystemBuilder<'r, B: Backend> {
    registry: &'r Registry<B>,
    stage: Option<Stage>,
}

impl<'r, B: Backend> SystemBuilder<'r, B> {
    pub fn new(registry: &'r Registry<B>) -> Self {
        Self {
            registry,
            stage: None,
        }
    }

    /// Build only what `stage` needs, and require what it cannot run without.
    pub fn for_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn build(&self, config: &SystemConfig) -> Result<System<B>> {
        let model_spec = config
            .model
            .as_ref()
            .ok_or_else(|| ConfigError::missing("system.model"))?;
        let model = self.registry.build_model("system.model", model_spec)?;
        let parameters = model.parameters();
        let mut system = System::new(model);

        match &config.criterion {
            Some(spec) => {
                system = system.with_criterion(self.registry.build_criterion("system.criterion", spec)?);
            }
            None if self.stage.is_some_and(|s| s.requires_criterion()) => {
                return Err(ConfigError::missing("system.criterion").into());
            }
            None => {}
        }

        match &config.optimizer {
            Some(spec) => {
                let hyper: OptimizerHyperparams = parse_args("system.optimizer", &spec.args_value())?;
                let groups = build_param_groups(&parameters, &hyper)?;
                let mut optimizer = self.registry.build_optimizer("system.optimizer", spec, groups)?;
                if let Some(spec) = &config.scheduler {
                    let scheduler = self.registry.build_scheduler(
                        "system.scheduler",
                        spec,
                        optimizer.param_groups_mut(),
                    )?;
                    system = system.with_scheduler(scheduler);
                }
                system = system.with_optimizer(optimizer);
            }
            None if self.stage.is_some_and(|s| s.requires_optimizer()) => {
                return Err(ConfigError::missing("system.optimizer").into());
            }
            None if config.scheduler.is_some() => {
                return Err(ConfigError::invalid(
                    "system.scheduler",
                    "a scheduler needs `system.optimizer`",
                )
                .into());
            }
            None => {}
        }

        if let Some(spec) = &config.inferer {
            system = system.with_inferer(self.registry.build_inferer("system.inferer", spec)?);
        }

        for mode in [Mode::Train, Mode::Val, Mode::Test] {
            if let Some(spec) = config.metrics.get(mode) {
                system = system.with_metrics(mode, self.build_metrics(mode, spec)?);
            }
        }

        let modes: &[Mode] = match self.stage {
            Some(stage) => stage.modes(),
            None => &Mode::ALL,
        };
        for &mode in modes {
            let Some(spec) = config.dataloaders.get(mode) else {
                continue;
            };
            let key = format!("system.dataloaders.{mode}.dataset");
            let dataset = self.registry.build_dataset(&key, &spec.dataset)?;
            debug!(%mode, samples = dataset.len(), "dataloader configured");
            system = system.with_dataloader(mode, DataLoaderFactory::new(mode, dataset, spec.settings()));
        }
        if let Some(stage) = self.stage {
            let required = stage.required_mode();
            if !system.has_dataloader(required) {
                return Err(ConfigError::missing(format!("system.dataloaders.{required}")).into());
            }
        }

        info!(system = ?system, "system built");
        Ok(system)
    }

    fn build_metrics(&self, mode: Mode, spec: &MetricsSpec) -> Result<MetricCollection<B>> {
        let key = |suffix: &str| format!("system.metrics.{mode}{suffix}");
        let mut collection = MetricCollection::new();
        match spec {
            MetricsSpec::Single(spec) => {
                collection.push(self.registry.build_metric(&key(""), spec)?)?;
            }
            MetricsSpec::List(specs) => {
                for (i, spec) in specs.iter().enumerate() {
                    collection.push(self.registry.build_metric(&key(&format!(".{i}")), spec)?)?;
                }
            }
            MetricsSpec::Named(specs) => {
                for (name, spec) in specs {
                    collection.insert(
                        name.clone(),
                        self.registry.build_metric(&key(&format!(".{name}")), spec)?,
                    )?;
                }
            }
        }
        Ok(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::{self, DenseBackend};
    use crate::error::LighterError;

    fn registry() -> Registry<DenseBackend> {
        let mut registry = Registry::with_builtins();
        dense::register(&mut registry);
        registry
    }

    fn config(yaml: &str) -> SystemConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn missing_field(err: LighterError) -> String {
        match err {
            LighterError::Config(ConfigError::MissingField { field }) => field,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_model_required() {
        let registry = registry();
        let err = SystemBuilder::new(&registry).build(&config("{}")).unwrap_err();
        assert_eq!(missing_field(err), "system.model");
    }

    #[test]
    fn test_stage_requirements() {
        let registry = registry();
        let cfg = config("model: {_target_: affine}\ncriterion: {_target_: mse}");
        let err = SystemBuilder::new(&registry)
            .for_stage(Stage::Fit)
            .build(&cfg)
            .unwrap_err();
        assert_eq!(missing_field(err), "system.optimizer");

        let err = SystemBuilder::new(&registry)
            .for_stage(Stage::Validate)
            .build(&config("model: {_target_: affine}"))
            .unwrap_err();
        assert_eq!(missing_field(err), "system.criterion");

        let err = SystemBuilder::new(&registry)
            .for_stage(Stage::Predict)
            .build(&cfg)
            .unwrap_err();
        assert_eq!(missing_field(err), "system.dataloaders.predict");
    }

    #[test]
    fn test_scheduler_without_optimizer() {
        let registry = registry();
        let cfg = config("model: {_target_: affine}\nscheduler: {_target_: step_lr, step_size: 1}");
        let err = SystemBuilder::new(&registry).build(&cfg).unwrap_err();
        assert!(err.to_string().contains("system.scheduler"));
    }

    #[test]
    fn test_metrics_shapes() {
        let registry = registry();
        let cfg = config(
            "model: {_target_: affine}\n\
             metrics:\n\
             \x20 train: {_target_: mean_absolute_error}\n\
             \x20 val: [{_target_: mean_absolute_error}, {_target_: mean_squared_error}]\n\
             \x20 test: {mae: {_target_: mean_absolute_error}}\n",
        );
        let system = SystemBuilder::new(&registry).build(&cfg).unwrap();
        assert_eq!(
            system.metrics(Mode::Train).unwrap().names(),
            vec!["mean_absolute_error"]
        );
        assert_eq!(system.metrics(Mode::Val).unwrap().len(), 2);
        assert_eq!(system.metrics(Mode::Test).unwrap().names(), vec!["mae"]);
        assert!(system.metrics(Mode::Predict).is_none());
    }

    #[test]
    fn test_duplicate_metric_in_list() {
        let registry = registry();
        let cfg = config(
            "model: {_target_: affine}\n\
             metrics:\n\
             \x20 val: [{_target_: mean_absolute_error}, {_target_: mean_absolute_error}]\n",
        );
        assert!(SystemBuilder::new(&registry).build(&cfg).is_err());
    }
}
