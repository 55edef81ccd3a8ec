//! Optimizers, parameter groups and learning-rate introspection.
//!
//! The numeric update belongs to the backend; Lighter only owns the hyperparameters of each
//! parameter group so that schedulers can adjust them and the stats logger can report them.

pub mod scheduler;

pub use scheduler::{LrScheduler, Schedule, ScheduledLr};

use crate::backend::Backend;
use crate::error::{ConfigError, LighterError, Result};
use crate::model::Model;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hyperparameters shared by a set of model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub params: Vec<String>,
    pub lr: f64,
    #[serde(default)]
    pub momentum: Option<f64>,
    #[serde(default)]
    pub betas: Option<(f64, f64)>,
    #[serde(default)]
    pub weight_decay: f64,
}

/// An optimizer over a model's parameter groups.
pub trait Optimizer<B: Backend>: Send {
    /// Class-style name used in logged stats, e.g. `SGD` or `Adam`.
    fn name(&self) -> &str;

    fn param_groups(&self) -> &[ParamGroup];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Apply one update to `model` from `loss`.
    fn step(&mut self, model: &mut dyn Model<B>, loss: &B::Scalar) -> Result<()>;
}

/// Optimizer hyperparameters as written under `system.optimizer`.
#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerHyperparams {
    pub lr: f64,
    #[serde(default)]
    pub momentum: Option<f64>,
    #[serde(default)]
    pub betas: Option<(f64, f64)>,
    #[serde(default)]
    pub weight_decay: Option<f64>,
    /// Explicit groups selected by a regex over parameter names.
    #[serde(default)]
    pub param_groups: Vec<GroupSpec>,
}

/// One entry of `system.optimizer.param_groups`. Unset fields inherit the defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupSpec {
    pub params: String,
    #[serde(default)]
    pub lr: Option<f64>,
    #[serde(default)]
    pub momentum: Option<f64>,
    #[serde(default)]
    pub betas: Option<(f64, f64)>,
    #[serde(default)]
    pub weight_decay: Option<f64>,
}

/// Assign model parameters to groups.
///
/// Each parameter joins the first group whose pattern matches it. Unmatched parameters form
/// a trailing default group.
pub fn build_param_groups(
    parameters: &[String],
    hyper: &OptimizerHyperparams,
) -> Result<Vec<ParamGroup>> {
    let default_group = |params: Vec<String>| ParamGroup {
        params,
        lr: hyper.lr,
        momentum: hyper.momentum,
        betas: hyper.betas,
        weight_decay: hyper.weight_decay.unwrap_or(0.0),
    };

    let mut patterns = Vec::with_capacity(hyper.param_groups.len());
    for (i, spec) in hyper.param_groups.iter().enumerate() {
        let re = Regex::new(&spec.params).map_err(|e| {
            ConfigError::invalid(format!("system.optimizer.param_groups[{i}].params"), e.to_string())
        })?;
        patterns.push(re);
    }

    let mut assigned: Vec<Vec<String>> = vec![Vec::new(); patterns.len()];
    let mut rest = Vec::new();
    for name in parameters {
        match patterns.iter().position(|re| re.is_match(name)) {
            Some(i) => assigned[i].push(name.clone()),
            None => rest.push(name.clone()),
        }
    }

    let mut groups = Vec::with_capacity(patterns.len() + 1);
    for (i, (spec, params)) in hyper.param_groups.iter().zip(assigned).enumerate() {
        if params.is_empty() {
            return Err(ConfigError::invalid(
                format!("system.optimizer.param_groups[{i}].params"),
                format!("pattern '{}' matches no model parameters", spec.params),
            )
            .into());
        }
        let mut group = default_group(params);
        group.lr = spec.lr.unwrap_or(group.lr);
        group.momentum = spec.momentum.or(group.momentum);
        group.betas = spec.betas.or(group.betas);
        group.weight_decay = spec.weight_decay.unwrap_or(group.weight_decay);
        groups.push(group);
    }
    if !rest.is_empty() || groups.is_empty() {
        groups.push(default_group(rest));
    }
    Ok(groups)
}

/// Learning rate of a single-group optimizer.
pub fn learning_rate(groups: &[ParamGroup]) -> Result<f64> {
    match groups {
        [group] => Ok(group.lr),
        _ => Err(LighterError::MultiGroupLearningRate {
            groups: groups.len(),
        }),
    }
}

/// Set the learning rate of a single-group optimizer.
pub fn set_learning_rate(groups: &mut [ParamGroup], lr: f64) -> Result<()> {
    match groups {
        [group] => {
            group.lr = lr;
            Ok(())
        }
        _ => Err(LighterError::MultiGroupLearningRate {
            groups: groups.len(),
        }),
    }
}

/// Learning rate and momentum (or the first beta) per parameter group.
///
/// Keys are `optimizer/{name}/lr` and `optimizer/{name}/momentum`, suffixed with
/// `/group{n}` (1-based) when there is more than one group.
pub fn optimizer_stats(name: &str, groups: &[ParamGroup]) -> BTreeMap<String, f64> {
    let mut stats = BTreeMap::new();
    let multi = groups.len() > 1;
    for (i, group) in groups.iter().enumerate() {
        let suffix = if multi {
            format!("/group{}", i + 1)
        } else {
            String::new()
        };
        stats.insert(format!("optimizer/{name}/lr{suffix}"), group.lr);
        if let Some(momentum) = group.momentum {
            stats.insert(format!("optimizer/{name}/momentum{suffix}"), momentum);
        }
        if let Some((beta1, _)) = group.betas {
            stats.insert(format!("optimizer/{name}/momentum{suffix}"), beta1);
        }
    }
    stats
}
