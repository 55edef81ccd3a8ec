//! Epoch-based learning rate schedulers.
//!
//! A scheduler captures the base learning rate of every parameter group when it is built and
//! rewrites the groups' `lr` each time the engine steps it at an epoch boundary.

use crate::error::{ConfigError, Result};
use crate::optim::ParamGroup;
use serde::Deserialize;
use std::f64::consts::PI;

/// Trait for learning rate schedulers driven by the engine.
pub trait LrScheduler: Send {
    fn name(&self) -> &str;

    /// Advance one epoch and update the groups' learning rates.
    fn step(&mut self, groups: &mut [ParamGroup]);

    /// Number of completed `step` calls.
    fn last_epoch(&self) -> usize;
}

/// Closed-form schedules, evaluated as `base_lr * factor(epoch)` or an interpolation.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// Multiply by `factor` until `total_iters` epochs have passed.
    Constant { factor: f64, total_iters: usize },
    /// Decay by `gamma` every `step_size` epochs.
    Step { step_size: usize, gamma: f64 },
    /// Decay by `gamma` every epoch.
    Exponential { gamma: f64 },
    /// Cosine interpolation from the base rate to `eta_min` over `t_max` epochs.
    Cosine { t_max: usize, eta_min: f64 },
}

#[derive(Debug, Deserialize)]
struct ConstantArgs {
    #[serde(default = "default_constant_factor")]
    factor: f64,
    #[serde(default = "default_constant_iters")]
    total_iters: usize,
}

fn default_constant_factor() -> f64 {
    1.0 / 3.0
}

fn default_constant_iters() -> usize {
    5
}

#[derive(Debug, Deserialize)]
struct StepArgs {
    step_size: usize,
    #[serde(default = "default_gamma")]
    gamma: f64,
}

fn default_gamma() -> f64 {
    0.1
}

#[derive(Debug, Deserialize)]
struct ExponentialArgs {
    gamma: f64,
}

#[derive(Debug, Deserialize)]
struct CosineArgs {
    t_max: usize,
    #[serde(default)]
    eta_min: f64,
}

impl Schedule {
    /// Parse a built-in schedule from its registry name and arguments.
    pub fn from_args(target: &str, args: serde_json::Value) -> Result<Self> {
        let invalid = |e: serde_json::Error| ConfigError::invalid("system.scheduler", e.to_string());
        let schedule = match target {
            "constant" => {
                let a: ConstantArgs = serde_json::from_value(args).map_err(invalid)?;
                Schedule::Constant {
                    factor: a.factor,
                    total_iters: a.total_iters,
                }
            }
            "step_lr" => {
                let a: StepArgs = serde_json::from_value(args).map_err(invalid)?;
                if a.step_size == 0 {
                    return Err(ConfigError::invalid("system.scheduler.step_size", "must be at least 1").into());
                }
                Schedule::Step {
                    step_size: a.step_size,
                    gamma: a.gamma,
                }
            }
            "exponential_lr" => {
                let a: ExponentialArgs = serde_json::from_value(args).map_err(invalid)?;
                Schedule::Exponential { gamma: a.gamma }
            }
            "cosine_annealing" => {
                let a: CosineArgs = serde_json::from_value(args).map_err(invalid)?;
                if a.t_max == 0 {
                    return Err(ConfigError::invalid("system.scheduler.t_max", "must be at least 1").into());
                }
                Schedule::Cosine {
                    t_max: a.t_max,
                    eta_min: a.eta_min,
                }
            }
            other => {
                return Err(ConfigError::UnknownTarget {
                    kind: "scheduler".into(),
                    target: other.into(),
                    key: "system.scheduler".into(),
                }
                .into());
            }
        };
        Ok(schedule)
    }

    /// Names accepted by [`Schedule::from_args`].
    pub const NAMES: [&'static str; 4] = ["constant", "step_lr", "exponential_lr", "cosine_annealing"];

    fn lr_at(&self, base: f64, epoch: usize) -> f64 {
        match *self {
            Schedule::Constant {
                factor,
                total_iters,
            } => {
                if epoch < total_iters {
                    base * factor
                } else {
                    base
                }
            }
            Schedule::Step { step_size, gamma } => base * gamma.powi((epoch / step_size) as i32),
            Schedule::Exponential { gamma } => base * gamma.powi(epoch as i32),
            Schedule::Cosine { t_max, eta_min } => {
                let progress = epoch as f64 / t_max as f64;
                eta_min + (base - eta_min) * (1.0 + (PI * progress).cos()) / 2.0
            }
        }
    }
}

/// A [`Schedule`] bound to the base learning rates of an optimizer's groups.
#[derive(Debug, Clone)]
pub struct ScheduledLr {
    name: String,
    schedule: Schedule,
    base_lrs: Vec<f64>,
    epoch: usize,
}

impl ScheduledLr {
    /// Capture base rates and apply the epoch-0 rate to the groups.
    pub fn new(name: impl Into<String>, schedule: Schedule, groups: &mut [ParamGroup]) -> Self {
        let base_lrs: Vec<f64> = groups.iter().map(|g| g.lr).collect();
        for (group, base) in groups.iter_mut().zip(&base_lrs) {
            group.lr = schedule.lr_at(*base, 0);
        }
        Self {
            name: name.into(),
            schedule,
            base_lrs,
            epoch: 0,
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }
}

impl LrScheduler for ScheduledLr {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self, groups: &mut [ParamGroup]) {
        self.epoch += 1;
        for (group, base) in groups.iter_mut().zip(&self.base_lrs) {
            group.lr = self.schedule.lr_at(*base, self.epoch);
        }
        tracing::debug!(scheduler = %self.name, epoch = self.epoch, "learning rate updated");
    }

    fn last_epoch(&self) -> usize {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn groups(lrs: &[f64]) -> Vec<ParamGroup> {
        lrs.iter()
            .map(|lr| ParamGroup {
                params: vec!["w".into()],
                lr: *lr,
                momentum: None,
                betas: None,
                weight_decay: 0.0,
            })
            .collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_step_lr() {
        let mut g = groups(&[1.0]);
        let schedule = Schedule::from_args("step_lr", json!({"step_size": 2, "gamma": 0.5})).unwrap();
        let mut sched = ScheduledLr::new("step_lr", schedule, &mut g);
        assert!(close(g[0].lr, 1.0));
        sched.step(&mut g);
        assert!(close(g[0].lr, 1.0));
        sched.step(&mut g);
        assert!(close(g[0].lr, 0.5));
        sched.step(&mut g);
        sched.step(&mut g);
        assert!(close(g[0].lr, 0.25));
        assert_eq!(sched.last_epoch(), 4);
    }

    #[test]
    fn test_exponential_per_group() {
        let mut g = groups(&[1.0, 0.1]);
        let schedule = Schedule::from_args("exponential_lr", json!({"gamma": 0.5})).unwrap();
        let mut sched = ScheduledLr::new("exponential_lr", schedule, &mut g);
        sched.step(&mut g);
        assert!(close(g[0].lr, 0.5));
        assert!(close(g[1].lr, 0.05));
    }

    #[test]
    fn test_cosine_reaches_eta_min() {
        let mut g = groups(&[1.0]);
        let schedule =
            Schedule::from_args("cosine_annealing", json!({"t_max": 4, "eta_min": 0.1})).unwrap();
        let mut sched = ScheduledLr::new("cosine_annealing", schedule, &mut g);
        sched.step(&mut g);
        sched.step(&mut g);
        assert!(close(g[0].lr, 0.55));
        sched.step(&mut g);
        sched.step(&mut g);
        assert!(close(g[0].lr, 0.1));
    }

    #[test]
    fn test_constant_warmup_factor() {
        let mut g = groups(&[0.3]);
        let schedule =
            Schedule::from_args("constant", json!({"factor": 0.5, "total_iters": 1})).unwrap();
        let mut sched = ScheduledLr::new("constant", schedule, &mut g);
        assert!(close(g[0].lr, 0.15));
        sched.step(&mut g);
        assert!(close(g[0].lr, 0.3));
    }

    #[test]
    fn test_invalid_args() {
        assert!(Schedule::from_args("step_lr", json!({})).is_err());
        assert!(Schedule::from_args("step_lr", json!({"step_size": 0})).is_err());
        assert!(Schedule::from_args("warmup", json!({})).is_err());
    }
}
