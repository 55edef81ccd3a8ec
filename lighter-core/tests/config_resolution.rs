//! Layered config resolution from files and overrides, through to a built system.

use lighter_core::config::{ConfigResolver, Registry, SystemBuilder};
use lighter_core::dense::{self, DenseBackend};
use lighter_core::{ConfigError, LighterError, LoggerConfig, Mode, Stage, Trainer};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn yaml(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn resolver() -> ConfigResolver {
    ConfigResolver::new().env_prefix(None)
}

fn config_error(err: LighterError) -> ConfigError {
    match err {
        LighterError::Config(err) => err,
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn later_files_and_overrides_take_precedence() {
    let base = yaml(
        "trainer:\n  max_epochs: 2\n  seed: 7\nsystem:\n  model:\n    _target_: affine\n    weight: 1.0\n",
    );
    let experiment = yaml("trainer:\n  max_epochs: 5\n");

    let resolved = resolver()
        .file(base.path())
        .file(experiment.path())
        .override_arg("system.model.weight=3.0")
        .resolve()
        .unwrap();

    assert_eq!(resolved.schema.trainer.max_epochs, 5);
    assert_eq!(resolved.schema.trainer.seed, 7);
    let model = resolved.schema.system.model.unwrap();
    assert_eq!(model.target, "affine");
    assert_eq!(model.args["weight"], json!(3.0));
}

#[test]
fn vars_references_resolve_before_extraction() {
    let file = yaml(
        "vars:\n  lr: 0.05\n  data: train.jsonl\n\
         system:\n  model: {_target_: affine}\n  optimizer: {_target_: sgd, lr: \"@vars.lr\"}\n",
    );
    let resolved = resolver()
        .file(file.path())
        .override_arg("vars.lr=0.2")
        .resolve()
        .unwrap();
    let optimizer = resolved.schema.system.optimizer.unwrap();
    assert_eq!(optimizer.args["lr"], json!(0.2));
    assert_eq!(resolved.tree["vars"]["data"], json!("train.jsonl"));
}

#[test]
fn two_files_declaring_project_are_rejected() {
    let first = yaml("project: ./alpha\n");
    let second = yaml("project: ./beta\n");
    let err = resolver()
        .files([first.path(), second.path()])
        .resolve()
        .unwrap_err();
    match config_error(err) {
        ConfigError::DuplicateProject { first: a, second: b } => {
            assert_eq!(a, first.path().display().to_string());
            assert_eq!(b, second.path().display().to_string());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn project_override_conflicts_with_file() {
    let file = yaml("project: ./alpha\n");
    let err = resolver()
        .file(file.path())
        .override_arg("project=./beta")
        .resolve()
        .unwrap_err();
    assert!(matches!(
        config_error(err),
        ConfigError::DuplicateProject { .. }
    ));
}

// Each environment test reads its own prefix so parallel tests never see its variables.

#[test]
fn project_from_environment_conflicts_with_file() {
    // SAFETY: no other test reads the `LIGHTER_ENVDUP_` prefix.
    unsafe { std::env::set_var("LIGHTER_ENVDUP_PROJECT", "./beta") };
    let file = yaml("project: ./alpha\n");
    let err = ConfigResolver::new()
        .env_prefix(Some("LIGHTER_ENVDUP_"))
        .file(file.path())
        .resolve()
        .unwrap_err();
    match config_error(err) {
        ConfigError::DuplicateProject { first, second } => {
            assert_eq!(first, file.path().display().to_string());
            assert_eq!(second, "environment");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn environment_alone_may_set_project() {
    // SAFETY: no other test reads the `LIGHTER_ENVONLY_` prefix.
    unsafe {
        std::env::set_var("LIGHTER_ENVONLY_PROJECT", "./beta");
        std::env::set_var("LIGHTER_ENVONLY_TRAINER__MAX_EPOCHS", "4");
    }
    let file = yaml("trainer:\n  max_epochs: 2\n");
    let resolved = ConfigResolver::new()
        .env_prefix(Some("LIGHTER_ENVONLY_"))
        .file(file.path())
        .resolve()
        .unwrap();
    assert_eq!(resolved.schema.project, Some(PathBuf::from("./beta")));
    assert_eq!(resolved.schema.trainer.max_epochs, 4);
}

#[test]
fn prohibited_stage_args_are_rejected() {
    let file = yaml("args:\n  fit:\n    ckpt_path: last.ckpt\n    model: foo\n");
    let err = resolver().file(file.path()).resolve().unwrap_err();
    match config_error(err) {
        ConfigError::ProhibitedArgs { field, keys } => {
            assert_eq!(field, "fit");
            assert_eq!(keys, vec!["model".to_string()]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn unknown_top_level_key_is_rejected() {
    let file = yaml("sytem:\n  model: {_target_: affine}\n");
    let err = resolver().file(file.path()).resolve().unwrap_err();
    assert!(matches!(
        config_error(err),
        ConfigError::UnknownKey { key } if key == "sytem"
    ));
}

#[test]
fn logger_can_be_disabled_from_the_command_line() {
    let resolved = resolver().override_arg("trainer.logger=null").resolve().unwrap();
    assert_eq!(resolved.schema.trainer.logger, None);

    let resolved = resolver().resolve().unwrap();
    assert_eq!(resolved.schema.trainer.logger, Some(LoggerConfig::Tracing));
}

#[test]
fn missing_file_is_a_parse_error() {
    let err = resolver()
        .file("/definitely/not/here.yaml")
        .resolve()
        .unwrap_err();
    assert!(matches!(config_error(err), ConfigError::Parse { .. }));
}

#[test]
fn resolved_config_builds_a_fit_system() {
    let mut data = NamedTempFile::new().unwrap();
    writeln!(data, r#"{{"input": [1.0], "target": [2.0]}}"#).unwrap();
    writeln!(data, r#"{{"input": [2.0], "target": [4.0]}}"#).unwrap();
    let config = yaml(&format!(
        "vars:\n  data: {}\n\
         system:\n\
         \x20 model: {{_target_: affine, weight: 2.0}}\n\
         \x20 criterion: {{_target_: mse}}\n\
         \x20 optimizer: {{_target_: sgd, lr: 0.1, momentum: 0.9}}\n\
         \x20 scheduler: {{_target_: step_lr, step_size: 1, gamma: 0.5}}\n\
         \x20 dataloaders:\n\
         \x20   train: {{dataset: {{_target_: jsonl, path: \"@vars.data\"}}, batch_size: 2}}\n",
        data.path().display()
    ));

    let resolved = resolver().file(config.path()).resolve().unwrap();
    let mut registry = Registry::<DenseBackend>::with_builtins();
    dense::register(&mut registry);
    let mut system = SystemBuilder::new(&registry)
        .for_stage(Stage::Fit)
        .build(&resolved.schema.system)
        .unwrap();

    assert!(system.has_dataloader(Mode::Train));
    assert!(!system.has_dataloader(Mode::Val));
    assert_eq!(system.learning_rate().unwrap(), 0.1);
    system.scheduler_step();
    assert_eq!(system.learning_rate().unwrap(), 0.05);
    assert_eq!(system.dataloader(Mode::Train, 0).unwrap().len(), 1);
}

#[test]
fn fit_on_the_dense_backend_reduces_the_loss() {
    let mut data = NamedTempFile::new().unwrap();
    writeln!(data, r#"{{"input": [1.0], "target": [2.0]}}"#).unwrap();
    writeln!(data, r#"{{"input": [2.0], "target": [4.0]}}"#).unwrap();
    let config = yaml(&format!(
        "trainer:\n  max_epochs: 5\n  logger: null\n\
         system:\n\
         \x20 model: {{_target_: affine, weight: 0.0}}\n\
         \x20 criterion: {{_target_: mse}}\n\
         \x20 optimizer: {{_target_: sgd, lr: 0.1}}\n\
         \x20 dataloaders:\n\
         \x20   train: {{dataset: {{_target_: jsonl, path: {}}}, batch_size: 2}}\n",
        data.path().display()
    ));

    let resolved = resolver().file(config.path()).resolve().unwrap();
    let mut registry = Registry::<DenseBackend>::with_builtins();
    dense::register(&mut registry);
    let mut system = SystemBuilder::new(&registry)
        .for_stage(Stage::Fit)
        .build(&resolved.schema.system)
        .unwrap();
    let mut trainer = Trainer::new(resolved.schema.trainer.clone()).unwrap();
    let epochs = trainer.fit(&mut system).unwrap();

    let losses: Vec<f64> = epochs.iter().map(|e| e.loss.unwrap()).collect();
    assert_eq!(losses.len(), 5);
    assert_eq!(losses[0], 10.0);
    assert!(losses.windows(2).all(|w| w[1] < w[0]), "{losses:?}");
    assert!(losses[4] < 0.1 * losses[0], "{losses:?}");
}

#[test]
fn project_targets_need_an_active_project() {
    let config = yaml("system:\n  model: {_target_: project.Net}\n");
    let resolved = resolver().file(config.path()).resolve().unwrap();
    let registry = Registry::<DenseBackend>::with_builtins();
    let err = SystemBuilder::new(&registry)
        .build(&resolved.schema.system)
        .unwrap_err();
    assert!(err.is_config());
}
