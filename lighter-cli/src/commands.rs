//! Stage execution: resolve the config, build the system, hand it to the trainer.

use crate::StageArgs;
use anyhow::Context;
use lighter_core::config::{ConfigResolver, Registry, SystemBuilder};
use lighter_core::{Backend, Prediction, RunOutput, Stage, Trainer};
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Run `stage` from the configs and overrides in `args`.
///
/// Nothing is instantiated until the whole config has resolved.
pub fn run_stage<B: Backend>(
    stage: Stage,
    args: &StageArgs,
    mut registry: Registry<B>,
) -> anyhow::Result<RunOutput<B>> {
    let resolved = ConfigResolver::new()
        .files(&args.config)
        .overrides(&args.overrides)
        .resolve()?;
    let schema = resolved.schema;

    if let Some(project) = &schema.project {
        registry.activate_project(project)?;
        info!(project = %project.display(), "project activated");
    }

    let mut system = SystemBuilder::new(&registry)
        .for_stage(stage)
        .build(&schema.system)?;
    let mut trainer = Trainer::new(schema.trainer.clone())?;
    let output = trainer.run(stage, &mut system, schema.args.for_stage(stage))?;
    Ok(output)
}

#[derive(Serialize)]
struct PredictionLine<'a, T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a [lighter_core::SampleId]>,
    pred: &'a T,
}

/// Write one JSON line per predicted batch.
pub fn write_predictions<B>(path: &Path, predictions: &[Prediction<B>]) -> anyhow::Result<()>
where
    B: Backend,
    B::Tensor: Serialize,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("cannot create '{}'", path.display()))?;
    let mut writer = BufWriter::new(file);
    for prediction in predictions {
        let line = PredictionLine {
            id: prediction.id.as_deref(),
            pred: &prediction.pred,
        };
        serde_json::to_writer(&mut writer, &line)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    info!(path = %path.display(), batches = predictions.len(), "predictions written");
    Ok(())
}

/// Epoch summaries as pretty JSON for stdout.
pub fn render_summary<B: Backend>(output: &RunOutput<B>) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&output.epochs)?)
}
