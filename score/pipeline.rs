// ========================================================================================
//
//                          Single-subject scoring pipeline
//
// ========================================================================================
//
// Phases run strictly in order and the first failure aborts the subject:
//
// 1. Covariate validation.
// 2. Label index and volume loading.
// 3. Regional aggregation.
// 4. Model ensemble loading.
// 5. Prediction and residuals.
// 6. Table export, then rendering of the flattened table.

use crate::config::{ConfigError, EngineConfig};
use crate::ensemble::{ModelEnsemble, ModelLoadError, load_model_ensemble};
use crate::export::{
    ExportError, OutputPaths, read_prediction_table, write_prediction_table,
    write_regional_statistics, write_render_table,
};
use crate::labels::{FormatError, LabelIndex, load_label_index};
use crate::predict::{AlignmentError, predict_regions};
use crate::regional::{DataError, RegionalStatistics, aggregate_volumes};
use crate::render::{
    RenderError, RenderInvocation, RenderRunner, RenderSettings, Threshold, execute_render_plan,
    plan_render_invocations,
};
use crate::types::{Covariates, LabelNumber, PredictionRecord};
use crate::volume::{LabelVolume, Volume, VolumeError};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
    #[error("Volume error: {0}")]
    Volume(#[from] VolumeError),
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("Model load error: {0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error("Alignment error: {0}")]
    Alignment(#[from] AlignmentError),
    #[error("Export error: {0}")]
    Export(#[from] ExportError),
    #[error("Render error: {0}")]
    Render(#[from] RenderError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid covariate: {0}")]
    InvalidCovariate(String),
}

/// Everything that varies from one subject to the next.
#[derive(Debug, Clone)]
pub struct SubjectInputs {
    pub label_volume: PathBuf,
    pub outcome_volume: PathBuf,
    pub covariates: Covariates,
    pub thresholds: Vec<Threshold>,
    pub prefix: String,
    pub output_dir: PathBuf,
}

#[derive(Debug)]
pub struct SubjectOutputs {
    pub paths: OutputPaths,
    pub records: Vec<PredictionRecord>,
    /// Regions that received no voxels and were zero-filled.
    pub empty_regions: Vec<LabelNumber>,
    pub regional_statistics_written: bool,
    pub render_plan: Vec<RenderInvocation>,
}

/// Rejects covariates no model can be evaluated on.
///
/// Age must be finite. Sex codes outside `{0, 1}` are allowed through with a warning,
/// since the models were trained on that coding but accept any integer.
pub fn validate_covariates(covariates: &Covariates) -> Result<(), PipelineError> {
    if !covariates.age.is_finite() {
        return Err(PipelineError::InvalidCovariate(format!(
            "age must be a finite number, got {}",
            covariates.age
        )));
    }
    if !matches!(covariates.sex, 0 | 1) {
        log::warn!(
            "Sex code {} is outside the {{0, 1}} coding the models were trained with; using it unchanged.",
            covariates.sex
        );
    }
    Ok(())
}

/// Loads the label index and both volumes, then aggregates them.
pub fn compute_subject_statistics(
    label_index: &Path,
    label_volume: &Path,
    outcome_volume: &Path,
) -> Result<(LabelIndex, RegionalStatistics), PipelineError> {
    let index = load_label_index(label_index)?;

    log::info!("Loading label volume '{}'", label_volume.display());
    let labels = LabelVolume::load(label_volume)?;
    log::info!("Loading outcome volume '{}'", outcome_volume.display());
    let outcome = Volume::load(outcome_volume)?;

    log::info!("Aggregating regional statistics");
    let stats = aggregate_volumes(&labels, &outcome, &index)?;
    for row in stats.empty_regions() {
        log::warn!(
            "Region {} ({}) has no usable voxels; its statistics are zero-filled.",
            row.definition.label_number,
            row.definition.abbrev_name
        );
    }
    Ok((index, stats))
}

/// Validates the covariates and predicts every region from in-memory inputs.
pub fn score_subject(
    covariates: &Covariates,
    index: &LabelIndex,
    ensemble: &ModelEnsemble,
    stats: &RegionalStatistics,
) -> Result<Vec<PredictionRecord>, PipelineError> {
    validate_covariates(covariates)?;
    Ok(predict_regions(covariates, index, ensemble, stats)?)
}

/// Runs the whole pipeline for one subject and writes its artifacts.
pub fn run_subject(
    config: &EngineConfig,
    inputs: &SubjectInputs,
    runner: &dyn RenderRunner,
) -> Result<SubjectOutputs, PipelineError> {
    let start = Instant::now();
    validate_covariates(&inputs.covariates)?;

    let (index, stats) = compute_subject_statistics(
        &config.label_index,
        &inputs.label_volume,
        &inputs.outcome_volume,
    )?;
    let ensemble = load_model_ensemble(&config.model_dir, config.alignment)?;

    let records = score_subject(&inputs.covariates, &index, &ensemble, &stats)?;

    let paths = OutputPaths::new(&inputs.output_dir, &inputs.prefix);
    log::info!("Writing predictions to '{}'", paths.predicted_table.display());
    write_prediction_table(&records, &paths.predicted_table)?;
    log::info!("Writing render table to '{}'", paths.render_table.display());
    write_render_table(&records, &paths.render_table)?;

    if config.write_regional_statistics {
        log::info!(
            "Writing regional statistics to '{}'",
            paths.regional_statistics.display()
        );
        write_regional_statistics(&stats, &paths.regional_statistics)?;
    }

    let render_plan =
        render_table(&config.render, &paths.render_table, &inputs.thresholds, runner)?;

    log::info!("Subject '{}' finished in {:.2?}", inputs.prefix, start.elapsed());

    Ok(SubjectOutputs {
        empty_regions: stats
            .empty_regions()
            .map(|row| row.definition.label_number)
            .collect(),
        paths,
        records,
        regional_statistics_written: config.write_regional_statistics,
        render_plan,
    })
}

/// Rebuilds the flattened table from an existing prediction table and renders it.
pub fn rerender_predictions(
    settings: &RenderSettings,
    predicted_table: &Path,
    thresholds: &[Threshold],
    runner: &dyn RenderRunner,
) -> Result<Vec<RenderInvocation>, PipelineError> {
    log::info!("Reading predictions from '{}'", predicted_table.display());
    let records = read_prediction_table(predicted_table)?;
    let table_path = predicted_table.with_extension("txt");
    write_render_table(&records, &table_path)?;
    render_table(settings, &table_path, thresholds, runner)
}

// The renderer runs next to its table and receives the bare file name.
fn render_table(
    settings: &RenderSettings,
    table_path: &Path,
    thresholds: &[Threshold],
    runner: &dyn RenderRunner,
) -> Result<Vec<RenderInvocation>, PipelineError> {
    let working_dir = table_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let table_name = table_path.file_name().map_or(table_path, Path::new);

    let settings = settings.with_absolute_script()?;
    let plan = plan_render_invocations(&settings, table_name, thresholds);
    log::info!("Rendering {} figure(s)", plan.len());
    execute_render_plan(runner, &plan, working_dir)?;
    Ok(plan)
}
