//! # Region Model Ensemble
//!
//! One trained regression model per atlas region, persisted as one human-readable
//! TOML artifact per file:
//!
//! ```toml
//! label_number = 12
//! label_abbrev_name = "17Networks_LH_VisCent_ExStr_1"
//! intercept = 2.71
//!
//! [coefficients]
//! age = -0.0112
//! sex = 0.043
//! ```
//!
//! Two alignment contracts exist between artifacts and regions:
//! - `Keyed` (default): every artifact names its `label_number`. Directory listing
//!   order is irrelevant.
//! - `Positional`: artifacts are sorted by file name (byte order) and assigned label
//!   numbers 1..N. This reproduces stores that were written without label metadata,
//!   but a store named without zero padding (`region_2` vs `region_10`) is silently
//!   misassigned, so the loader warns whenever natural order and byte order disagree.

use crate::types::{Covariates, LabelNumber};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use natord::compare;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A per-region regression from demographic covariates to the expected outcome.
pub trait RegionPredictor: fmt::Debug + Send + Sync {
    fn predict(&self, covariates: &Covariates) -> f64;

    /// Region abbreviation recorded at training time, when the artifact carries one.
    fn region_abbrev(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coefficients {
    pub age: f64,
    pub sex: f64,
}

/// Ordinary least-squares fit of the outcome on `(age, sex)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRegionModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_number: Option<LabelNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_abbrev_name: Option<String>,
    pub intercept: f64,
    pub coefficients: Coefficients,
}

impl LinearRegionModel {
    /// Loads a model artifact from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let text = fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ModelLoadError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl RegionPredictor for LinearRegionModel {
    fn predict(&self, covariates: &Covariates) -> f64 {
        self.intercept
            + self.coefficients.age * covariates.age
            + self.coefficients.sex * covariates.sex as f64
    }

    fn region_abbrev(&self) -> Option<&str> {
        self.label_abbrev_name.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelAlignment {
    #[default]
    Keyed,
    Positional,
}

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("Failed to read model store entry '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Model artifact '{path}' is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Model store '{0}' contains no model artifacts.")]
    EmptyStore(PathBuf),
    #[error(
        "Model artifact '{0}' does not declare a label_number, which keyed alignment requires."
    )]
    MissingLabelNumber(PathBuf),
    #[error("Label {label} has two model artifacts: '{first}' and '{second}'.")]
    DuplicateLabel {
        label: LabelNumber,
        first: PathBuf,
        second: PathBuf,
    },
    #[error(
        "Model artifact '{path}' declares label {declared}, but its position in the store assigns label {position}."
    )]
    PositionConflict {
        path: PathBuf,
        declared: LabelNumber,
        position: LabelNumber,
    },
}

#[derive(Debug)]
pub struct EnsembleMember {
    pub label_number: LabelNumber,
    /// Artifact the predictor was loaded from; empty for in-memory predictors.
    pub source: PathBuf,
    pub predictor: Box<dyn RegionPredictor>,
}

/// The loaded predictors, keyed and ordered by label number.
#[derive(Debug)]
pub struct ModelEnsemble {
    members: Vec<EnsembleMember>,
}

impl ModelEnsemble {
    /// Orders members by label and rejects labels with more than one predictor.
    pub fn from_members(mut members: Vec<EnsembleMember>) -> Result<Self, ModelLoadError> {
        members.sort_by_key(|member| member.label_number);
        if let Some(pair) = members
            .windows(2)
            .find(|pair| pair[0].label_number == pair[1].label_number)
        {
            return Err(ModelLoadError::DuplicateLabel {
                label: pair[0].label_number,
                first: pair[0].source.clone(),
                second: pair[1].source.clone(),
            });
        }
        Ok(Self { members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[EnsembleMember] {
        &self.members
    }

    pub fn get(&self, label: LabelNumber) -> Option<&EnsembleMember> {
        self.members
            .binary_search_by_key(&label, |member| member.label_number)
            .ok()
            .map(|i| &self.members[i])
    }
}

/// Loads every artifact in `model_dir` into an ensemble.
pub fn load_model_ensemble(
    model_dir: &Path,
    alignment: ModelAlignment,
) -> Result<ModelEnsemble, ModelLoadError> {
    log::info!(
        "Loading region models from '{}' ({:?} alignment)",
        model_dir.display(),
        alignment
    );
    let artifacts = list_artifacts(model_dir)?;
    if artifacts.is_empty() {
        return Err(ModelLoadError::EmptyStore(model_dir.to_path_buf()));
    }
    if alignment == ModelAlignment::Positional {
        warn_on_unpadded_names(&artifacts);
    }

    let pb = create_progress_bar(artifacts.len() as u64, "region models");
    let mut members = Vec::with_capacity(artifacts.len());
    for (position, path) in artifacts.into_iter().enumerate() {
        let model = LinearRegionModel::load(&path)?;
        let label_number = match alignment {
            ModelAlignment::Keyed => model
                .label_number
                .ok_or_else(|| ModelLoadError::MissingLabelNumber(path.clone()))?,
            ModelAlignment::Positional => {
                let assigned = LabelNumber(position as u32 + 1);
                match model.label_number {
                    Some(declared) if declared != assigned => {
                        return Err(ModelLoadError::PositionConflict {
                            path,
                            declared,
                            position: assigned,
                        });
                    }
                    _ => assigned,
                }
            }
        };
        log::debug!("Region {} <- '{}'", label_number, path.display());
        members.push(EnsembleMember {
            label_number,
            source: path,
            predictor: Box::new(model),
        });
        pb.inc(1);
    }
    pb.finish_and_clear();

    let ensemble = ModelEnsemble::from_members(members)?;
    log::info!("Loaded {} region models", ensemble.len());
    Ok(ensemble)
}

/// Regular, non-hidden files of the store in byte order of their names.
fn list_artifacts(model_dir: &Path) -> Result<Vec<PathBuf>, ModelLoadError> {
    let to_load_error = |source| ModelLoadError::Io {
        path: model_dir.to_path_buf(),
        source,
    };

    let mut artifacts = Vec::new();
    for entry in fs::read_dir(model_dir).map_err(to_load_error)? {
        let path = entry.map_err(to_load_error)?.path();
        let hidden = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with('.'));
        if path.is_file() && !hidden {
            artifacts.push(path);
        }
    }
    artifacts.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(artifacts)
}

fn warn_on_unpadded_names(artifacts: &[PathBuf]) {
    let names: Vec<String> = artifacts
        .iter()
        .map(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .collect();
    let mut natural = names.clone();
    natural.sort_by(|a, b| compare(a, b));

    if let Some((position, (byte_order, natural_order))) = names
        .iter()
        .zip(natural.iter())
        .enumerate()
        .find(|(_, (a, b))| a != b)
    {
        log::warn!(
            "Positional alignment: artifact '{}' is assigned label {}, but natural ordering would place '{}' there. \
             Check that the store's file names are zero-padded.",
            byte_order,
            position + 1,
            natural_order
        );
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}
