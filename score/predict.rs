use crate::ensemble::ModelEnsemble;
use crate::labels::LabelIndex;
use crate::regional::RegionalStatistics;
use crate::types::{Covariates, LabelNumber, PredictionRecord, StatisticType};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AlignmentError {
    #[error(
        "The label index defines {regions} regions, but the model ensemble holds {predictors} predictors."
    )]
    CountMismatch { regions: usize, predictors: usize },
    #[error("No predictor is keyed to region {0}.")]
    MissingPredictor(LabelNumber),
    #[error(
        "The predictor for region {label} was trained for '{model_abbrev}', but the label index names it '{index_abbrev}'."
    )]
    NameMismatch {
        label: LabelNumber,
        model_abbrev: String,
        index_abbrev: String,
    },
    #[error("No statistics were computed for region {0}.")]
    MissingStatistics(LabelNumber),
}

/// Predicts the expected outcome of every region for one subject and joins it with the
/// observed regional mean.
///
/// The covariates reach each predictor exactly as given. Range checks on age or sex
/// codes are the caller's business.
///
/// # Returns
/// One record per region of `index`, ascending label number, with
/// `diff = predicted - actual`. Regions without voxels contribute an actual value of
/// `0.0`.
pub fn predict_regions(
    covariates: &Covariates,
    index: &LabelIndex,
    ensemble: &ModelEnsemble,
    actual: &RegionalStatistics,
) -> Result<Vec<PredictionRecord>, AlignmentError> {
    if ensemble.len() != index.len() {
        return Err(AlignmentError::CountMismatch {
            regions: index.len(),
            predictors: ensemble.len(),
        });
    }

    log::info!(
        "Predicting regional values for age {} and sex code {}",
        covariates.age,
        covariates.sex
    );

    let mut records = Vec::with_capacity(index.len());
    for definition in index.iter() {
        let label = definition.label_number;
        let member = ensemble
            .get(label)
            .ok_or(AlignmentError::MissingPredictor(label))?;

        if let Some(model_abbrev) = member.predictor.region_abbrev() {
            if model_abbrev != definition.abbrev_name {
                return Err(AlignmentError::NameMismatch {
                    label,
                    model_abbrev: model_abbrev.to_string(),
                    index_abbrev: definition.abbrev_name.clone(),
                });
            }
        }

        let observed = actual
            .value(label, StatisticType::Mean)
            .ok_or(AlignmentError::MissingStatistics(label))?;
        let predicted = member.predictor.predict(covariates);

        records.push(PredictionRecord::new(
            label,
            definition.full_name.clone(),
            observed,
            predicted,
        ));
    }

    Ok(records)
}
