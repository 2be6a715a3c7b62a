//! # Regional Statistics Aggregation
//!
//! Pairs every voxel of a segmentation volume with the co-registered outcome value
//! (e.g. cortical thickness) and summarizes the outcome per atlas region.
//!
//! The work is split in two phases:
//! 1. A single sequential pass over the grid buckets outcome values by label. Voxels
//!    whose label is not in the index (background, unlisted parcels) are dropped.
//! 2. Each region's bucket is summarized independently in parallel. Regions are
//!    disjoint partitions of the grid and each one writes only its own row.
//!
//! A region without a single voxel is not an error. It is reported as
//! [`RegionSummary::Empty`] and reads as `0.0` for every statistic, including volume.

use crate::labels::LabelIndex;
use crate::types::{LabelDefinition, LabelNumber, StatisticType};
use crate::volume::{LabelVolume, Volume};
use ahash::AHashMap;
use ndarray::{ArrayView3, Zip};
use rayon::prelude::*;
use thiserror::Error;

/// Number of decimal digits the descriptive statistics are rounded to.
pub const STATISTIC_PRECISION: i32 = 6;

/// Relative tolerance when comparing the voxel spacing of two volumes.
const SPACING_TOLERANCE: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum DataError {
    #[error(
        "Label volume has grid dimensions {label_shape:?}, but the outcome volume has {outcome_shape:?}."
    )]
    ShapeMismatch {
        label_shape: [usize; 3],
        outcome_shape: [usize; 3],
    },
    #[error("Voxel spacing {0:?} is invalid: expected three finite, positive values.")]
    InvalidSpacing(Vec<f64>),
    #[error(
        "Label volume spacing {label_spacing:?} does not match outcome volume spacing {outcome_spacing:?}."
    )]
    SpacingMismatch {
        label_spacing: [f64; 3],
        outcome_spacing: [f64; 3],
    },
    #[error("Region {label} contains {count} infinite outcome values.")]
    NonFiniteOutcome { label: LabelNumber, count: usize },
}

/// Summary of the outcome values inside one non-empty region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescriptiveStats {
    /// Matched voxels, NaN outcome values included.
    pub voxel_count: usize,
    pub mean: f64,
    /// Sample standard deviation (n - 1 denominator); 0.0 for a single voxel.
    pub std: f64,
    pub min: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub max: f64,
    /// Physical volume: voxel count times the volume of one voxel. Not rounded.
    pub volume: f64,
}

impl DescriptiveStats {
    pub fn get(&self, stat: StatisticType) -> f64 {
        match stat {
            StatisticType::Mean => self.mean,
            StatisticType::Std => self.std,
            StatisticType::Min => self.min,
            StatisticType::P25 => self.p25,
            StatisticType::P50 => self.p50,
            StatisticType::P75 => self.p75,
            StatisticType::Max => self.max,
            StatisticType::Volume => self.volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegionSummary {
    Present(DescriptiveStats),
    /// No voxel of the label volume carries this region's id, or every matched
    /// outcome value is NaN.
    Empty,
}

impl RegionSummary {
    /// The value of one statistic, with empty regions zero-filled.
    pub fn value(&self, stat: StatisticType) -> f64 {
        match self {
            Self::Present(stats) => stats.get(stat),
            Self::Empty => 0.0,
        }
    }

    pub fn voxel_count(&self) -> usize {
        match self {
            Self::Present(stats) => stats.voxel_count,
            Self::Empty => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// All statistics in [`StatisticType::ALL`] order.
    pub fn wide_row(&self) -> [f64; 8] {
        StatisticType::ALL.map(|stat| self.value(stat))
    }
}

#[derive(Debug, Clone)]
pub struct RegionRow {
    pub definition: LabelDefinition,
    pub summary: RegionSummary,
}

/// One row of the melted (long-form) statistics table.
#[derive(Debug, Clone, Copy)]
pub struct LongFormRow<'a> {
    pub definition: &'a LabelDefinition,
    pub statistic: StatisticType,
    pub value: f64,
}

/// The wide statistics table: one row per indexed region, ascending label number.
#[derive(Debug, Clone)]
pub struct RegionalStatistics {
    rows: Vec<RegionRow>,
    positions: AHashMap<LabelNumber, usize>,
}

impl RegionalStatistics {
    pub fn rows(&self) -> &[RegionRow] {
        &self.rows
    }

    pub fn get(&self, label: LabelNumber) -> Option<&RegionRow> {
        self.positions.get(&label).map(|&i| &self.rows[i])
    }

    /// Looks up a single cell of the wide table.
    pub fn value(&self, label: LabelNumber, stat: StatisticType) -> Option<f64> {
        self.get(label).map(|row| row.summary.value(stat))
    }

    pub fn empty_regions(&self) -> impl Iterator<Item = &RegionRow> {
        self.rows.iter().filter(|row| row.summary.is_empty())
    }

    /// Reshapes the wide table into long form: rows are grouped by statistic in the
    /// fixed [`StatisticType::ALL`] order, ascending label number within each group.
    pub fn melt(&self) -> Vec<LongFormRow<'_>> {
        StatisticType::ALL
            .iter()
            .flat_map(|&statistic| {
                self.rows.iter().map(move |row| LongFormRow {
                    definition: &row.definition,
                    statistic,
                    value: row.summary.value(statistic),
                })
            })
            .collect()
    }
}

/// Computes per-region statistics of `outcome` over the regions of `index`.
///
/// # Arguments
/// * `labels`: segmentation grid holding atlas ids.
/// * `outcome`: co-registered outcome grid, same dimensions as `labels`.
/// * `index`: the regions to report, in ascending label order.
/// * `spacing`: physical voxel size along each of the three axes.
pub fn compute_regional_statistics(
    labels: ArrayView3<u32>,
    outcome: ArrayView3<f64>,
    index: &LabelIndex,
    spacing: &[f64],
) -> Result<RegionalStatistics, DataError> {
    if labels.dim() != outcome.dim() {
        let (lx, ly, lz) = labels.dim();
        let (ox, oy, oz) = outcome.dim();
        return Err(DataError::ShapeMismatch {
            label_shape: [lx, ly, lz],
            outcome_shape: [ox, oy, oz],
        });
    }
    let unit_volume = voxel_unit_volume(spacing)?;

    // Phase 1: bucket outcome values by region position in the index.
    let positions: AHashMap<u32, usize> = index
        .iter()
        .enumerate()
        .map(|(i, def)| (def.label_number.0, i))
        .collect();
    let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); index.len()];
    Zip::from(labels).and(outcome).for_each(|&id, &value| {
        if let Some(&slot) = positions.get(&id) {
            buckets[slot].push(value);
        }
    });

    // Phase 2: independent per-region summaries.
    let rows = index
        .definitions()
        .par_iter()
        .zip(buckets)
        .map(|(definition, values)| {
            let summary = summarize(definition.label_number, values, unit_volume)?;
            log::debug!(
                "Region {} ({}): {} voxels",
                definition.label_number,
                definition.abbrev_name,
                summary.voxel_count()
            );
            Ok(RegionRow {
                definition: definition.clone(),
                summary,
            })
        })
        .collect::<Result<Vec<RegionRow>, DataError>>()?;

    let empty = rows.iter().filter(|row| row.summary.is_empty()).count();
    if empty > 0 {
        log::info!(
            "{} of {} regions have no voxels in the label volume; their statistics are zero-filled",
            empty,
            rows.len()
        );
    }

    let positions = rows
        .iter()
        .enumerate()
        .map(|(i, row)| (row.definition.label_number, i))
        .collect();
    Ok(RegionalStatistics { rows, positions })
}

/// Checks that the two volumes share voxel spacing and aggregates them.
pub fn aggregate_volumes(
    label_volume: &LabelVolume,
    outcome: &Volume,
    index: &LabelIndex,
) -> Result<RegionalStatistics, DataError> {
    let consistent = label_volume
        .spacing
        .iter()
        .zip(outcome.spacing.iter())
        .all(|(&a, &b)| (a - b).abs() <= SPACING_TOLERANCE * a.abs().max(b.abs()));
    if !consistent {
        return Err(DataError::SpacingMismatch {
            label_spacing: label_volume.spacing,
            outcome_spacing: outcome.spacing,
        });
    }
    compute_regional_statistics(
        label_volume.view(),
        outcome.view(),
        index,
        &label_volume.spacing,
    )
}

/// Volume of a single voxel, validating the spacing vector on the way.
pub fn voxel_unit_volume(spacing: &[f64]) -> Result<f64, DataError> {
    if spacing.len() != 3 || spacing.iter().any(|&s| !s.is_finite() || s <= 0.0) {
        return Err(DataError::InvalidSpacing(spacing.to_vec()));
    }
    Ok(spacing.iter().product())
}

fn summarize(
    label: LabelNumber,
    mut values: Vec<f64>,
    unit_volume: f64,
) -> Result<RegionSummary, DataError> {
    if values.is_empty() {
        return Ok(RegionSummary::Empty);
    }

    let infinite = values.iter().filter(|v| v.is_infinite()).count();
    if infinite > 0 {
        return Err(DataError::NonFiniteOutcome {
            label,
            count: infinite,
        });
    }

    // NaN outcome voxels still count toward the region volume.
    let matched = values.len();
    values.retain(|v| !v.is_nan());
    if values.len() < matched {
        log::warn!(
            "Region {}: skipping {} NaN outcome value(s) out of {} voxels",
            label,
            matched - values.len(),
            matched
        );
    }
    if values.is_empty() {
        return Ok(RegionSummary::Empty);
    }

    values.sort_unstable_by(f64::total_cmp);
    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;
    let std = if n > 1 {
        let sum_sq: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
        (sum_sq / (n - 1) as f64).sqrt()
    } else {
        0.0
    };

    Ok(RegionSummary::Present(DescriptiveStats {
        voxel_count: matched,
        mean: round_statistic(mean),
        std: round_statistic(std),
        min: round_statistic(values[0]),
        p25: round_statistic(percentile_sorted(&values, 0.25)),
        p50: round_statistic(percentile_sorted(&values, 0.50)),
        p75: round_statistic(percentile_sorted(&values, 0.75)),
        max: round_statistic(values[n - 1]),
        volume: matched as f64 * unit_volume,
    }))
}

/// Linear interpolation between the two closest ranks of an ascending, non-empty slice.
fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

fn round_statistic(value: f64) -> f64 {
    let scale = 10f64.powi(STATISTIC_PRECISION);
    (value * scale).round_ties_even() / scale
}
