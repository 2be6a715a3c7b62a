// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The numeric atlas id of a region, as it appears in the label index and in the
/// voxels of the segmentation volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelNumber(pub u32);

impl fmt::Display for LabelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hemisphere {
    Left,
    Right,
    /// Midline structures and anything the index does not assign to a side.
    Other,
}

impl Hemisphere {
    /// Lenient parse used for label index cells. Unknown spellings fall back to
    /// `Other` rather than failing, since atlases disagree on how to write them.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "l" | "left" | "lh" => Self::Left,
            "r" | "right" | "rh" => Self::Right,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Hemisphere {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the atlas label index.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelDefinition {
    pub label_number: LabelNumber,
    pub abbrev_name: String,
    pub full_name: String,
    pub hemisphere: Hemisphere,
}

/// The fixed, ordered set of per-region statistics.
///
/// The declaration order is the column order of the wide table and the group order
/// of the long-form table. Downstream consumers rely on it, so new variants must
/// only ever be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatisticType {
    Mean,
    Std,
    Min,
    P25,
    P50,
    P75,
    Max,
    Volume,
}

impl StatisticType {
    pub const ALL: [StatisticType; 8] = [
        Self::Mean,
        Self::Std,
        Self::Min,
        Self::P25,
        Self::P50,
        Self::P75,
        Self::Max,
        Self::Volume,
    ];

    /// Column label used in exported tables. Percentiles keep the `25%` spelling
    /// produced by the descriptive-statistics convention of the source data.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Std => "std",
            Self::Min => "min",
            Self::P25 => "25%",
            Self::P50 => "50%",
            Self::P75 => "75%",
            Self::Max => "max",
            Self::Volume => "volume",
        }
    }

    /// Position of this statistic in a wide-table row.
    #[inline]
    pub fn column(self) -> usize {
        self as usize
    }
}

impl fmt::Display for StatisticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Demographic covariates of the subject being scored.
///
/// `sex` follows the 0 = male, 1 = female convention of the trained models but is
/// deliberately an open integer: predictors receive whatever code the caller passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Covariates {
    pub age: f64,
    pub sex: i32,
}

/// The per-region result of scoring one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub label_number: LabelNumber,
    pub full_name: String,
    pub actual: f64,
    pub predicted: f64,
    /// `predicted - actual`.
    pub diff: f64,
}

impl PredictionRecord {
    pub fn new(label_number: LabelNumber, full_name: String, actual: f64, predicted: f64) -> Self {
        Self {
            label_number,
            full_name,
            actual,
            predicted,
            diff: predicted - actual,
        }
    }
}
