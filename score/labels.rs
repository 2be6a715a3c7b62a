//! # Label Index Loading and Validation
//!
//! Reads the atlas label index (one row per region) and turns it into an ordered,
//! validated list of [`LabelDefinition`]s.
//!
//! - Strict Schema: the columns `label_number`, `label_abbrev_name`,
//!   `label_full_name` and `hemisphere` are required by name. Extra columns are
//!   ignored.
//! - Ordering: the returned index is always sorted by ascending label number, no
//!   matter how the file is ordered. Everything downstream (statistics rows,
//!   prediction records, exported tables) inherits this order.

use crate::types::{Hemisphere, LabelDefinition, LabelNumber};
use ahash::AHashMap;
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

pub const LABEL_NUMBER_COLUMN: &str = "label_number";
pub const ABBREV_NAME_COLUMN: &str = "label_abbrev_name";
pub const FULL_NAME_COLUMN: &str = "label_full_name";
pub const HEMISPHERE_COLUMN: &str = "hemisphere";

const REQUIRED_COLUMNS: [&str; 4] = [
    LABEL_NUMBER_COLUMN,
    ABBREV_NAME_COLUMN,
    FULL_NAME_COLUMN,
    HEMISPHERE_COLUMN,
];

/// Everything that can be wrong with a label index file.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the label index. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be read as {expected_type}. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing values were found in the required column '{0}'.")]
    MissingValues(String),
    #[error("Row {row}: '{value}' is not a valid label number (expected a positive integer).")]
    InvalidLabelNumber { row: usize, value: String },
    #[error("Label number {0} appears more than once in the label index.")]
    DuplicateLabel(LabelNumber),
    #[error("The label index contains no regions.")]
    Empty,
}

/// The validated, ascending-ordered set of atlas regions for one run.
#[derive(Debug, Clone)]
pub struct LabelIndex {
    definitions: Vec<LabelDefinition>,
    positions: AHashMap<LabelNumber, usize>,
}

impl LabelIndex {
    /// Builds an index from already-parsed definitions, enforcing uniqueness and
    /// sorting by label number.
    pub fn from_definitions(mut definitions: Vec<LabelDefinition>) -> Result<Self, FormatError> {
        if definitions.is_empty() {
            return Err(FormatError::Empty);
        }
        definitions.sort_by_key(|def| def.label_number);

        let mut positions = AHashMap::with_capacity(definitions.len());
        for (i, def) in definitions.iter().enumerate() {
            if positions.insert(def.label_number, i).is_some() {
                return Err(FormatError::DuplicateLabel(def.label_number));
            }
        }

        Ok(Self {
            definitions,
            positions,
        })
    }

    pub fn definitions(&self) -> &[LabelDefinition] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn get(&self, label: LabelNumber) -> Option<&LabelDefinition> {
        self.positions.get(&label).map(|&i| &self.definitions[i])
    }

    pub fn contains(&self, label: LabelNumber) -> bool {
        self.positions.contains_key(&label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LabelDefinition> {
        self.definitions.iter()
    }
}

/// Loads and validates a comma-delimited label index file.
pub fn load_label_index(path: &Path) -> Result<LabelIndex, FormatError> {
    log::info!("Loading label index from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b',')),
        )
        .finish()?;

    let columns_set: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for col_name in REQUIRED_COLUMNS {
        if !columns_set.contains(col_name) {
            return Err(FormatError::ColumnNotFound(col_name.to_string()));
        }
    }

    let label_numbers = extract_label_numbers(&df)?;
    let abbrev_names = extract_text_column(&df, ABBREV_NAME_COLUMN)?;
    let full_names = extract_text_column(&df, FULL_NAME_COLUMN)?;
    let hemispheres = extract_hemispheres(&df)?;

    let definitions: Vec<LabelDefinition> = label_numbers
        .into_iter()
        .zip(abbrev_names)
        .zip(full_names)
        .zip(hemispheres)
        .map(
            |(((label_number, abbrev_name), full_name), hemisphere)| LabelDefinition {
                label_number,
                abbrev_name,
                full_name,
                hemisphere: Hemisphere::parse(&hemisphere),
            },
        )
        .collect();

    let index = LabelIndex::from_definitions(definitions)?;
    log::info!("Label index holds {} regions", index.len());
    Ok(index)
}

fn extract_label_numbers(df: &DataFrame) -> Result<Vec<LabelNumber>, FormatError> {
    let column = df.column(LABEL_NUMBER_COLUMN)?;
    if column.null_count() > 0 {
        return Err(FormatError::MissingValues(LABEL_NUMBER_COLUMN.to_string()));
    }

    let wrong_type = || FormatError::ColumnWrongType {
        column_name: LABEL_NUMBER_COLUMN.to_string(),
        expected_type: "integer label numbers",
        found_type: format!("{:?}", column.dtype()),
    };
    let casted = column.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    if casted.null_count() > 0 {
        return Err(wrong_type());
    }

    let mut labels = Vec::with_capacity(casted.len());
    for (row, value) in casted.f64()?.into_iter().enumerate() {
        let value = value.ok_or_else(wrong_type)?;
        if !value.is_finite() || value.fract() != 0.0 || value < 1.0 || value > u32::MAX as f64 {
            return Err(FormatError::InvalidLabelNumber {
                row: row + 1,
                value: value.to_string(),
            });
        }
        labels.push(LabelNumber(value as u32));
    }
    Ok(labels)
}

fn extract_text_column(df: &DataFrame, column_name: &str) -> Result<Vec<String>, FormatError> {
    let column = df.column(column_name)?;
    if column.null_count() > 0 {
        return Err(FormatError::MissingValues(column_name.to_string()));
    }
    let casted = column.cast(&DataType::String)?;
    let values = casted
        .str()?
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect::<Option<Vec<String>>>()
        .ok_or_else(|| FormatError::MissingValues(column_name.to_string()))?;
    Ok(values)
}

// A blank hemisphere cell marks a midline or unlateralized structure.
fn extract_hemispheres(df: &DataFrame) -> Result<Vec<String>, FormatError> {
    let casted = df.column(HEMISPHERE_COLUMN)?.cast(&DataType::String)?;
    let values = casted
        .str()?
        .into_iter()
        .map(|value| value.unwrap_or_default().to_string())
        .collect();
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_index_csv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn loads_and_sorts_by_label_number() {
        let file = create_index_csv(
            "label_number,label_abbrev_name,label_full_name,hemisphere,network\n\
             3,RH_Vis_1,Right visual 1,R,Vis\n\
             1,LH_Vis_1,Left visual 1,L,Vis\n\
             2,LH_SomMot_1,\"Left somatomotor, dorsal\",L,SomMot",
        )
        .unwrap();

        let index = load_label_index(file.path()).unwrap();
        let labels: Vec<u32> = index.iter().map(|d| d.label_number.0).collect();
        assert_eq!(labels, vec![1, 2, 3]);

        let second = index.get(LabelNumber(2)).unwrap();
        assert_eq!(second.abbrev_name, "LH_SomMot_1");
        assert_eq!(second.full_name, "Left somatomotor, dorsal");
        assert_eq!(second.hemisphere, Hemisphere::Left);
        assert_eq!(index.get(LabelNumber(3)).unwrap().hemisphere, Hemisphere::Right);
    }

    #[test]
    fn missing_required_column_is_a_format_error() {
        let file = create_index_csv(
            "label_number,label_abbrev_name,label_full_name\n1,LH_Vis_1,Left visual 1",
        )
        .unwrap();
        match load_label_index(file.path()).unwrap_err() {
            FormatError::ColumnNotFound(col) => assert_eq!(col, "hemisphere"),
            other => panic!("Expected ColumnNotFound(hemisphere), got {:?}", other),
        }
    }

    #[test]
    fn duplicate_label_numbers_are_rejected() {
        let file = create_index_csv(
            "label_number,label_abbrev_name,label_full_name,hemisphere\n\
             1,A,Region A,L\n\
             1,B,Region B,R",
        )
        .unwrap();
        match load_label_index(file.path()).unwrap_err() {
            FormatError::DuplicateLabel(label) => assert_eq!(label, LabelNumber(1)),
            other => panic!("Expected DuplicateLabel, got {:?}", other),
        }
    }

    #[test]
    fn non_positive_label_number_is_rejected() {
        let file = create_index_csv(
            "label_number,label_abbrev_name,label_full_name,hemisphere\n\
             1,A,Region A,L\n\
             0,B,Region B,R",
        )
        .unwrap();
        match load_label_index(file.path()).unwrap_err() {
            FormatError::InvalidLabelNumber { row, .. } => assert_eq!(row, 2),
            other => panic!("Expected InvalidLabelNumber, got {:?}", other),
        }
    }

    #[test]
    fn text_label_number_is_a_wrong_type_error() {
        let file = create_index_csv(
            "label_number,label_abbrev_name,label_full_name,hemisphere\n\
             one,A,Region A,L",
        )
        .unwrap();
        assert!(matches!(
            load_label_index(file.path()).unwrap_err(),
            FormatError::ColumnWrongType { .. }
        ));
    }

    #[test]
    fn blank_hemisphere_is_read_as_other() {
        let file = create_index_csv(
            "label_number,label_abbrev_name,label_full_name,hemisphere\n\
             1,A,Region A,L\n\
             2,B,Brainstem,",
        )
        .unwrap();
        let index = load_label_index(file.path()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(LabelNumber(1)).unwrap().hemisphere, Hemisphere::Left);
        assert_eq!(index.get(LabelNumber(2)).unwrap().hemisphere, Hemisphere::Other);
    }

    #[test]
    fn blank_full_name_is_still_missing() {
        let file = create_index_csv(
            "label_number,label_abbrev_name,label_full_name,hemisphere\n\
             1,A,Region A,L\n\
             2,B,,R",
        )
        .unwrap();
        match load_label_index(file.path()).unwrap_err() {
            FormatError::MissingValues(col) => assert_eq!(col, FULL_NAME_COLUMN),
            other => panic!("Expected MissingValues, got {:?}", other),
        }
    }

    #[test]
    fn empty_definitions_are_rejected() {
        assert!(matches!(
            LabelIndex::from_definitions(Vec::new()).unwrap_err(),
            FormatError::Empty
        ));
    }
}
