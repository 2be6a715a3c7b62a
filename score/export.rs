// ========================================================================================
//
//                              Table export for one subject
//
// ========================================================================================
//
// Three artifacts leave the engine:
//
// 1. `<prefix>_predictedCT.csv`: the prediction table, one row per region.
// 2. `<prefix>_predictedCT.txt`: the renderer's input. Only `label_number` and `diff`
//    survive, separated by a single space, without a header line.
// 3. `<prefix>_regional_stats.csv`: the melted per-region statistics (optional).
//
// Every file is first written to a uniquely named temporary sibling and renamed into
// place once complete, so a failed run never leaves a truncated table behind.

use crate::regional::RegionalStatistics;
use crate::types::{LabelNumber, PredictionRecord};
use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PREDICTION_COLUMNS: [&str; 5] = [
    "label_number",
    "label_full_name",
    "actualCT",
    "predictedCT",
    "diff",
];

pub const REGIONAL_STATISTICS_COLUMNS: [&str; 6] = [
    "label_number",
    "label_abbrev_name",
    "label_full_name",
    "hemisphere",
    "type",
    "value",
];

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error on output file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed table '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Where the artifacts of one subject are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub predicted_table: PathBuf,
    pub render_table: PathBuf,
    pub regional_statistics: PathBuf,
}

impl OutputPaths {
    pub fn new(output_dir: &Path, prefix: &str) -> Self {
        let predicted_table = output_dir.join(format!("{prefix}_predictedCT.csv"));
        Self {
            render_table: predicted_table.with_extension("txt"),
            predicted_table,
            regional_statistics: output_dir.join(format!("{prefix}_regional_stats.csv")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PredictionRow {
    label_number: u32,
    label_full_name: String,
    #[serde(rename = "actualCT")]
    actual: f64,
    #[serde(rename = "predictedCT")]
    predicted: f64,
    diff: f64,
}

/// Writes the per-region prediction table.
pub fn write_prediction_table(records: &[PredictionRecord], path: &Path) -> Result<(), ExportError> {
    write_atomically(path, |writer| {
        let mut csv_writer = csv::Writer::from_writer(writer);
        let mut actual_buf = ryu::Buffer::new();
        let mut predicted_buf = ryu::Buffer::new();
        let mut diff_buf = ryu::Buffer::new();

        csv_writer.write_record(PREDICTION_COLUMNS)?;
        for record in records {
            csv_writer.write_record([
                record.label_number.to_string().as_str(),
                record.full_name.as_str(),
                actual_buf.format(record.actual),
                predicted_buf.format(record.predicted),
                diff_buf.format(record.diff),
            ])?;
        }
        csv_writer.flush()?;
        Ok(())
    })
}

/// Formats the renderer's input: `<label_number> <diff>` per line, no header.
pub fn format_render_table(records: &[PredictionRecord]) -> String {
    let mut diff_buf = ryu::Buffer::new();
    let mut text = String::with_capacity(records.len() * 24);
    for record in records {
        text.push_str(&record.label_number.to_string());
        text.push(' ');
        text.push_str(diff_buf.format(record.diff));
        text.push('\n');
    }
    text
}

pub fn write_render_table(records: &[PredictionRecord], path: &Path) -> Result<(), ExportError> {
    let text = format_render_table(records);
    write_atomically(path, |writer| {
        writer.write_all(text.as_bytes())?;
        Ok(())
    })
}

/// Writes the melted regional statistics table.
pub fn write_regional_statistics(
    stats: &RegionalStatistics,
    path: &Path,
) -> Result<(), ExportError> {
    write_atomically(path, |writer| {
        let mut csv_writer = csv::Writer::from_writer(writer);
        let mut value_buf = ryu::Buffer::new();

        csv_writer.write_record(REGIONAL_STATISTICS_COLUMNS)?;
        for row in stats.melt() {
            csv_writer.write_record([
                row.definition.label_number.to_string().as_str(),
                row.definition.abbrev_name.as_str(),
                row.definition.full_name.as_str(),
                row.definition.hemisphere.as_str(),
                row.statistic.as_str(),
                value_buf.format(row.value),
            ])?;
        }
        csv_writer.flush()?;
        Ok(())
    })
}

/// Parses a table written by [`write_prediction_table`].
pub fn read_prediction_table(path: &Path) -> Result<Vec<PredictionRecord>, ExportError> {
    let to_export_error = |source| ExportError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(to_export_error)?;

    let mut records = Vec::new();
    for row in reader.deserialize::<PredictionRow>() {
        let row = row.map_err(to_export_error)?;
        records.push(PredictionRecord {
            label_number: LabelNumber(row.label_number),
            full_name: row.label_full_name,
            actual: row.actual,
            predicted: row.predicted,
            diff: row.diff,
        });
    }
    Ok(records)
}

/// Internal error used while a temporary file is being filled.
enum FillError {
    Io(io::Error),
    Csv(csv::Error),
}

impl From<io::Error> for FillError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<csv::Error> for FillError {
    fn from(err: csv::Error) -> Self {
        Self::Csv(err)
    }
}

fn write_atomically<F>(path: &Path, fill: F) -> Result<(), ExportError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), FillError>,
{
    let to_export_error = |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };

    let output_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let output_name = path.file_name().ok_or_else(|| {
        to_export_error(io::Error::new(
            io::ErrorKind::InvalidInput,
            "output path has no file name",
        ))
    })?;
    fs::create_dir_all(output_dir).map_err(to_export_error)?;

    let pid = std::process::id();
    let mut opened = None;
    for attempt in 0..32u32 {
        let candidate = output_dir.join(format!(
            ".{}.{}.{}.tmp",
            output_name.to_string_lossy(),
            pid,
            attempt
        ));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => {
                opened = Some((candidate, file));
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(to_export_error(e)),
        }
    }
    let (temp_path, temp_file) = opened.ok_or_else(|| {
        to_export_error(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "failed to allocate a unique temporary output file",
        ))
    })?;

    let mut writer = BufWriter::new(temp_file);
    let filled = fill(&mut writer).and_then(|()| {
        writer.flush()?;
        Ok(())
    });
    drop(writer);

    if let Err(err) = filled {
        let _ = fs::remove_file(&temp_path);
        return Err(match err {
            FillError::Io(source) => to_export_error(source),
            FillError::Csv(source) => ExportError::Csv {
                path: path.to_path_buf(),
                source,
            },
        });
    }

    fs::rename(&temp_path, path).map_err(|source| {
        let _ = fs::remove_file(&temp_path);
        to_export_error(source)
    })
}
