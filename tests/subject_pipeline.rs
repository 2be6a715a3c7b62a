use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use approx::assert_abs_diff_eq;
use ndarray::{Array3, ShapeBuilder};
use tempfile::{TempDir, tempdir};

use thickscore::config::EngineConfig;
use thickscore::ensemble::ModelAlignment;
use thickscore::export::read_prediction_table;
use thickscore::pipeline::{PipelineError, SubjectInputs, rerender_predictions, run_subject};
use thickscore::predict::AlignmentError;
use thickscore::render::{
    RenderError, RenderInvocation, RenderRunner, RenderSettings, parse_thresholds,
};
use thickscore::types::{Covariates, LabelNumber};
use thickscore::volume::Volume;

#[derive(Default)]
struct RecordingRunner {
    calls: RefCell<Vec<(RenderInvocation, PathBuf)>>,
}

impl RenderRunner for RecordingRunner {
    fn run(&self, invocation: &RenderInvocation, working_dir: &Path) -> Result<(), RenderError> {
        self.calls
            .borrow_mut()
            .push((invocation.clone(), working_dir.to_path_buf()));
        Ok(())
    }
}

/// Three regions. Regions 1 and 2 both average 3.0; region 3 has no voxels.
struct Fixture {
    dir: TempDir,
    config: EngineConfig,
    inputs: SubjectInputs,
}

fn write_model(dir: &Path, file_name: &str, label: Option<u32>, intercept: f64) {
    let label_line = label
        .map(|n| format!("label_number = {n}\n"))
        .unwrap_or_default();
    let text = format!(
        "{label_line}intercept = {intercept}\n\n[coefficients]\nage = 0.05\nsex = 0.1\n"
    );
    fs::write(dir.join(file_name), text).expect("write model artifact");
}

fn fixture() -> Fixture {
    let dir = tempdir().expect("temporary directory");
    let root = dir.path();

    let index_path = root.join("labels.csv");
    fs::write(
        &index_path,
        "label_number,label_abbrev_name,label_full_name,hemisphere\n\
         3,RH_Vis_1,\"Right visual, first\",right\n\
         1,LH_Vis_1,Left visual first,left\n\
         2,LH_SomMot_1,Left somatomotor first,left\n",
    )
    .expect("write label index");

    let shape = (3, 2, 1).f();
    let labels =
        Array3::from_shape_vec(shape, vec![1.0, 1.0, 2.0, 2.0, 0.0, 0.0]).expect("label data");
    let thickness =
        Array3::from_shape_vec(shape, vec![2.0, 4.0, 3.0, 3.0, 9.0, 9.0]).expect("ct data");
    let spacing = [1.0, 1.0, 2.0];
    Volume {
        data: labels,
        spacing,
    }
    .save(&root.join("labels.toml"), Path::new("labels.raw"))
    .expect("save label volume");
    Volume {
        data: thickness,
        spacing,
    }
    .save_gzip(&root.join("ct.toml"), Path::new("ct.raw.gz"))
    .expect("save thickness volume");

    let model_dir = root.join("models");
    fs::create_dir(&model_dir).expect("model dir");
    for n in 1..=3u32 {
        write_model(&model_dir, &format!("region_{n}.toml"), Some(n), n as f64);
    }

    let config = EngineConfig {
        label_index: index_path,
        model_dir,
        ..EngineConfig::default()
    };
    let inputs = SubjectInputs {
        label_volume: root.join("labels.toml"),
        outcome_volume: root.join("ct.toml"),
        covariates: Covariates { age: 40.0, sex: 1 },
        thresholds: parse_thresholds("0 1.5").expect("thresholds"),
        prefix: "sub-01".to_string(),
        output_dir: root.join("out"),
    };

    Fixture {
        dir,
        config,
        inputs,
    }
}

#[test]
fn full_run_writes_tables_and_renders_each_threshold() {
    let fx = fixture();
    let runner = RecordingRunner::default();
    let outputs = run_subject(&fx.config, &fx.inputs, &runner).expect("pipeline run");

    assert_eq!(outputs.records.len(), 3);
    assert_eq!(outputs.empty_regions, vec![LabelNumber(3)]);
    assert!(outputs.regional_statistics_written);

    // Predicted value is n + 0.05 * 40 + 0.1 * 1 for region n.
    let table = read_prediction_table(&outputs.paths.predicted_table).expect("read table");
    let labels: Vec<u32> = table.iter().map(|r| r.label_number.0).collect();
    assert_eq!(labels, vec![1, 2, 3]);
    assert_eq!(table[2].full_name, "Right visual, first");
    assert_abs_diff_eq!(table[0].actual, 3.0, epsilon = 1e-9);
    assert_abs_diff_eq!(table[0].predicted, 3.1, epsilon = 1e-9);
    assert_abs_diff_eq!(table[0].diff, 0.1, epsilon = 1e-9);
    assert_eq!(table[2].actual, 0.0);
    assert_abs_diff_eq!(table[2].diff, 5.1, epsilon = 1e-9);
    for row in &table {
        assert_abs_diff_eq!(row.diff, row.predicted - row.actual, epsilon = 1e-6);
    }

    let render_text = fs::read_to_string(&outputs.paths.render_table).expect("read txt");
    let first_fields: Vec<&str> = render_text
        .lines()
        .next()
        .expect("first line")
        .split_whitespace()
        .collect();
    assert_eq!(render_text.lines().count(), 3);
    assert_eq!(first_fields[0], "1");

    let stats_text =
        fs::read_to_string(&outputs.paths.regional_statistics).expect("read stats table");
    // Header plus eight statistics for each of three regions.
    assert_eq!(stats_text.lines().count(), 1 + 8 * 3);
    assert!(stats_text.contains("2,LH_SomMot_1,Left somatomotor first,left,volume,4.0"));

    let calls = runner.calls.borrow();
    assert_eq!(calls.len(), 3);
    let tokens: Vec<Option<&str>> = calls
        .iter()
        .map(|(invocation, _)| invocation.threshold.as_ref().map(|t| t.token.as_str()))
        .collect();
    assert_eq!(tokens, vec![Some("0"), Some("1.5"), None]);
    for (invocation, working_dir) in calls.iter() {
        assert_eq!(working_dir, &fx.inputs.output_dir);
        assert!(invocation.args.contains(&"sub-01_predictedCT.txt".to_string()));
    }
    assert_eq!(outputs.render_plan.len(), 3);
}

#[test]
fn extra_model_artifact_aborts_before_any_output() {
    let fx = fixture();
    write_model(&fx.config.model_dir, "region_4.toml", Some(4), 4.0);

    let runner = RecordingRunner::default();
    match run_subject(&fx.config, &fx.inputs, &runner) {
        Err(PipelineError::Alignment(AlignmentError::CountMismatch {
            regions,
            predictors,
        })) => {
            assert_eq!(regions, 3);
            assert_eq!(predictors, 4);
        }
        other => panic!("Expected an alignment error, got {other:?}"),
    }
    assert!(!fx.inputs.output_dir.exists());
    assert!(runner.calls.borrow().is_empty());
}

#[test]
fn positional_alignment_accepts_unkeyed_artifacts() {
    let fx = fixture();
    for n in 1..=3u32 {
        write_model(&fx.config.model_dir, &format!("region_{n}.toml"), None, n as f64);
    }
    let config = EngineConfig {
        alignment: ModelAlignment::Positional,
        write_regional_statistics: false,
        ..fx.config.clone()
    };

    let outputs =
        run_subject(&config, &fx.inputs, &RecordingRunner::default()).expect("pipeline run");
    assert_abs_diff_eq!(outputs.records[1].predicted, 4.1, epsilon = 1e-9);
    assert!(!outputs.regional_statistics_written);
    assert!(!outputs.paths.regional_statistics.exists());
}

#[test]
fn keyed_alignment_rejects_unkeyed_artifacts() {
    let fx = fixture();
    write_model(&fx.config.model_dir, "region_2.toml", None, 2.0);
    assert!(matches!(
        run_subject(&fx.config, &fx.inputs, &RecordingRunner::default()),
        Err(PipelineError::ModelLoad(_))
    ));
}

#[test]
fn non_finite_age_is_rejected_before_reading_inputs() {
    let fx = fixture();
    let inputs = SubjectInputs {
        covariates: Covariates {
            age: f64::NAN,
            sex: 0,
        },
        label_volume: fx.dir.path().join("missing.toml"),
        ..fx.inputs.clone()
    };
    assert!(matches!(
        run_subject(&fx.config, &inputs, &RecordingRunner::default()),
        Err(PipelineError::InvalidCovariate(_))
    ));
}

#[test]
fn mismatched_volume_shapes_are_a_data_error() {
    let fx = fixture();
    Volume {
        data: Array3::zeros((2, 2, 1)),
        spacing: [1.0, 1.0, 2.0],
    }
    .save(&fx.inputs.outcome_volume, Path::new("ct_small.raw"))
    .expect("save thickness volume");

    assert!(matches!(
        run_subject(&fx.config, &fx.inputs, &RecordingRunner::default()),
        Err(PipelineError::Data(_))
    ));
}

#[test]
fn existing_table_can_be_rendered_again() {
    let fx = fixture();
    let outputs =
        run_subject(&fx.config, &fx.inputs, &RecordingRunner::default()).expect("pipeline run");
    fs::remove_file(&outputs.paths.render_table).expect("remove txt");

    let settings = RenderSettings {
        script: PathBuf::from("render/figure.sh"),
        ..RenderSettings::default()
    };
    let runner = RecordingRunner::default();
    let plan = rerender_predictions(
        &settings,
        &outputs.paths.predicted_table,
        &parse_thresholds("2.00").expect("thresholds"),
        &runner,
    )
    .expect("rerender");

    assert_eq!(plan.len(), 2);
    assert_eq!(runner.calls.borrow().len(), 2);
    // The renderer runs inside the output directory, so the script must not stay relative.
    let expected_script = std::env::current_dir()
        .expect("current dir")
        .join("render/figure.sh");
    assert_eq!(plan[0].args[1], expected_script.display().to_string());
    assert!(plan[0].args.contains(&"2.00".to_string()));
    let text = fs::read_to_string(&outputs.paths.render_table).expect("txt rebuilt");
    assert_eq!(text.lines().count(), 3);
}

#[test]
fn cli_dry_run_writes_tables_without_rendering() {
    let fx = fixture();
    let config_path = fx.dir.path().join("engine.toml");
    fs::write(
        &config_path,
        format!(
            "label_index = {:?}\nmodel_dir = {:?}\n\n[render]\nprogram = \"renderer-that-must-not-run\"\n",
            fx.config.label_index.display().to_string(),
            fx.config.model_dir.display().to_string()
        ),
    )
    .expect("write config");

    let exe = env!("CARGO_BIN_EXE_thickscore");
    let output = Command::new(exe)
        .args([
            "run",
            "--config",
            config_path.to_str().expect("path str"),
            "--label-image-file",
            fx.inputs.label_volume.to_str().expect("path str"),
            "--ct-image-file",
            fx.inputs.outcome_volume.to_str().expect("path str"),
            "--patient-age",
            "40",
            "--patient-sex",
            "1",
            "--thresholds",
            "0 1.5",
            "--prefix",
            "sub-01",
            "--output-dir",
            fx.inputs.output_dir.to_str().expect("path str"),
            "--dry-run",
        ])
        .output()
        .expect("run thickscore cli");

    assert!(
        output.status.success(),
        "CLI failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(fx.inputs.output_dir.join("sub-01_predictedCT.csv").exists());
    assert!(fx.inputs.output_dir.join("sub-01_predictedCT.txt").exists());
}

#[test]
fn cli_reports_alignment_failure_with_exit_status_one() {
    let fx = fixture();
    write_model(&fx.config.model_dir, "region_4.toml", Some(4), 4.0);

    let exe = env!("CARGO_BIN_EXE_thickscore");
    let output = Command::new(exe)
        .args([
            "run",
            "--label-index-file",
            fx.config.label_index.to_str().expect("path str"),
            "--model-dir",
            fx.config.model_dir.to_str().expect("path str"),
            "--label-image-file",
            fx.inputs.label_volume.to_str().expect("path str"),
            "--ct-image-file",
            fx.inputs.outcome_volume.to_str().expect("path str"),
            "--patient-age",
            "40",
            "--patient-sex",
            "0",
            "--prefix",
            "sub-01",
            "--output-dir",
            fx.inputs.output_dir.to_str().expect("path str"),
            "--dry-run",
        ])
        .output()
        .expect("run thickscore cli");

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Alignment error"));
}
