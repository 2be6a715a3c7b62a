//! Builds and runs the surface rendering commands for one subject.
//!
//! The renderer is an external script. Planning is pure: [`plan_render_invocations`]
//! turns a threshold list into one invocation per threshold plus one unbounded
//! invocation, and a [`RenderRunner`] decides whether they are actually spawned.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Threshold '{0}' is not a finite number.")]
    InvalidThreshold(String),
    #[error("Could not resolve render script path '{path}': {source}")]
    ScriptPath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to start renderer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Renderer exited with {status} for command `{command}`. stderr: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// How the renderer is called. Every field has a default, so an empty `[render]` table
/// reproduces the stock Schaefer 200x17 figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub program: String,
    pub script: PathBuf,
    pub atlas_scale: String,
    pub colormap: String,
    /// Upper end of the color scale, passed as `-h`.
    pub upper_bound: f64,
    /// Passed through as `-s`.
    pub surface: String,
    /// Passed through as `-k`.
    pub keep: String,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            program: "bash".to_string(),
            script: PathBuf::from("/opt/rendering/schaeferTableToFigure.sh"),
            atlas_scale: "schaefer200x17".to_string(),
            colormap: "red_yellow".to_string(),
            upper_bound: 1.75,
            surface: "1".to_string(),
            keep: "0".to_string(),
        }
    }
}

impl RenderSettings {
    /// Anchors a relative `script` at the current directory, since the renderer
    /// itself runs inside the output directory.
    pub fn with_absolute_script(&self) -> Result<Self, RenderError> {
        let script = std::path::absolute(&self.script).map_err(|source| RenderError::ScriptPath {
            path: self.script.clone(),
            source,
        })?;
        Ok(Self {
            script,
            ..self.clone()
        })
    }
}

/// A lower display bound, kept next to the token it was parsed from so the renderer
/// receives exactly what was requested.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub value: f64,
    pub token: String,
}

impl Threshold {
    pub fn parse(token: &str) -> Result<Self, RenderError> {
        match token.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Self {
                value,
                token: token.to_string(),
            }),
            _ => Err(RenderError::InvalidThreshold(token.to_string())),
        }
    }
}

impl From<f64> for Threshold {
    fn from(value: f64) -> Self {
        Self {
            value,
            token: value.to_string(),
        }
    }
}

/// One external command. `threshold` is `None` for the full-spectrum rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub threshold: Option<Threshold>,
}

impl RenderInvocation {
    /// The command as it would be typed into a shell, for logs and error messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .join(" ")
    }
}

/// Parses a space-separated threshold list. Empty input yields no thresholds.
pub fn parse_thresholds(text: &str) -> Result<Vec<Threshold>, RenderError> {
    text.split_whitespace().map(Threshold::parse).collect()
}

pub fn plan_render_invocations(
    settings: &RenderSettings,
    table_path: &Path,
    thresholds: &[Threshold],
) -> Vec<RenderInvocation> {
    thresholds
        .iter()
        .map(Some)
        .chain(std::iter::once(None))
        .map(|threshold| RenderInvocation {
            program: settings.program.clone(),
            args: render_args(settings, table_path, threshold),
            threshold: threshold.cloned(),
        })
        .collect()
}

fn render_args(
    settings: &RenderSettings,
    table_path: &Path,
    threshold: Option<&Threshold>,
) -> Vec<String> {
    let mut args = vec![
        "-x".to_string(),
        settings.script.display().to_string(),
        "-f".to_string(),
        table_path.display().to_string(),
        "-r".to_string(),
        settings.atlas_scale.clone(),
        "-s".to_string(),
        settings.surface.clone(),
        "-c".to_string(),
        settings.colormap.clone(),
        "-h".to_string(),
        settings.upper_bound.to_string(),
    ];
    if let Some(threshold) = threshold {
        args.push("-l".to_string());
        args.push(threshold.token.clone());
    }
    args.push("-k".to_string());
    args.push(settings.keep.clone());
    args
}

/// Executes render invocations.
pub trait RenderRunner {
    fn run(&self, invocation: &RenderInvocation, working_dir: &Path) -> Result<(), RenderError>;
}

/// Spawns each invocation as a child process and waits for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl RenderRunner for ProcessRunner {
    fn run(&self, invocation: &RenderInvocation, working_dir: &Path) -> Result<(), RenderError> {
        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(working_dir)
            .output()
            .map_err(|source| RenderError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(RenderError::Failed {
                command: invocation.command_line(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Logs each invocation instead of running it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunRunner;

impl RenderRunner for DryRunRunner {
    fn run(&self, invocation: &RenderInvocation, working_dir: &Path) -> Result<(), RenderError> {
        log::info!(
            "[dry run] would run in '{}': {}",
            working_dir.display(),
            invocation.command_line()
        );
        Ok(())
    }
}

/// Runs the plan in order and stops at the first failure.
pub fn execute_render_plan(
    runner: &dyn RenderRunner,
    plan: &[RenderInvocation],
    working_dir: &Path,
) -> Result<(), RenderError> {
    for invocation in plan {
        match &invocation.threshold {
            Some(threshold) => log::info!("Rendering with lower threshold {}", threshold.token),
            None => log::info!("Rendering full spectrum"),
        }
        log::debug!("{}", invocation.command_line());
        runner.run(invocation, working_dir)?;
    }
    log::info!("Done rendering.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingRunner {
        calls: RefCell<Vec<RenderInvocation>>,
        fail_at: Option<usize>,
    }

    impl RenderRunner for RecordingRunner {
        fn run(&self, invocation: &RenderInvocation, working_dir: &Path) -> Result<(), RenderError> {
            assert_eq!(working_dir, Path::new("/out"));
            let mut calls = self.calls.borrow_mut();
            if self.fail_at == Some(calls.len()) {
                return Err(RenderError::Failed {
                    command: invocation.command_line(),
                    status: "exit status: 1".to_string(),
                    stderr: String::new(),
                });
            }
            calls.push(invocation.clone());
            Ok(())
        }
    }

    fn values(thresholds: &[Threshold]) -> Vec<f64> {
        thresholds.iter().map(|t| t.value).collect()
    }

    #[test]
    fn thresholds_are_split_on_whitespace() {
        assert_eq!(values(&parse_thresholds("0 1.5").unwrap()), vec![0.0, 1.5]);
        assert_eq!(values(&parse_thresholds("  2\t-0.5 ").unwrap()), vec![2.0, -0.5]);
        assert!(parse_thresholds("").unwrap().is_empty());
    }

    #[test]
    fn threshold_token_reaches_the_renderer_verbatim() {
        let thresholds = parse_thresholds("0.50 1e-1").unwrap();
        assert_eq!(values(&thresholds), vec![0.5, 0.1]);

        let plan =
            plan_render_invocations(&RenderSettings::default(), Path::new("t.txt"), &thresholds);
        let lower_bounds: Vec<&str> = plan
            .iter()
            .filter_map(|invocation| {
                let at = invocation.args.iter().position(|a| a == "-l")?;
                invocation.args.get(at + 1).map(String::as_str)
            })
            .collect();
        assert_eq!(lower_bounds, vec!["0.50", "1e-1"]);
    }

    #[test]
    fn non_numeric_threshold_is_rejected() {
        match parse_thresholds("0 high") {
            Err(RenderError::InvalidThreshold(token)) => assert_eq!(token, "high"),
            other => panic!("Expected InvalidThreshold, got {:?}", other),
        }
        assert!(parse_thresholds("nan").is_err());
    }

    #[test]
    fn two_thresholds_plan_three_invocations() {
        let settings = RenderSettings::default();
        let plan = plan_render_invocations(
            &settings,
            Path::new("/out/sub_predictedCT.txt"),
            &[Threshold::from(0.0), Threshold::from(1.5)],
        );
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].threshold, Some(Threshold::from(0.0)));
        assert_eq!(plan[1].threshold.as_ref().map(|t| t.value), Some(1.5));
        assert_eq!(plan[2].threshold, None);

        assert_eq!(
            plan[1].command_line(),
            "bash -x /opt/rendering/schaeferTableToFigure.sh -f /out/sub_predictedCT.txt \
             -r schaefer200x17 -s 1 -c red_yellow -h 1.75 -l 1.5 -k 0"
        );
        assert!(!plan[2].args.contains(&"-l".to_string()));
    }

    #[test]
    fn empty_threshold_list_still_renders_full_spectrum() {
        let plan =
            plan_render_invocations(&RenderSettings::default(), Path::new("t.txt"), &[]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].threshold, None);
    }

    #[test]
    fn execution_runs_every_invocation_in_order() {
        let plan = plan_render_invocations(
            &RenderSettings::default(),
            Path::new("/out/t.txt"),
            &parse_thresholds("0 1.5").unwrap(),
        );
        let runner = RecordingRunner::default();
        execute_render_plan(&runner, &plan, Path::new("/out")).unwrap();
        assert_eq!(*runner.calls.borrow(), plan);
    }

    #[test]
    fn execution_stops_at_first_failure() {
        let plan = plan_render_invocations(
            &RenderSettings::default(),
            Path::new("/out/t.txt"),
            &parse_thresholds("0 1.5").unwrap(),
        );
        let runner = RecordingRunner {
            fail_at: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            execute_render_plan(&runner, &plan, Path::new("/out")),
            Err(RenderError::Failed { .. })
        ));
        assert_eq!(runner.calls.borrow().len(), 1);
    }

    #[test]
    fn relative_script_is_anchored_at_the_current_directory() {
        let settings = RenderSettings {
            script: PathBuf::from("scripts/figure.sh"),
            ..RenderSettings::default()
        };
        let resolved = settings.with_absolute_script().unwrap();
        assert!(resolved.script.is_absolute());
        assert_eq!(
            resolved.script,
            std::env::current_dir().unwrap().join("scripts/figure.sh")
        );
        assert_eq!(resolved.colormap, settings.colormap);

        let stock = RenderSettings::default();
        assert_eq!(stock.with_absolute_script().unwrap(), stock);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let invocation = RenderInvocation {
            program: "thickscore-renderer-that-does-not-exist".to_string(),
            args: Vec::new(),
            threshold: None,
        };
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ProcessRunner.run(&invocation, dir.path()),
            Err(RenderError::Spawn { .. })
        ));
    }
}
