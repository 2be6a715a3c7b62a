#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;

use thickscore::config::EngineConfig;
use thickscore::ensemble::ModelAlignment;
use thickscore::export::{OutputPaths, write_regional_statistics};
use thickscore::pipeline::{
    PipelineError, SubjectInputs, compute_subject_statistics, rerender_predictions, run_subject,
};
use thickscore::render::{DryRunRunner, ProcessRunner, RenderRunner, parse_thresholds};
use thickscore::types::Covariates;

#[derive(Clone, Copy, ValueEnum)]
pub enum AlignmentCli {
    Keyed,
    Positional,
}

impl From<AlignmentCli> for ModelAlignment {
    fn from(value: AlignmentCli) -> Self {
        match value {
            AlignmentCli::Keyed => ModelAlignment::Keyed,
            AlignmentCli::Positional => ModelAlignment::Positional,
        }
    }
}

/// Inputs shared by the subcommands that read volumes.
#[derive(Args)]
pub struct VolumeArgs {
    /// CSV defining the regions (label_number, label_abbrev_name, label_full_name, hemisphere)
    #[arg(long, value_name = "PATH")]
    pub label_index_file: Option<PathBuf>,

    /// Header of the parcellation volume in subject space
    #[arg(long, value_name = "PATH")]
    pub label_image_file: PathBuf,

    /// Header of the cortical thickness volume
    #[arg(long, value_name = "PATH")]
    pub ct_image_file: PathBuf,

    /// Prefix of every output file name
    #[arg(long)]
    pub prefix: String,

    /// Directory receiving the output tables
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// TOML configuration file (command-line flags take precedence)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub volumes: VolumeArgs,

    /// Age of the subject in years
    #[arg(long, allow_negative_numbers = true)]
    pub patient_age: f64,

    /// Sex code of the subject (the models use 0 and 1)
    #[arg(long, allow_negative_numbers = true)]
    pub patient_sex: i32,

    /// Space-separated lower thresholds, one figure each, e.g. "0 1.5"
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub thresholds: String,

    /// Directory holding one model artifact per region
    #[arg(long, value_name = "DIR")]
    pub model_dir: Option<PathBuf>,

    /// How model artifacts are matched to regions
    #[arg(long, value_enum)]
    pub alignment: Option<AlignmentCli>,

    /// Skip writing <prefix>_regional_stats.csv
    #[arg(long)]
    pub no_regional_statistics: bool,

    /// Log the render commands instead of running them
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args)]
pub struct RenderArgs {
    /// Existing <prefix>_predictedCT.csv to render again
    #[arg(long, value_name = "PATH")]
    pub predicted_table: PathBuf,

    /// Space-separated lower thresholds, one figure each, e.g. "0 1.5"
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub thresholds: String,

    /// TOML configuration file providing the [render] settings
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log the render commands instead of running them
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Parser)]
#[command(
    name = "thickscore",
    version,
    about = "Regional cortical thickness aggregation and normative prediction",
    long_about = "Aggregates a cortical thickness volume over a parcellation, predicts the \
                 expected thickness of every region from age and sex, and renders the \
                 difference onto the cortical surface."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Score one subject end to end
    #[command(about = "Aggregate, predict and render one subject")]
    Run(RunArgs),

    /// Compute regional statistics only
    #[command(about = "Write the long-form regional statistics table")]
    Stats(VolumeArgs),

    /// Re-render an existing prediction table
    #[command(about = "Rebuild the render table and run the renderer")]
    Render(RenderArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Stats(args)) => stats(args),
        Some(Commands::Render(args)) => render(args),
        None => {
            if let Err(e) = Cli::command().print_help() {
                log::error!("{e}");
                process::exit(1);
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        log::error!("{e}");
        process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig, PipelineError> {
    match path {
        Some(path) => {
            log::info!("Reading configuration from '{}'", path.display());
            Ok(EngineConfig::load(path)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn select_runner(dry_run: bool) -> Box<dyn RenderRunner> {
    if dry_run {
        Box::new(DryRunRunner)
    } else {
        Box::new(ProcessRunner)
    }
}

fn run(args: RunArgs) -> Result<(), PipelineError> {
    let mut config = load_config(args.volumes.config.as_ref())?;
    if let Some(label_index) = args.volumes.label_index_file {
        config.label_index = label_index;
    }
    if let Some(model_dir) = args.model_dir {
        config.model_dir = model_dir;
    }
    if let Some(alignment) = args.alignment {
        config.alignment = alignment.into();
    }
    if args.no_regional_statistics {
        config.write_regional_statistics = false;
    }

    let inputs = SubjectInputs {
        label_volume: args.volumes.label_image_file,
        outcome_volume: args.volumes.ct_image_file,
        covariates: Covariates {
            age: args.patient_age,
            sex: args.patient_sex,
        },
        thresholds: parse_thresholds(&args.thresholds)?,
        prefix: args.volumes.prefix,
        output_dir: args.volumes.output_dir,
    };

    let runner = select_runner(args.dry_run);
    let outputs = run_subject(&config, &inputs, runner.as_ref())?;

    println!(
        "Wrote {} regional predictions to {}",
        outputs.records.len(),
        outputs.paths.predicted_table.display()
    );
    if !outputs.empty_regions.is_empty() {
        println!(
            "{} region(s) had no voxels and were zero-filled.",
            outputs.empty_regions.len()
        );
    }
    Ok(())
}

fn stats(args: VolumeArgs) -> Result<(), PipelineError> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(label_index) = args.label_index_file {
        config.label_index = label_index;
    }

    let (index, stats) =
        compute_subject_statistics(&config.label_index, &args.label_image_file, &args.ct_image_file)?;
    let paths = OutputPaths::new(&args.output_dir, &args.prefix);
    write_regional_statistics(&stats, &paths.regional_statistics)?;

    println!(
        "Wrote statistics for {} regions to {}",
        index.len(),
        paths.regional_statistics.display()
    );
    Ok(())
}

fn render(args: RenderArgs) -> Result<(), PipelineError> {
    let config = load_config(args.config.as_ref())?;
    let thresholds = parse_thresholds(&args.thresholds)?;
    let runner = select_runner(args.dry_run);
    let plan = rerender_predictions(
        &config.render,
        &args.predicted_table,
        &thresholds,
        runner.as_ref(),
    )?;
    println!("Ran {} render command(s)", plan.len());
    Ok(())
}
