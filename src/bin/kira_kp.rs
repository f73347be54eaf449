use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_ko_pipeline::app::{App, SubmitResult, TaskReport};
use kira_ko_pipeline::config::{ConfigLoader, ResolvedConfig};
use kira_ko_pipeline::error::PipelineError;
use kira_ko_pipeline::local::{JobState, LocalScheduler};
use kira_ko_pipeline::output::{JsonOutput, OutputMode, render_plan};
use kira_ko_pipeline::scheduler::SlurmScheduler;
use kira_ko_pipeline::stage::{StageId, StageMode};
use kira_ko_pipeline::tools::SystemTools;

const DEFAULT_CONFIG: &str = "kira-kp.json";

#[derive(Parser)]
#[command(name = "kira-kp")]
#[command(about = "Resumable metagenome profiling and KEGG orthology pipeline on a batch scheduler")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Show which stages would run")]
    Plan(PlanArgs),
    #[command(about = "Submit every stage that needs to run")]
    Submit(SubmitArgs),
    #[command(about = "Run one task of a stage (used by submitted jobs)")]
    Task(TaskArgs),
    #[command(about = "Report versions of the configured external tools")]
    Tools,
}

#[derive(Args, Clone, Default)]
struct PlanArgs {
    #[arg(long)]
    no_resume: bool,

    #[arg(long, value_delimiter = ',')]
    skip: Vec<StageId>,

    #[arg(long, value_delimiter = ',')]
    force: Vec<StageId>,
}

#[derive(Args)]
struct SubmitArgs {
    #[command(flatten)]
    plan: PlanArgs,

    #[arg(long)]
    local: bool,

    #[arg(long)]
    max_concurrent: Option<usize>,
}

#[derive(Args)]
struct TaskArgs {
    #[arg(long)]
    stage: StageId,

    /// Defaults to SLURM_ARRAY_TASK_ID.
    #[arg(long)]
    index: Option<usize>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::MissingConfig
        | PipelineError::ConfigRead(_)
        | PipelineError::ConfigParse(_)
        | PipelineError::MissingConfigValue(_)
        | PipelineError::InvalidGroupSpec(_)
        | PipelineError::InvalidLevel(_)
        | PipelineError::InvalidStage(_)
        | PipelineError::EmptyAnnotations(_)
        | PipelineError::NoSamples(_) => 2,
        PipelineError::MissingTool(_)
        | PipelineError::ToolFailed { .. }
        | PipelineError::Scheduler(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Plan(args) => run_plan(apply_plan_args(config, &args), output_mode),
        Commands::Submit(args) => {
            let mut config = apply_plan_args(config, &args.plan);
            if args.max_concurrent.is_some() {
                config.max_concurrent = args.max_concurrent;
            }
            run_submit(config, cli.config.as_deref(), args.local, output_mode)
        }
        Commands::Task(args) => run_task(config, args, output_mode),
        Commands::Tools => {
            let info = SystemTools::new(&config).tool_info();
            match output_mode {
                OutputMode::Json => JsonOutput::print_tools(&info).into_diagnostic()?,
                OutputMode::Human => {
                    let show = |value: &Option<String>| {
                        value.clone().unwrap_or_else(|| "not found".to_string())
                    };
                    println!("trimmer:    {}", show(&info.trimmer));
                    println!("classifier: {}", show(&info.classifier));
                    println!("aligner:    {}", show(&info.aligner));
                }
            }
            Ok(())
        }
    }
}

fn apply_plan_args(mut config: ResolvedConfig, args: &PlanArgs) -> ResolvedConfig {
    if args.no_resume {
        config.auto_resume = false;
    }
    for stage in &args.force {
        config.stage_modes.insert(*stage, StageMode::Run);
    }
    for stage in &args.skip {
        config.stage_modes.insert(*stage, StageMode::Skip);
    }
    config
}

fn run_plan(config: ResolvedConfig, output_mode: OutputMode) -> miette::Result<()> {
    let tools = SystemTools::new(&config);
    let app = App::new(config, tools)?;
    let plan = app.plan()?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_plan(&plan).into_diagnostic()?,
        OutputMode::Human => print!("{}", render_plan(&plan)),
    }
    Ok(())
}

fn run_submit(
    config: ResolvedConfig,
    config_arg: Option<&str>,
    local: bool,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let log_dir = config.log_dir.clone();
    let settings = config.scheduler.clone();
    let tools = SystemTools::new(&config);
    let app = App::new(config, tools)?;
    let plan = app.plan()?;

    if local {
        let scheduler = LocalScheduler::new(&app);
        let result = app.submit(plan, &scheduler)?;
        print_submissions(&result, output_mode)?;
        let unfinished = scheduler
            .jobs()
            .into_iter()
            .filter(|(_, job)| job.state != JobState::Succeeded)
            .count();
        if unfinished > 0 {
            return Err(PipelineError::Scheduler(format!(
                "{unfinished} local job(s) did not succeed"
            ))
            .into());
        }
        return Ok(());
    }

    let executable = std::env::current_exe()
        .into_diagnostic()
        .and_then(|path| {
            Utf8PathBuf::from_path_buf(path)
                .map_err(|_| miette::Report::msg("executable path is not UTF-8"))
        })?;
    let config_path = absolute_config_path(config_arg.unwrap_or(DEFAULT_CONFIG))?;
    let scheduler = SlurmScheduler::new(executable, config_path, log_dir, settings);
    let result = app.submit(plan, &scheduler)?;
    print_submissions(&result, output_mode)
}

fn absolute_config_path(path: &str) -> miette::Result<Utf8PathBuf> {
    let canonical = std::fs::canonicalize(path)
        .map_err(|_| PipelineError::ConfigRead(Utf8PathBuf::from(path)))?;
    Utf8PathBuf::from_path_buf(canonical)
        .map_err(|_| miette::Report::msg("config path is not UTF-8"))
}

fn print_submissions(result: &SubmitResult, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => JsonOutput::print_submissions(result).into_diagnostic()?,
        OutputMode::Human => {
            print!("{}", render_plan(&result.plan));
            for submission in &result.submissions {
                let array = submission
                    .array_size
                    .map(|size| format!(" [array of {size}]"))
                    .unwrap_or_default();
                println!(
                    "submitted {} as {}{array}",
                    submission.stage, submission.handle
                );
            }
        }
    }
    Ok(())
}

fn run_task(config: ResolvedConfig, args: TaskArgs, output_mode: OutputMode) -> miette::Result<()> {
    let index = match args.index {
        Some(index) => Some(index),
        None => std::env::var("SLURM_ARRAY_TASK_ID")
            .ok()
            .map(|raw| raw.trim().parse::<usize>())
            .transpose()
            .map_err(|err| miette::Report::msg(format!("invalid SLURM_ARRAY_TASK_ID: {err}")))?,
    };
    let tools = SystemTools::new(&config);
    let app = App::new(config, tools)?;
    let report = app.execute_task(args.stage, index)?;
    print_task(&report, output_mode)
}

fn print_task(report: &TaskReport, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => JsonOutput::print_task(report).into_diagnostic()?,
        OutputMode::Human => {
            for unit in &report.units {
                println!("{} {}", unit.unit, unit.outcome.as_str());
            }
        }
    }
    Ok(())
}
