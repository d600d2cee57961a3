//! Tandem CLI.
//!
//! Generates, builds, packages and publishes the server and client
//! bindings of one API contract.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};

use tandem_pipeline::{
    Contract, ContractSummary, Goal, Pipeline, PipelineError, PipelineOptions, PipelineReport,
    ProjectConfig, TargetKind, Version, VersionResolver,
};
use tandem_telemetry::TelemetryConfig;

#[derive(Parser, Debug)]
#[command(name = "tandem", about = "Contract-driven server and client builds", version)]
struct Cli {
    /// Project configuration file.
    #[arg(long, global = true, env = "TANDEM_CONFIG", default_value = "tandem.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, env = "TANDEM_LOG", default_value = "info")]
    log_level: String,

    /// Log format (json or pretty).
    #[arg(long, global = true, env = "TANDEM_LOG_FORMAT", default_value = "json")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate the server sources only.
    GenerateServer(RunArgs),

    /// Generate the client sources only.
    GenerateClient(RunArgs),

    /// Generate and compile both bindings.
    Build(RunArgs),

    /// Build and package both bindings as versioned archives.
    Package(RunArgs),

    /// Package both bindings and upload them to the registry.
    Publish(RunArgs),

    /// Print the version the next package would carry.
    Version {
        /// Use this version instead of reading tag history.
        #[arg(long = "version-override", env = "TANDEM_VERSION")]
        version_override: Option<String>,
    },

    /// Summarize the contract.
    Inspect {
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Validate the project configuration without running anything.
    Check,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Regenerate even when the sources are current.
    #[arg(long)]
    force: bool,

    /// Tasks allowed to run at once.
    #[arg(long, default_value_t = 2)]
    jobs: usize,

    /// Use this version instead of reading tag history.
    #[arg(long = "version-override", env = "TANDEM_VERSION")]
    version_override: Option<String>,

    /// Report format.
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

// Exit codes
const EXIT_STAGE_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_MISSING_CONTRACT: u8 = 3;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let telemetry = match TelemetryConfig::from_names(&cli.log_level, &cli.log_format) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Err(e) = tandem_telemetry::init(&telemetry) {
        eprintln!("error: {}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    let config = match ProjectConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command {
        Command::GenerateServer(args) => run(config, Goal::Generate, &[TargetKind::Server], args),
        Command::GenerateClient(args) => run(config, Goal::Generate, &[TargetKind::Client], args),
        Command::Build(args) => run(config, Goal::Build, &TargetKind::ALL, args),
        Command::Package(args) => run(config, Goal::Package, &TargetKind::ALL, args),
        Command::Publish(args) => run(config, Goal::Publish, &TargetKind::ALL, args),
        Command::Version { version_override } => print_version(&config, version_override),
        Command::Inspect { format } => inspect(&config, format),
        Command::Check => match config.validate() {
            Ok(()) => {
                println!("{}: OK", cli.config.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::from(EXIT_CONFIG)
            }
        },
    }
}

fn parse_override(raw: Option<String>) -> Result<Option<Version>, ExitCode> {
    match raw.as_deref().map(str::parse::<Version>).transpose() {
        Ok(version) => Ok(version),
        Err(e) => {
            eprintln!("error: --version-override: {}", e);
            Err(ExitCode::from(EXIT_CONFIG))
        }
    }
}

fn run(config: ProjectConfig, goal: Goal, targets: &[TargetKind], args: RunArgs) -> ExitCode {
    let version_override = match parse_override(args.version_override) {
        Ok(version) => version,
        Err(code) => return code,
    };
    let options = PipelineOptions {
        force: args.force,
        max_parallel: args.jobs.max(1),
        version_override,
    };

    tracing::debug!(config = %config.base_dir.display(), goal = %goal, "starting run");
    let pipeline = Pipeline::new(config).with_options(options);
    let report = match pipeline.run(goal, targets) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match args.format {
        OutputFormat::Json => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("error: failed to serialize report: {}", e);
                return ExitCode::from(EXIT_STAGE_FAILURE);
            }
        },
        OutputFormat::Text => print_report(&report),
    }

    for (target, failure) in report.failures() {
        let code = failure.code.unwrap_or("E2000");
        match target {
            Some(target) => eprintln!(
                "error[{}] {} {}: {}",
                code, target, failure.stage, failure.message
            ),
            None => eprintln!("error[{}] {}: {}", code, failure.stage, failure.message),
        }
    }

    if report.is_success() {
        ExitCode::SUCCESS
    } else if report.missing_contract() {
        ExitCode::from(EXIT_MISSING_CONTRACT)
    } else {
        ExitCode::from(EXIT_STAGE_FAILURE)
    }
}

fn print_report(report: &PipelineReport) {
    if let Some(version) = &report.version {
        println!("version {}", version);
    }
    for branch in &report.branches {
        let mut line = format!("{} {}: {}", branch.target, branch.artifact_id, branch.state);
        if branch.up_to_date {
            line.push_str(" (sources up to date)");
        }
        if let Some(receipt) = &branch.receipt {
            line.push_str(&format!(" -> {}", receipt.location));
        } else if let Some(archive) = &branch.archive {
            line.push_str(&format!(" -> {}", archive.display()));
        } else if let Some(dir) = &branch.sources_dir {
            line.push_str(&format!(" -> {}", dir.display()));
        }
        println!("{}", line);
    }
}

fn print_version(config: &ProjectConfig, version_override: Option<String>) -> ExitCode {
    let version_override = match parse_override(version_override) {
        Ok(version) => version,
        Err(code) => return code,
    };
    let policy = match config.version_policy() {
        Ok(policy) => policy,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let version = VersionResolver::new(config.base_dir.clone(), policy)
        .with_override(version_override)
        .resolve();
    println!("{}", version);
    ExitCode::SUCCESS
}

fn inspect(config: &ProjectConfig, format: OutputFormat) -> ExitCode {
    let path = config.contract_path();
    match summarize(&path) {
        Ok((contract, summary)) => {
            match format {
                OutputFormat::Json => {
                    let value = serde_json::json!({
                        "path": contract.path(),
                        "sha256": contract.sha256(),
                        "size": contract.size(),
                        "summary": summary,
                    });
                    println!("{}", value);
                }
                OutputFormat::Text => {
                    println!(
                        "{} {} (OpenAPI {})",
                        summary.title, summary.api_version, summary.spec_version
                    );
                    println!("  file:       {}", contract.path().display());
                    println!("  sha256:     {}", contract.sha256());
                    println!("  paths:      {}", summary.path_count);
                    println!("  operations: {}", summary.operation_count);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e @ PipelineError::MissingContract { .. }) => {
            eprintln!("error: {}", e);
            ExitCode::from(EXIT_MISSING_CONTRACT)
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(EXIT_STAGE_FAILURE)
        }
    }
}

fn summarize(path: &Path) -> Result<(Contract, ContractSummary), PipelineError> {
    let contract = Contract::load(path)?;
    let summary = contract.summary()?;
    Ok((contract, summary))
}
