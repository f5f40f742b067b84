//! Rollup CLI - Command-line interface for Synheart Rollup
//!
//! Commands:
//! - transform: Ingest measurements and write aggregates (batch mode)
//! - validate: Validate measurement submissions
//! - doctor: Diagnose configuration and mapping files

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use synheart_rollup::categorize::builtin_mappings;
use synheart_rollup::logging::{init_logging, LogFormat};
use synheart_rollup::schema::{MeasurementSubmission, SubmissionAdapter, SCHEMA_VERSION};
use synheart_rollup::store::MappingStore;
use synheart_rollup::types::{AggregateView, CanonicalMapping, StatusCounts};
use synheart_rollup::{EngineConfig, Granularity, RollupEngine, RollupError};
use synheart_rollup::{PRODUCER_NAME, ROLLUP_VERSION};

/// Rollup - Categorization and multi-granularity aggregation of health data
#[derive(Parser)]
#[command(name = "rollup")]
#[command(author = "Synheart AI Inc")]
#[command(version = ROLLUP_VERSION)]
#[command(about = "Aggregate health measurements into canonical rollups", long_about = None)]
struct Cli {
    /// Log format (json or pretty); falls back to ROLLUP_LOG_FORMAT
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest measurements and write aggregates (batch mode)
    Transform {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long)]
        output: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        /// Granularities to export (defaults to all)
        #[arg(short, long, value_delimiter = ',')]
        granularity: Vec<GranularityArg>,

        /// Engine configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Load a mapping table from file
        #[arg(long)]
        load_mappings: Option<PathBuf>,

        /// Save the mapping table, including inferred entries, after processing
        #[arg(long)]
        save_mappings: Option<PathBuf>,
    },

    /// Validate measurement submissions
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration and mapping files
    Doctor {
        /// Check an engine configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Check a mapping table file
        #[arg(long)]
        mappings: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one submission per line)
    Ndjson,
    /// JSON array of submissions
    Json,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one aggregate per line)
    Ndjson,
    /// JSON array of aggregates
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

#[derive(Clone, Copy, ValueEnum)]
enum GranularityArg {
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl From<GranularityArg> for Granularity {
    fn from(g: GranularityArg) -> Self {
        match g {
            GranularityArg::Hour => Granularity::Hour,
            GranularityArg::Day => Granularity::Day,
            GranularityArg::Week => Granularity::Week,
            GranularityArg::Month => Granularity::Month,
            GranularityArg::Quarter => Granularity::Quarter,
            GranularityArg::Year => Granularity::Year,
        }
    }
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let format = cli
        .log_format
        .clone()
        .or_else(|| std::env::var("ROLLUP_LOG_FORMAT").ok())
        .and_then(|f| LogFormat::parse(&f))
        .unwrap_or_default();
    init_logging(format, "warn");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), RollupCliError> {
    match cli.command {
        Commands::Transform {
            input,
            output,
            input_format,
            output_format,
            granularity,
            config,
            load_mappings,
            save_mappings,
        } => cmd_transform(TransformArgs {
            input: &input,
            output: &output,
            input_format,
            output_format,
            granularities: granularity.into_iter().map(Granularity::from).collect(),
            config: config.as_deref(),
            load_mappings: load_mappings.as_deref(),
            save_mappings: save_mappings.as_deref(),
        }),

        Commands::Validate {
            input,
            input_format,
            json,
        } => cmd_validate(&input, input_format, json),

        Commands::Doctor {
            config,
            mappings,
            json,
        } => cmd_doctor(config.as_deref(), mappings.as_deref(), json),
    }
}

struct TransformArgs<'a> {
    input: &'a Path,
    output: &'a Path,
    input_format: InputFormat,
    output_format: OutputFormat,
    granularities: Vec<Granularity>,
    config: Option<&'a Path>,
    load_mappings: Option<&'a Path>,
    save_mappings: Option<&'a Path>,
}

/// One exported aggregate row
#[derive(Serialize)]
struct ExportRecord {
    producer: &'static str,
    user_id: String,
    #[serde(flatten)]
    aggregate: AggregateView,
}

fn cmd_transform(args: TransformArgs<'_>) -> Result<(), RollupCliError> {
    let submissions = read_submissions(args.input, &args.input_format)?;
    if submissions.is_empty() {
        return Err(RollupCliError::NoMeasurements);
    }

    let (measurements, rejected) = SubmissionAdapter::partition(&submissions);
    for r in &rejected {
        tracing::warn!(index = r.index, metric = %r.metric_type, error = %r.error, "Skipping invalid submission");
    }
    if measurements.is_empty() {
        return Err(RollupCliError::ValidationFailed(rejected.len()));
    }

    let config = load_config(args.config)?;
    let engine = RollupEngine::in_memory(config)?;

    if let Some(path) = args.load_mappings {
        let mappings: Vec<CanonicalMapping> = serde_json::from_str(&fs::read_to_string(path)?)?;
        for mapping in mappings {
            engine.store().upsert_mapping(mapping)?;
        }
    }

    // (user, metric) pairs to export
    let series: BTreeSet<(String, String)> = measurements
        .iter()
        .map(|m| (m.user_id.clone(), m.metric_type.clone()))
        .collect();
    let users: BTreeSet<String> = series.iter().map(|(u, _)| u.clone()).collect();

    engine.submit_all(measurements)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(engine.process_all_pending())?;
    tracing::info!(
        completed = report.completed,
        failed = report.failed,
        aggregates = report.aggregates_written,
        "Processing finished"
    );

    let granularities = if args.granularities.is_empty() {
        Granularity::ALL.to_vec()
    } else {
        args.granularities
    };

    let mut records = Vec::new();
    for granularity in granularities {
        for (user_id, metric_type) in &series {
            for aggregate in engine.aggregates(
                granularity,
                user_id,
                metric_type,
                DateTime::<Utc>::MIN_UTC,
                DateTime::<Utc>::MAX_UTC,
            )? {
                records.push(ExportRecord {
                    producer: PRODUCER_NAME,
                    user_id: user_id.clone(),
                    aggregate,
                });
            }
        }
    }

    if let Some(path) = args.save_mappings {
        let mappings = engine.store().all_mappings()?;
        fs::write(path, serde_json::to_string_pretty(&mappings)?)?;
    }

    let output_data = format_output(&records, &args.output_format)?;
    if args.output.to_string_lossy() == "-" {
        print!("{}", output_data);
    } else {
        fs::write(args.output, output_data)?;
    }

    for user_id in users {
        let counts = engine.status_counts(&user_id)?;
        eprintln!("{}", serde_json::to_string(&StatusLine { user_id, counts })?);
    }

    Ok(())
}

#[derive(Serialize)]
struct StatusLine {
    user_id: String,
    counts: StatusCounts,
}

fn cmd_validate(input: &Path, input_format: InputFormat, json: bool) -> Result<(), RollupCliError> {
    let submissions = read_submissions(input, &input_format)?;
    let results = SubmissionAdapter::validate_submissions(&submissions);

    let report = ValidationReport {
        total_submissions: submissions.len(),
        valid_submissions: submissions.len() - results.len(),
        invalid_submissions: results.len(),
        errors: results
            .iter()
            .map(|r| ValidationErrorDetail {
                index: r.index,
                metric_type: r.metric_type.clone(),
                error: r.error.to_string(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total submissions:   {}", report.total_submissions);
        println!("Valid submissions:   {}", report.valid_submissions);
        println!("Invalid submissions: {}", report.invalid_submissions);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!(
                    "  - {} (index {}): {}",
                    if err.metric_type.is_empty() { "unknown" } else { &err.metric_type },
                    err.index,
                    err.error
                );
            }
        }
    }

    if report.invalid_submissions > 0 {
        Err(RollupCliError::ValidationFailed(report.invalid_submissions))
    } else {
        Ok(())
    }
}

fn cmd_doctor(config: Option<&Path>, mappings: Option<&Path>, json: bool) -> Result<(), RollupCliError> {
    let mut checks: Vec<DoctorCheck> = vec![
        DoctorCheck::ok("rollup_version", format!("Rollup version {}", ROLLUP_VERSION)),
        DoctorCheck::ok("schema_version", format!("Input schema: {}", SCHEMA_VERSION)),
        DoctorCheck::ok(
            "builtin_mappings",
            format!("{} builtin canonical mappings", builtin_mappings().len()),
        ),
    ];

    checks.push(match load_config(config) {
        Ok(c) => DoctorCheck::ok(
            "config",
            format!(
                "batch size {}, {} workers, {} retries, default status {}",
                c.batch_size, c.workers, c.max_retries, c.default_status
            ),
        ),
        Err(e) => DoctorCheck::error("config", e.to_string()),
    });

    if let Some(path) = mappings {
        checks.push(check_mappings(path));
    }

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: ROLLUP_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Rollup Doctor Report");
        println!("====================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(RollupCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn check_mappings(path: &Path) -> DoctorCheck {
    if !path.exists() {
        return DoctorCheck {
            name: "mappings".to_string(),
            status: CheckStatus::Warning,
            message: "Mapping file does not exist".to_string(),
        };
    }
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<Vec<CanonicalMapping>>(&content) {
            Ok(table) => DoctorCheck::ok("mappings", format!("Mapping file valid ({} entries)", table.len())),
            Err(e) => DoctorCheck::error("mappings", format!("Invalid mapping JSON: {}", e)),
        },
        Err(e) => DoctorCheck::error("mappings", format!("Cannot read mapping file: {}", e)),
    }
}

// Helper functions

fn read_submissions(
    input: &Path,
    input_format: &InputFormat,
) -> Result<Vec<MeasurementSubmission>, RollupCliError> {
    let input_data = if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(input)?
    };

    Ok(match input_format {
        InputFormat::Ndjson => SubmissionAdapter::parse_ndjson(&input_data)?,
        InputFormat::Json => SubmissionAdapter::parse_array(&input_data)?,
    })
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, RollupError> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn format_output(records: &[ExportRecord], format: &OutputFormat) -> Result<String, RollupCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut lines: Vec<String> = Vec::new();
            for record in records {
                lines.push(serde_json::to_string(record)?);
            }
            Ok(lines.join("\n") + "\n")
        }
        OutputFormat::Json => Ok(serde_json::to_string(records)?),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(records)?),
    }
}

// Error types

#[derive(Debug)]
enum RollupCliError {
    Io(io::Error),
    Engine(RollupError),
    Json(serde_json::Error),
    NoMeasurements,
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for RollupCliError {
    fn from(e: io::Error) -> Self {
        RollupCliError::Io(e)
    }
}

impl From<RollupError> for RollupCliError {
    fn from(e: RollupError) -> Self {
        RollupCliError::Engine(e)
    }
}

impl From<serde_json::Error> for RollupCliError {
    fn from(e: serde_json::Error) -> Self {
        RollupCliError::Json(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<RollupCliError> for CliError {
    fn from(e: RollupCliError) -> Self {
        match e {
            RollupCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            RollupCliError::Engine(RollupError::Config(msg)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: msg,
                hint: Some("Run 'rollup doctor --config <file>' for details".to_string()),
            },
            RollupCliError::Engine(RollupError::Validation(e)) => CliError {
                code: "VALIDATION_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'rollup validate' for details".to_string()),
            },
            RollupCliError::Engine(e @ (RollupError::ParseError(_) | RollupError::JsonError(_))) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some(format!("Ensure input matches {} schema", SCHEMA_VERSION)),
            },
            RollupCliError::Engine(e) => CliError {
                code: "ENGINE_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            RollupCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            RollupCliError::NoMeasurements => CliError {
                code: "NO_MEASUREMENTS".to_string(),
                message: "No measurements found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            RollupCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} submissions failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            RollupCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(Serialize)]
struct ValidationReport {
    total_submissions: usize,
    valid_submissions: usize,
    invalid_submissions: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(Serialize)]
struct ValidationErrorDetail {
    index: usize,
    metric_type: String,
    error: String,
}

#[derive(Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

impl DoctorCheck {
    fn ok(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Ok,
            message,
        }
    }

    fn error(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Error,
            message,
        }
    }
}

#[derive(Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
