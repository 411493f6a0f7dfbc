use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dotenvy::Error as DotenvError;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pgscout::app::AppContext;
use pgscout::config::{self, AppConfig};
use pgscout::datasource::DataSource;
use pgscout::db::{self, PgSource};
use pgscout::detectors::{Detector, DetectorKind, help_listing};
use pgscout::format::render_rows;
use pgscout::issue::Issue;
use pgscout::metrics::EngineMetrics;
use pgscout::monitor::{self, MonitorCommand};

#[derive(Debug, Parser)]
#[command(author, version, about = "pgscout: PostgreSQL issue detection from activity snapshots")]
struct Cli {
    /// Path to YAML configuration file. Defaults to env PGSCOUT_CONFIG or built-in defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log every statement and the resolved analysis window.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log monitor statements instead of executing them.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Analysis window length, e.g. `24h` or `90m`.
    #[arg(long, global = true, value_parser = parse_duration)]
    duration: Option<Duration>,

    /// How far before now the analysis window ends.
    #[arg(long, global = true, value_parser = parse_duration)]
    offset: Option<Duration>,

    /// Emit detector results as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Write Prometheus text-format metrics to this file after the run.
    #[arg(long, global = true)]
    metrics_out: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one detector (or `All`); ARG narrows to a sub-issue or table.
    Detect { name: String, arg: Option<String> },
    /// List the available detectors.
    Detectors,
    /// Maintain the snapshot tracking tables.
    Monitor {
        #[arg(value_enum)]
        action: MonitorAction,
    },
    /// Server and tracking-window overview.
    Summary,
    /// Run ad-hoc SQL and dump every row; `!path` reads the SQL from a file.
    QueryRows { sql: String },
    /// Run ad-hoc SQL and print the first column of the first row.
    QueryRow { sql: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MonitorAction {
    Initialize,
    Snapshot,
    Terminate,
    Reset,
}

impl From<MonitorAction> for MonitorCommand {
    fn from(action: MonitorAction) -> Self {
        match action {
            MonitorAction::Initialize => MonitorCommand::Initialize,
            MonitorAction::Snapshot => MonitorCommand::Snapshot,
            MonitorAction::Terminate => MonitorCommand::Terminate,
            MonitorAction::Reset => MonitorCommand::Reset,
        }
    }
}

#[derive(Debug, Serialize)]
struct DetectorReport<'a> {
    database: &'a str,
    detector: &'a str,
    duration_ms: i64,
    issues: &'a [Issue],
    warnings: &'a [String],
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(raw).map_err(|err| err.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    if let Command::Detectors = cli.command {
        print!("{}", help_listing());
        return Ok(());
    }

    let config = config::load_config(cli.config.as_deref())?;
    let ctx = build_context(&cli, config);
    let metrics = EngineMetrics::new()?;

    for database in target_databases(&ctx.config) {
        let pool = db::create_pool(&ctx.config, database.as_deref()).await?;
        let label = database.unwrap_or_else(|| ctx.config.database.clone());
        let source = PgSource::new(pool, label, ctx.config.schema.clone());

        let outcome = run_command(&cli, &ctx, &source, &metrics).await;
        source.close().await;
        outcome?;
    }

    if let Some(path) = &cli.metrics_out {
        fs::write(path, metrics.encode()?)
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "metrics written");
    }

    Ok(())
}

fn build_context(cli: &Cli, config: AppConfig) -> AppContext {
    let verbose = cli.verbose || config.analysis.verbose;
    let dry_run = cli.dry_run || config.analysis.dry_run;
    let duration = cli.duration.unwrap_or(config.analysis.duration);
    let offset = cli.offset.unwrap_or(config.analysis.offset);
    AppContext::new(config)
        .with_flags(verbose, dry_run)
        .with_window(duration, offset)
}

/// `None` means the database named in the DSN.
fn target_databases(config: &AppConfig) -> Vec<Option<String>> {
    if config.databases.is_empty() {
        vec![None]
    } else {
        config.databases.iter().cloned().map(Some).collect()
    }
}

async fn run_command(
    cli: &Cli,
    ctx: &AppContext,
    source: &PgSource,
    metrics: &EngineMetrics,
) -> Result<()> {
    let database = source.database_name();
    match &cli.command {
        Command::Detect { name, arg } => {
            let mut detector = Detector::by_name(name, ctx, source)?;
            if detector.kind() == DetectorKind::Help {
                print!("{}", help_listing());
                return Ok(());
            }
            detector.execute(arg.as_deref()).await;
            metrics.record_detector(
                database,
                detector.kind().name(),
                detector.duration(),
                detector.issues(),
                detector.warnings().len(),
            );

            if cli.json {
                let report = DetectorReport {
                    database,
                    detector: detector.kind().name(),
                    duration_ms: detector.duration_ms(),
                    issues: detector.issues(),
                    warnings: detector.warnings(),
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("DATABASE: {database}");
                for warning in detector.warnings() {
                    println!("WARNING: {warning}");
                }
                for issue in detector.issues() {
                    print!("{}", issue.dump());
                }
                println!(
                    "{} issue(s) in {}ms",
                    detector.issues().len(),
                    detector.duration_ms()
                );
            }
        }
        Command::Detectors => print!("{}", help_listing()),
        Command::Monitor { action } => {
            let command = MonitorCommand::from(*action);
            let report = monitor::run(command, ctx, source).await;
            metrics.record_monitor(database, command.name(), report.failures);
            if report.failures > 0 {
                error!(
                    database,
                    %command,
                    failures = report.failures,
                    statements = report.statements.len(),
                    "monitor command finished with failures"
                );
            } else {
                info!(
                    database,
                    %command,
                    statements = report.statements.len(),
                    "monitor command finished"
                );
            }
        }
        Command::Summary => {
            let rows = monitor::summary(source).await?;
            print!("{}", render_rows(&rows));
        }
        Command::QueryRows { sql } => {
            let sql = load_sql(sql)?;
            let rows = source.query_rows(&sql, &[]).await?;
            print!("{}", render_rows(&rows));
        }
        Command::QueryRow { sql } => {
            let sql = load_sql(sql)?;
            let value = source.query_scalar(&sql, &[]).await?;
            println!("{value}");
        }
    }
    Ok(())
}

fn load_sql(arg: &str) -> Result<String> {
    match arg.strip_prefix('!') {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read query file {path}")),
        None => Ok(arg.to_string()),
    }
}

fn load_env() {
    if let Err(err) = dotenvy::dotenv() {
        match err {
            DotenvError::Io(io_err) if io_err.kind() == ErrorKind::NotFound => {}
            other => eprintln!("warning: failed to load .env file: {other}"),
        }
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pgscout=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
