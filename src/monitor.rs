//! Tracking-table maintenance: the snapshot writer the detectors read from.

use std::fmt;

use anyhow::Result;
use tracing::{error, info, instrument, warn};

use crate::app::AppContext;
use crate::datasource::{DataSource, Param, Row};
use crate::db::is_missing_relation;
use crate::error::EngineError;
use crate::snapshot::{CAPTURED_AT, StatsView, TRACKING_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    Initialize,
    Snapshot,
    Terminate,
    Reset,
}

impl MonitorCommand {
    pub fn name(self) -> &'static str {
        match self {
            MonitorCommand::Initialize => "initialize",
            MonitorCommand::Snapshot => "snapshot",
            MonitorCommand::Terminate => "terminate",
            MonitorCommand::Reset => "reset",
        }
    }
}

impl fmt::Display for MonitorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Statements a monitor command issued, in order, and how many failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub statements: Vec<String>,
    pub failures: usize,
}

impl MonitorReport {
    fn merge(&mut self, other: MonitorReport) {
        self.statements.extend(other.statements);
        self.failures += other.failures;
    }
}

pub fn create_statements(view: StatsView) -> [String; 3] {
    let series = view.series();
    let source = view.view_name();
    [
        format!("CREATE TABLE IF NOT EXISTS {series} AS TABLE {source} WITH NO DATA"),
        format!(
            "ALTER TABLE {series} ADD COLUMN IF NOT EXISTS {CAPTURED_AT} timestamptz NOT NULL DEFAULT now()"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {TRACKING_PREFIX}ix_{source}_{CAPTURED_AT} ON {series} ({CAPTURED_AT})"
        ),
    ]
}

pub fn snapshot_statement(view: StatsView) -> String {
    format!("INSERT INTO {} SELECT * FROM {}", view.series(), view.view_name())
}

pub fn drop_statement(view: StatsView) -> String {
    format!("DROP TABLE IF EXISTS {}", view.series())
}

const RESET_STATEMENT: &str = "SELECT pg_stat_reset()";

/// Log (dry-run or verbose) and execute (unless dry-run) one statement.
/// Failures are logged against the view and counted; they never stop the caller.
async fn run_statement<D: DataSource>(
    ctx: &AppContext,
    source: &D,
    command: MonitorCommand,
    view: Option<StatsView>,
    statement: String,
    report: &mut MonitorReport,
) {
    let database = source.database_name();
    if ctx.dry_run || ctx.verbose {
        info!(database, %command, dry_run = ctx.dry_run, "{statement}");
    }
    if !ctx.dry_run {
        if let Err(err) = source.exec(&statement, &[]).await {
            report.failures += 1;
            let view = view.map(StatsView::view_name).unwrap_or("-");
            if is_missing_relation(&err) {
                warn!(
                    database,
                    %command,
                    view,
                    "source view is missing; is the extension installed?"
                );
            } else {
                error!(database, %command, view, error = ?err, "monitor statement failed");
            }
        }
    }
    report.statements.push(statement);
}

/// Create every tracking table, then take a first snapshot.
#[instrument(skip_all, fields(database = source.database_name()))]
pub async fn initialize<D: DataSource>(ctx: &AppContext, source: &D) -> MonitorReport {
    let mut report = MonitorReport::default();
    for view in StatsView::ALL {
        for statement in create_statements(view) {
            run_statement(
                ctx,
                source,
                MonitorCommand::Initialize,
                Some(view),
                statement,
                &mut report,
            )
            .await;
        }
    }
    report.merge(snapshot(ctx, source).await);
    report
}

#[instrument(skip_all, fields(database = source.database_name()))]
pub async fn snapshot<D: DataSource>(ctx: &AppContext, source: &D) -> MonitorReport {
    let mut report = MonitorReport::default();
    for view in StatsView::ALL {
        run_statement(
            ctx,
            source,
            MonitorCommand::Snapshot,
            Some(view),
            snapshot_statement(view),
            &mut report,
        )
        .await;
    }
    info!(
        database = source.database_name(),
        views = StatsView::ALL.len(),
        failures = report.failures,
        "snapshot taken"
    );
    report
}

#[instrument(skip_all, fields(database = source.database_name()))]
pub async fn terminate<D: DataSource>(ctx: &AppContext, source: &D) -> MonitorReport {
    let mut report = MonitorReport::default();
    for view in StatsView::ALL {
        run_statement(
            ctx,
            source,
            MonitorCommand::Terminate,
            Some(view),
            drop_statement(view),
            &mut report,
        )
        .await;
    }
    report
}

/// Reset server statistics and restart tracking; all earlier history is discarded.
#[instrument(skip_all, fields(database = source.database_name()))]
pub async fn reset<D: DataSource>(ctx: &AppContext, source: &D) -> MonitorReport {
    let mut report = MonitorReport::default();
    run_statement(
        ctx,
        source,
        MonitorCommand::Reset,
        None,
        RESET_STATEMENT.to_string(),
        &mut report,
    )
    .await;
    report.merge(terminate(ctx, source).await);
    report.merge(initialize(ctx, source).await);
    report
}

pub async fn run<D: DataSource>(
    command: MonitorCommand,
    ctx: &AppContext,
    source: &D,
) -> MonitorReport {
    match command {
        MonitorCommand::Initialize => initialize(ctx, source).await,
        MonitorCommand::Snapshot => snapshot(ctx, source).await,
        MonitorCommand::Terminate => terminate(ctx, source).await,
        MonitorCommand::Reset => reset(ctx, source).await,
    }
}

const TRACKING_TABLE_COUNT_SQL: &str = r#"
/* pgscout:tracking_table_count */
SELECT count(*)
FROM information_schema.tables
WHERE table_schema = $1
  AND table_type = 'BASE TABLE'
  AND table_name ILIKE 'pgscout\_%'
"#;

const SUMMARY_SQL: &str = r#"
/* pgscout:summary */
SELECT 'ServerVersion' AS "Attribute", version() AS "Value"
UNION ALL
SELECT 'ServerStartTime', pg_postmaster_start_time()::text
UNION ALL
SELECT 'DatabaseName', $1
UNION ALL
SELECT 'DatabaseSize', pg_size_pretty(pg_database_size(current_database()))
UNION ALL
SELECT 'pg_stat_statements',
       CASE WHEN setting ILIKE '%pg_stat_statements%' THEN 'Enabled' ELSE 'Disabled' END
FROM pg_catalog.pg_settings WHERE name = 'shared_preload_libraries'
UNION ALL
SELECT 'TableCount', count(*)::text
FROM information_schema.tables
WHERE table_schema = $2 AND table_type = 'BASE TABLE' AND table_name NOT ILIKE 'pgscout\_%'
UNION ALL
SELECT 'IndexCount', count(*)::text FROM pg_catalog.pg_indexes WHERE schemaname = $2
UNION ALL
SELECT 'TrackingMin', min(captured_at)::text FROM pgscout_pg_stat_user_tables
UNION ALL
SELECT 'TrackingMax', max(captured_at)::text FROM pgscout_pg_stat_user_tables
"#;

/// Attribute/value rows describing the server and the tracking window.
#[instrument(skip_all, fields(database = source.database_name()))]
pub async fn summary<D: DataSource>(source: &D) -> Result<Vec<Row>> {
    let schema = source.schema().to_string();
    let tables = source
        .query_scalar(TRACKING_TABLE_COUNT_SQL, &[Param::from(schema.as_str())])
        .await?
        .as_i64()
        .unwrap_or(0);
    if tables == 0 {
        return Err(EngineError::MonitorNotInitialized { schema }.into());
    }

    source
        .query_rows(
            SUMMARY_SQL,
            &[Param::from(source.database_name()), Param::from(schema)],
        )
        .await
}
