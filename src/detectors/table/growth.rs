use anyhow::Result;
use chrono::{DateTime, Utc};

use super::{DETECTOR, GROWTH, REVIEW_TABLE};
use crate::app::AppContext;
use crate::config::Thresholds;
use crate::datasource::{DataSource, Param, Row};
use crate::detectors::{Findings, Scope, index, log_query_failure};
use crate::format::{format_number, quote_ident};
use crate::issue::{Issue, Severity};
use crate::snapshot::StatsView;

const DAY_SECONDS: f64 = 86_400.0;

// Live-tuple range and change activity per table across every analyzed snapshot.
const TABLE_GROWTH_SQL: &str = r#"
/* pgscout:table_growth */
SELECT
    schemaname::text AS schema_name,
    relname::text AS table_relname,
    min(n_live_tup)::bigint AS min_rows,
    max(n_live_tup)::bigint AS max_rows,
    min(captured_at) AS first_captured,
    max(captured_at) AS last_captured,
    max(n_tup_upd + n_tup_del + n_tup_hot_upd)::bigint AS changes
FROM pgscout_pg_stat_user_tables
WHERE last_analyze IS NOT NULL
  AND relname NOT LIKE 'pgscout\_%'
GROUP BY schemaname, relname
ORDER BY relname, schemaname
"#;

const PARTITION_COUNT_SQL: &str = r#"
/* pgscout:partition_count */
SELECT count(*) FROM pg_catalog.pg_inherits WHERE inhparent = $1::regclass
"#;

/// Row-count history for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct GrowthSample {
    pub schema: String,
    pub table: String,
    pub min_rows: i64,
    pub max_rows: i64,
    pub first_captured: DateTime<Utc>,
    pub last_captured: DateTime<Utc>,
    /// Highest cumulative update/delete count observed; zero means insert-only.
    pub changes: i64,
}

impl GrowthSample {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            schema: row.text("schema_name")?,
            table: row.text("table_relname")?,
            min_rows: row.opt_int("min_rows")?.unwrap_or(0),
            max_rows: row.opt_int("max_rows")?.unwrap_or(0),
            first_captured: row.timestamp("first_captured")?,
            last_captured: row.timestamp("last_captured")?,
            changes: row.opt_int("changes")?.unwrap_or(0),
        })
    }

    pub fn span_seconds(&self) -> i64 {
        (self.last_captured - self.first_captured).num_seconds()
    }

    /// Quoted `schema.table`, safe to cast to `regclass` whatever the case or search path.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GrowthVerdict {
    /// The snapshots cover too little time to judge.
    InsufficientSpan { seconds: i64 },
    Judged {
        daily_percent: f64,
        growing: bool,
        /// Over the large-table threshold; still subject to the partition check.
        large: bool,
    },
}

pub fn judge_growth(sample: &GrowthSample, thresholds: &Thresholds) -> GrowthVerdict {
    let seconds = sample.span_seconds();
    let min_span = i64::try_from(thresholds.growth_min_span.as_secs()).unwrap_or(i64::MAX);
    if seconds < min_span {
        return GrowthVerdict::InsufficientSpan { seconds };
    }

    let days = seconds as f64 / DAY_SECONDS;
    let daily_percent = if sample.max_rows > 0 && days > 0.0 {
        let rows_per_day = (sample.max_rows - sample.min_rows) as f64 / days;
        100.0 * rows_per_day / sample.max_rows as f64
    } else {
        0.0
    };

    GrowthVerdict::Judged {
        daily_percent,
        growing: sample.max_rows > thresholds.growth_report_rows
            && daily_percent > thresholds.growth_daily_percent,
        large: sample.max_rows > thresholds.large_table_rows,
    }
}

pub(super) async fn detect<D: DataSource>(
    ctx: &AppContext,
    source: &D,
    scope: &Scope,
    findings: &mut Findings,
) {
    let database = source.database_name();
    let samples = match load_samples(source, scope).await {
        Ok(samples) => samples,
        Err(err) => {
            log_query_failure(DETECTOR, "table_growth", database, &err);
            return;
        }
    };
    if samples.is_empty() {
        findings.warn(
            DETECTOR,
            database,
            format!(
                "no analyzed table snapshots in {}; growth and size checks skipped",
                StatsView::StatUserTables.series()
            ),
        );
        return;
    }

    for sample in samples {
        let (daily_percent, growing, large) = match judge_growth(&sample, &ctx.config.thresholds) {
            GrowthVerdict::InsufficientSpan { seconds } => {
                findings.warn(
                    DETECTOR,
                    database,
                    format!(
                        "Table: {}, insufficient data captured by snapshots ({seconds} seconds)",
                        sample.table
                    ),
                );
                continue;
            }
            GrowthVerdict::Judged {
                daily_percent,
                growing,
                large,
            } => (daily_percent, growing, large),
        };

        let report_growth = growing && scope.wants(GROWTH[0]);
        let report_size = if large && scope.wants(GROWTH[1]) {
            match is_partitioned(source, &sample).await {
                Ok(partitioned) => !partitioned,
                Err(err) => {
                    log_query_failure(DETECTOR, "partition_count", database, &err);
                    findings.warn(
                        DETECTOR,
                        database,
                        format!(
                            "Table: {}, partition lookup failed; size check skipped",
                            sample.qualified_name()
                        ),
                    );
                    false
                }
            }
        } else {
            false
        };
        if !report_growth && !report_size {
            continue;
        }

        let unused = unused_indexes_line(source, &sample.table).await;
        if report_growth {
            findings.push(Issue::new(
                "TableGrowth",
                sample.table.clone(),
                Severity::Medium,
                format!(
                    "Table: {}, current rows: {}, is growing at {daily_percent:.2}% per day\n{unused}",
                    sample.table,
                    format_number(sample.max_rows),
                ),
                REVIEW_TABLE,
            ));
        }
        if report_size {
            findings.push(Issue::new(
                "TableSizeLarge",
                sample.table.clone(),
                Severity::Medium,
                format!(
                    "Table: {}, current rows: {:.2}M, insert only: {}, is large and not partitioned\n{unused}",
                    sample.table,
                    sample.max_rows as f64 / 1_000_000.0,
                    sample.changes == 0,
                ),
                REVIEW_TABLE,
            ));
        }
    }
}

async fn load_samples<D: DataSource>(source: &D, scope: &Scope) -> Result<Vec<GrowthSample>> {
    let rows = source.query_rows(TABLE_GROWTH_SQL, &[]).await?;
    let mut samples = Vec::with_capacity(rows.len());
    for row in &rows {
        let sample = GrowthSample::from_row(row)?;
        if scope.covers_table(&sample.table) {
            samples.push(sample);
        }
    }
    Ok(samples)
}

async fn is_partitioned<D: DataSource>(source: &D, sample: &GrowthSample) -> Result<bool> {
    let count = source
        .query_scalar(PARTITION_COUNT_SQL, &[Param::from(sample.qualified_name())])
        .await?;
    Ok(count.as_i64().unwrap_or(0) > 0)
}

async fn unused_indexes_line<D: DataSource>(source: &D, table: &str) -> String {
    let names = index::unused_index_names(source, table).await;
    if names.is_empty() {
        String::new()
    } else {
        format!("Unused Indexes: {}\n", names.join(", "))
    }
}
