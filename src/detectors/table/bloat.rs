use anyhow::Result;
use tracing::debug;

use super::DETECTOR;
use crate::app::AppContext;
use crate::config::Thresholds;
use crate::datasource::{DataSource, Row};
use crate::detectors::{Findings, Scope, log_query_failure};
use crate::format::{format_bytes, format_number, quote_ident};
use crate::issue::{Issue, Severity};

const HEAP_TUPLE_HEADER: f64 = 23.0;
const MAX_ALIGN: f64 = 8.0;
const ITEM_POINTER_BYTES: f64 = 4.0;
const PAGE_OVERHEAD: f64 = 20.0;
/// No statistics exist for TOAST chunks; assume four per page.
const TOAST_TUPLES_PER_PAGE: f64 = 4.0;
const MIB: f64 = 1024.0 * 1024.0;

// Heap inputs per ordinary table. Tables with a column lacking pg_stats (json and
// friends) cannot be estimated and report has_stats = false.
const TABLE_BLOAT_SQL: &str = r#"
/* pgscout:table_bloat */
SELECT
    n.nspname::text AS schema_name,
    c.relname::text AS table_relname,
    c.oid::regclass::text AS table_name,
    c.reltuples::float8 AS reltuples,
    c.relpages::bigint AS relpages,
    current_setting('block_size')::bigint AS block_size,
    coalesce(toast.relpages, 0)::bigint AS toast_relpages,
    coalesce(toast.reltuples, 0)::float8 AS toast_reltuples,
    coalesce(sum((1 - s.null_frac) * s.avg_width), 0)::float8 AS data_width,
    count(*) FILTER (WHERE s.null_frac <> 0)::bigint AS nullable_columns,
    coalesce(max(s.null_frac), 0)::float8 AS max_null_frac,
    bool_and(s.attname IS NOT NULL) AS has_stats
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped
LEFT JOIN pg_catalog.pg_stats s
    ON s.schemaname = n.nspname AND s.tablename = c.relname AND s.attname = a.attname
LEFT JOIN pg_catalog.pg_class toast ON toast.oid = c.reltoastrelid AND toast.relkind = 't'
WHERE c.relkind = 'r'
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
  AND n.nspname !~ '^pg_toast'
  AND c.relname NOT LIKE 'pgscout\_%'
GROUP BY n.nspname, c.relname, c.oid, c.reltuples, c.relpages, toast.relpages, toast.reltuples
ORDER BY table_name
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct TableBloatSample {
    pub schema_name: String,
    pub table_relname: String,
    pub table_name: String,
    pub reltuples: f64,
    pub relpages: i64,
    pub block_size: i64,
    pub toast_relpages: i64,
    pub toast_reltuples: f64,
    /// Sum of `(1 - null_frac) * avg_width` across the table's columns.
    pub data_width: f64,
    pub nullable_columns: i64,
    pub max_null_frac: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableBloatEstimate {
    pub table_bytes: f64,
    pub expected_bytes: f64,
    pub bloat_bytes: f64,
    pub bloat_percent: f64,
}

impl TableBloatEstimate {
    pub fn bloat_mb(&self) -> f64 {
        self.bloat_bytes / MIB
    }

    pub fn is_bloated(&self, thresholds: &Thresholds) -> bool {
        let mb = self.bloat_mb();
        (self.bloat_percent >= thresholds.table_bloat_percent && mb >= thresholds.table_bloat_mb)
            || (self.bloat_percent >= thresholds.table_bloat_large_percent
                && mb >= thresholds.table_bloat_large_mb)
    }
}

/// Padding needed to bring `width` up to the next alignment boundary, or a full
/// alignment unit when it already sits on one.
fn align_pad(width: f64) -> f64 {
    let remainder = width % MAX_ALIGN;
    if remainder == 0.0 {
        MAX_ALIGN
    } else {
        remainder
    }
}

/// Expected heap plus TOAST size for a table with these statistics, packed tight.
pub fn estimate_table_bloat(sample: &TableBloatSample) -> TableBloatEstimate {
    let block_size = sample.block_size as f64;
    let null_header = HEAP_TUPLE_HEADER + 1.0 + (sample.nullable_columns / 8) as f64;
    let data_header =
        sample.data_width + (HEAP_TUPLE_HEADER + MAX_ALIGN - align_pad(HEAP_TUPLE_HEADER));
    let null_header_aligned =
        sample.max_null_frac * (null_header + MAX_ALIGN - align_pad(null_header));
    let tuple_width =
        data_header + null_header_aligned + ITEM_POINTER_BYTES + MAX_ALIGN - align_pad(data_header);

    let heap_pages =
        (sample.reltuples.max(0.0) * tuple_width / (block_size - PAGE_OVERHEAD)).ceil();
    let toast_pages = (sample.toast_reltuples.max(0.0) / TOAST_TUPLES_PER_PAGE).ceil();
    let heap_expected = heap_pages * block_size;
    let toast_expected = toast_pages * block_size;
    let expected_bytes = heap_expected + toast_expected;
    let table_bytes = (sample.relpages + sample.toast_relpages) as f64 * block_size;

    let measurable = expected_bytes > 0.0 && table_bytes > 0.0;
    let bloat_bytes = if measurable && expected_bytes <= table_bytes {
        table_bytes - expected_bytes
    } else {
        0.0
    };
    let bloat_percent = if table_bytes > 0.0 {
        (bloat_bytes * 100.0 / table_bytes).round()
    } else {
        0.0
    };

    TableBloatEstimate {
        table_bytes,
        expected_bytes,
        bloat_bytes,
        bloat_percent,
    }
}

impl TableBloatSample {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            schema_name: row.text("schema_name")?,
            table_relname: row.text("table_relname")?,
            table_name: row.text("table_name")?,
            reltuples: row.float("reltuples")?,
            relpages: row.int("relpages")?,
            block_size: row.int("block_size")?,
            toast_relpages: row.opt_int("toast_relpages")?.unwrap_or(0),
            toast_reltuples: row.opt_float("toast_reltuples")?.unwrap_or(0.0),
            data_width: row.float("data_width")?,
            nullable_columns: row.opt_int("nullable_columns")?.unwrap_or(0),
            max_null_frac: row.opt_float("max_null_frac")?.unwrap_or(0.0),
        })
    }
}

pub(super) async fn detect<D: DataSource>(
    ctx: &AppContext,
    source: &D,
    scope: &Scope,
    findings: &mut Findings,
) {
    let database = source.database_name();
    let rows = match source.query_rows(TABLE_BLOAT_SQL, &[]).await {
        Ok(rows) => rows,
        Err(err) => {
            log_query_failure(DETECTOR, "table_bloat", database, &err);
            return;
        }
    };

    let mut flagged = Vec::new();
    for row in &rows {
        if !row.bool("has_stats").unwrap_or(false) {
            debug!(
                database,
                table = ?row.opt_text("table_name").ok().flatten(),
                "incomplete column statistics; bloat not estimated"
            );
            continue;
        }
        let sample = match TableBloatSample::from_row(row) {
            Ok(sample) => sample,
            Err(err) => {
                log_query_failure(DETECTOR, "table_bloat", database, &err);
                continue;
            }
        };
        if !scope.covers_table(&sample.table_relname) {
            continue;
        }
        let estimate = estimate_table_bloat(&sample);
        if estimate.is_bloated(&ctx.config.thresholds) {
            flagged.push((sample, estimate));
        }
    }

    flagged.sort_by(|(left, a), (right, b)| {
        b.bloat_percent
            .total_cmp(&a.bloat_percent)
            .then_with(|| left.table_name.cmp(&right.table_name))
    });

    for (sample, estimate) in flagged {
        let detail = format!(
            "Table: {}, Bloat: {}%, Wasted: {}, Table Size: {}, Estimated Rows: {}\n",
            sample.table_name,
            estimate.bloat_percent,
            format_bytes(estimate.bloat_bytes as i64),
            format_bytes(estimate.table_bytes as i64),
            format_number(sample.reltuples as i64),
        );
        findings.push(Issue::new(
            "TableBloat",
            sample.table_relname.clone(),
            Severity::Medium,
            detail,
            format!(
                "VACUUM {}.{};\n",
                quote_ident(&sample.schema_name),
                quote_ident(&sample.table_relname)
            ),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(relpages: i64) -> TableBloatSample {
        TableBloatSample {
            schema_name: "public".into(),
            table_relname: "events".into(),
            table_name: "events".into(),
            reltuples: 1_000_000.0,
            relpages,
            block_size: 8192,
            toast_relpages: 0,
            toast_reltuples: 0.0,
            data_width: 100.0,
            nullable_columns: 0,
            max_null_frac: 0.0,
        }
    }

    #[test]
    fn wide_rows_in_oversized_heap_are_bloated() {
        // 132 bytes per tuple, 16153 pages expected against 40000 allocated.
        let estimate = estimate_table_bloat(&sample(40_000));
        assert_eq!(estimate.expected_bytes, 16_153.0 * 8192.0);
        assert_eq!(estimate.bloat_percent, 60.0);
        assert!(estimate.bloat_mb() > 186.0 && estimate.bloat_mb() < 187.0);
        assert!(estimate.is_bloated(&Thresholds::default()));
    }

    #[test]
    fn tight_heap_reports_no_bloat() {
        let estimate = estimate_table_bloat(&sample(16_000));
        assert_eq!(estimate.bloat_bytes, 0.0);
        assert!(!estimate.is_bloated(&Thresholds::default()));
    }

    #[test]
    fn toast_pages_count_on_both_sides() {
        let mut toasted = sample(40_000);
        toasted.toast_relpages = 10_000;
        toasted.toast_reltuples = 40_000.0;
        let estimate = estimate_table_bloat(&toasted);
        assert_eq!(estimate.table_bytes, 50_000.0 * 8192.0);
        assert_eq!(estimate.expected_bytes, (16_153.0 + 10_000.0) * 8192.0);
    }

    #[test]
    fn small_percentage_on_huge_table_still_counts() {
        let estimate = TableBloatEstimate {
            table_bytes: 0.0,
            expected_bytes: 0.0,
            bloat_bytes: 2_000.0 * MIB,
            bloat_percent: 30.0,
        };
        assert!(estimate.is_bloated(&Thresholds::default()));
    }

    #[test]
    fn tracking_tables_are_excluded_literally() {
        assert!(TABLE_BLOAT_SQL.contains(r"pgscout\_%"));
        assert!(!TABLE_BLOAT_SQL.contains("'pgscout_%'"));
    }
}
