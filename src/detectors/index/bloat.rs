use anyhow::Result;
use tracing::debug;

use super::DETECTOR;
use crate::app::AppContext;
use crate::datasource::{DataSource, Row};
use crate::detectors::{Findings, Scope, log_query_failure};
use crate::format::{format_bytes, format_number};
use crate::issue::{Issue, Severity};

const PAGE_HEADER_BYTES: f64 = 24.0;
const PAGE_OPAQUE_BYTES: f64 = 16.0;
const MAX_ALIGN: f64 = 8.0;
const ITEM_POINTER_BYTES: f64 = 4.0;
const INDEX_TUPLE_HEADER: f64 = 8.0;
const NULL_BITMAP_BYTES: f64 = 4.0;

// Per-index inputs for the btree size estimator; column stats come from pg_stats.
const INDEX_BLOAT_SQL: &str = r#"
/* pgscout:index_bloat */
WITH btree_indexes AS (
    SELECT
        n.nspname,
        ci.oid AS index_oid,
        ct.oid AS table_oid,
        ct.relname AS table_relname,
        ci.reltuples,
        ci.relpages,
        i.indkey,
        coalesce(
            substring(array_to_string(ci.reloptions, ' ') FROM 'fillfactor=([0-9]+)')::int,
            90
        ) AS fillfactor
    FROM pg_catalog.pg_index i
    JOIN pg_catalog.pg_class ci ON ci.oid = i.indexrelid
    JOIN pg_catalog.pg_class ct ON ct.oid = i.indrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = ci.relnamespace
    JOIN pg_catalog.pg_am am ON am.oid = ci.relam
    WHERE am.amname = 'btree'
      AND ci.relpages > 0
      AND 0 <> ALL (i.indkey)
      AND n.nspname NOT IN ('pg_catalog', 'information_schema')
      AND n.nspname !~ '^pg_toast'
)
SELECT
    b.index_oid::regclass::text AS index_name,
    b.table_oid::regclass::text AS table_name,
    b.table_relname::text AS table_relname,
    b.reltuples::float8 AS reltuples,
    b.relpages::bigint AS relpages,
    b.fillfactor::bigint AS fillfactor,
    current_setting('block_size')::bigint AS block_size,
    coalesce(sum((1 - coalesce(s.null_frac, 0)) * coalesce(s.avg_width, 0)), 0)::float8 AS data_width,
    coalesce(max(s.null_frac), 0)::float8 AS max_null_frac,
    bool_and(s.attname IS NOT NULL) AS has_stats
FROM btree_indexes b
JOIN pg_catalog.pg_attribute att ON att.attrelid = b.table_oid AND att.attnum = ANY (b.indkey)
LEFT JOIN pg_catalog.pg_stats s
    ON s.schemaname = b.nspname AND s.tablename = b.table_relname AND s.attname = att.attname
GROUP BY b.index_oid, b.table_oid, b.table_relname, b.reltuples, b.relpages, b.fillfactor
ORDER BY index_name
"#;

/// Statistics the estimator needs for one btree index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBloatSample {
    pub index_name: String,
    pub table_name: String,
    pub table_relname: String,
    pub reltuples: f64,
    pub relpages: i64,
    pub fillfactor: i64,
    pub block_size: i64,
    /// Sum of `(1 - null_frac) * avg_width` over the key columns.
    pub data_width: f64,
    pub max_null_frac: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexBloatEstimate {
    pub expected_pages: i64,
    pub bloat_pages: i64,
    pub bloat_bytes: i64,
    pub bloat_percent: f64,
}

fn align_up(width: f64) -> f64 {
    let remainder = width % MAX_ALIGN;
    if remainder == 0.0 {
        width
    } else {
        width + MAX_ALIGN - remainder
    }
}

/// Expected leaf pages for a freshly built index of this shape, plus the metapage.
pub fn estimate_index_bloat(sample: &IndexBloatSample) -> IndexBloatEstimate {
    let tuple_header = if sample.max_null_frac > 0.0 {
        INDEX_TUPLE_HEADER + NULL_BITMAP_BYTES
    } else {
        INDEX_TUPLE_HEADER
    };
    let tuple_width = align_up(tuple_header) + align_up(sample.data_width);
    let usable = (sample.block_size as f64 - PAGE_OPAQUE_BYTES - PAGE_HEADER_BYTES)
        * sample.fillfactor as f64
        / 100.0;
    let tuples_per_page = (usable / (ITEM_POINTER_BYTES + tuple_width)).floor().max(1.0);
    let expected_pages = 1 + (sample.reltuples.max(0.0) / tuples_per_page).ceil() as i64;

    let bloat_pages = (sample.relpages - expected_pages).max(0);
    let bloat_percent = if sample.relpages > 0 {
        100.0 * bloat_pages as f64 / sample.relpages as f64
    } else {
        0.0
    };

    IndexBloatEstimate {
        expected_pages,
        bloat_pages,
        bloat_bytes: bloat_pages * sample.block_size,
        bloat_percent,
    }
}

impl IndexBloatSample {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            index_name: row.text("index_name")?,
            table_name: row.text("table_name")?,
            table_relname: row.text("table_relname")?,
            reltuples: row.float("reltuples")?,
            relpages: row.int("relpages")?,
            fillfactor: row.int("fillfactor")?,
            block_size: row.int("block_size")?,
            data_width: row.float("data_width")?,
            max_null_frac: row.float("max_null_frac")?,
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
    let rows = match source.query_rows(INDEX_BLOAT_SQL, &[]).await {
        Ok(rows) => rows,
        Err(err) => {
            log_query_failure(DETECTOR, "index_bloat", database, &err);
            return;
        }
    };

    let thresholds = &ctx.config.thresholds;
    for row in &rows {
        if !row.bool("has_stats").unwrap_or(false) {
            debug!(
                database,
                index = ?row.opt_text("index_name").ok().flatten(),
                "no column statistics; bloat not estimated"
            );
            continue;
        }
        let sample = match IndexBloatSample::from_row(row) {
            Ok(sample) => sample,
            Err(err) => {
                log_query_failure(DETECTOR, "index_bloat", database, &err);
                continue;
            }
        };
        if !scope.covers_table(&sample.table_relname) {
            continue;
        }

        let estimate = estimate_index_bloat(&sample);
        if estimate.bloat_percent <= thresholds.index_bloat_percent
            || estimate.bloat_bytes <= thresholds.index_bloat_bytes
        {
            continue;
        }

        let detail = format!(
            "Table: {}, Index: {}, Bloat: {:.1}%, Wasted: {}, Pages: {} actual vs {} expected, Rows: {}\n",
            sample.table_name,
            sample.index_name,
            estimate.bloat_percent,
            format_bytes(estimate.bloat_bytes),
            sample.relpages,
            estimate.expected_pages,
            format_number(sample.reltuples as i64),
        );
        findings.push(Issue::new(
            "IndexBloat",
            sample.index_name.clone(),
            Severity::Medium,
            detail,
            format!("REINDEX INDEX CONCURRENTLY {};\n", sample.index_name),
        ));
    }
}
