use std::collections::BTreeMap;

use anyhow::Result;
use tracing::debug;

use super::{DETECTOR, IndexDescriptor, drop_statement};
use crate::app::AppContext;
use crate::datasource::{DataSource, Param};
use crate::detectors::{Findings, Scope, log_query_failure};
use crate::format::{format_bytes, format_number, quote_ident};
use crate::issue::{Issue, Severity};

// Tables never analyzed, or whose live-tuple estimate is at or below the small threshold.
const SMALL_TABLE_CANDIDATES_SQL: &str = r#"
/* pgscout:small_table_candidates */
SELECT t.table_name::text AS table_name
FROM information_schema.tables t
LEFT JOIN pg_catalog.pg_stat_user_tables s
    ON s.schemaname = t.table_schema AND s.relname = t.table_name
WHERE t.table_schema = $1
  AND t.table_type = 'BASE TABLE'
  AND t.table_name NOT ILIKE 'pgscout\_%'
  AND (s.last_analyze IS NULL OR s.n_live_tup <= $2)
ORDER BY t.table_name
"#;

const SMALL_TABLE_INDEXES_SQL: &str = r#"
/* pgscout:small_table_indexes */
SELECT
    stat.relname::text AS table_relname,
    stat.relid::regclass::text AS table_name,
    stat.indexrelid::regclass::text AS index_name,
    stat.idx_scan AS idx_scan,
    pg_relation_size(stat.indexrelid) AS index_bytes,
    pg_get_indexdef(stat.indexrelid) AS definition
FROM pg_catalog.pg_stat_user_indexes stat
JOIN pg_catalog.pg_index i ON i.indexrelid = stat.indexrelid
JOIN pg_catalog.pg_class ic ON ic.oid = stat.indexrelid
JOIN pg_catalog.pg_am am ON am.oid = ic.relam
WHERE stat.schemaname = $1
  AND stat.relname = ANY($2)
  AND stat.idx_scan <> 0
  AND am.amname = 'btree'
  AND 0 <> ALL (i.indkey)
  AND NOT i.indisunique
  AND NOT EXISTS (SELECT 1 FROM pg_catalog.pg_constraint c WHERE c.conindid = stat.indexrelid)
  AND NOT EXISTS (SELECT 1 FROM pg_catalog.pg_inherits inh WHERE inh.inhrelid = stat.indexrelid)
ORDER BY table_relname, index_name
"#;

/// Candidate tables split by their exact row count.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RowCountSplit {
    /// Below the small-table threshold; their scanned indexes are reported.
    pub small: Vec<String>,
    /// Picked by a low or missing estimate but actually at or over the threshold.
    pub stale: Vec<(String, i64)>,
}

pub fn split_by_row_count(table_rows: &BTreeMap<String, i64>, small_rows: i64) -> RowCountSplit {
    let mut split = RowCountSplit::default();
    for (table, rows) in table_rows {
        if *rows < small_rows {
            split.small.push(table.clone());
        } else {
            split.stale.push((table.clone(), *rows));
        }
    }
    split
}

pub(super) async fn detect<D: DataSource>(
    ctx: &AppContext,
    source: &D,
    scope: &Scope,
    findings: &mut Findings,
) {
    let database = source.database_name();
    let small_rows = ctx.config.thresholds.small_table_rows;

    let tables = match load_candidate_tables(source, small_rows).await {
        Ok(tables) => tables,
        Err(err) => {
            log_query_failure(DETECTOR, "small_table_candidates", database, &err);
            return;
        }
    };

    // Per-run cache of exact row counts.
    let mut table_rows: BTreeMap<String, i64> = BTreeMap::new();
    for table in tables.iter().filter(|table| scope.covers_table(table)) {
        let sql = format!(
            "/* pgscout:small_table_count */ SELECT count(*) FROM {}.{}",
            quote_ident(source.schema()),
            quote_ident(table)
        );
        match source.query_scalar(&sql, &[]).await {
            Ok(value) => {
                table_rows.insert(table.clone(), value.as_i64().unwrap_or(0));
            }
            Err(err) => log_query_failure(DETECTOR, "small_table_count", database, &err),
        }
    }

    let split = split_by_row_count(&table_rows, small_rows);
    if scope.wants("AnalyzeSuggested") {
        for (table, rows) in &split.stale {
            let qualified = format!("{}.{}", quote_ident(source.schema()), quote_ident(table));
            findings.push(Issue::new(
                "AnalyzeSuggested",
                table.clone(),
                Severity::High,
                format!(
                    "Table: {table}, Rows: {}, n_live_tup estimate is stale or missing\n",
                    format_number(*rows)
                ),
                format!("ANALYZE {qualified};\n"),
            ));
        }
    }
    let small_tables = split.small;

    if small_tables.is_empty() || !scope.wants("IndexSmall") {
        debug!(database, "no small tables to inspect");
        return;
    }

    let indexes = match load_small_table_indexes(source, small_tables).await {
        Ok(indexes) => indexes,
        Err(err) => {
            log_query_failure(DETECTOR, "small_table_indexes", database, &err);
            return;
        }
    };

    for index in indexes {
        let rows = table_rows.get(&index.table_relname).copied().unwrap_or(0);
        let detail = format!(
            "Table: {}, Rows: {}, Index Size: {}, Small index ({}) on a table a sequential scan reads cheaply\nIndex definition: '{}'\n",
            index.table,
            rows,
            format_bytes(index.bytes),
            index.name,
            index.definition,
        );
        findings.push(Issue::new(
            "IndexSmall",
            index.name.clone(),
            Severity::High,
            detail,
            drop_statement(&index.name),
        ));
    }
}

async fn load_candidate_tables<D: DataSource>(source: &D, small_rows: i64) -> Result<Vec<String>> {
    let params = [Param::from(source.schema()), Param::Int(small_rows)];
    let rows = source
        .query_rows(SMALL_TABLE_CANDIDATES_SQL, &params)
        .await?;
    rows.iter().map(|row| row.text("table_name")).collect()
}

async fn load_small_table_indexes<D: DataSource>(
    source: &D,
    tables: Vec<String>,
) -> Result<Vec<IndexDescriptor>> {
    let params = [Param::from(source.schema()), Param::TextList(tables)];
    let rows = source.query_rows(SMALL_TABLE_INDEXES_SQL, &params).await?;
    rows.iter().map(IndexDescriptor::from_row).collect()
}
