use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use super::{DETECTOR, IndexDescriptor, drop_statement};
use crate::app::AppContext;
use crate::config::Thresholds;
use crate::datasource::DataSource;
use crate::detectors::{Findings, Scope, log_query_failure};
use crate::issue::{Issue, Severity};

// Plain (non-partial, non-expression) btree indexes with their ordered key columns.
const OVERLAP_CANDIDATES_SQL: &str = r#"
/* pgscout:overlapping_candidates */
SELECT
    c.relname::text AS table_relname,
    i.indrelid::regclass::text AS table_name,
    i.indexrelid::regclass::text AS index_name,
    i.indisunique AS is_unique,
    pg_relation_size(i.indexrelid) AS index_bytes,
    pg_size_pretty(pg_relation_size(i.indexrelid)) AS index_size,
    coalesce(s.idx_scan, 0) AS idx_scan,
    pg_get_indexdef(i.indexrelid) AS definition,
    array_to_string(ARRAY(
        SELECT a.attname::text
        FROM unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord)
        JOIN pg_catalog.pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
        ORDER BY k.ord
    ), chr(31)) AS columns
FROM pg_catalog.pg_index i
JOIN pg_catalog.pg_class c ON c.oid = i.indrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_class ic ON ic.oid = i.indexrelid
JOIN pg_catalog.pg_am am ON am.oid = ic.relam
LEFT JOIN pg_catalog.pg_stat_user_indexes s ON s.indexrelid = i.indexrelid
WHERE am.amname = 'btree'
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
  AND n.nspname !~ '^pg_toast'
  AND 0 <> ALL (i.indkey)
  AND i.indpred IS NULL
  AND NOT EXISTS (SELECT 1 FROM pg_catalog.pg_inherits inh WHERE inh.inhrelid = i.indexrelid)
ORDER BY table_name, index_name
"#;

/// A narrower index made redundant by a wider one on the same table.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlap {
    pub superseded: IndexDescriptor,
    pub replacement: IndexDescriptor,
    /// The replacement is large and lightly used; dropping may be the wrong call.
    pub caution: bool,
}

fn is_strict_prefix(narrow: &[String], wide: &[String]) -> bool {
    narrow.len() < wide.len() && wide.starts_with(narrow)
}

/// Per table, order indexes widest first (then by name) and mark each index whose
/// columns are a strict prefix of an earlier surviving index as superseded, unless
/// it is unique. Identical column lists are left to the duplicate check.
pub fn plan_overlaps(indexes: Vec<IndexDescriptor>, thresholds: &Thresholds) -> Vec<Overlap> {
    let mut by_table: BTreeMap<String, Vec<IndexDescriptor>> = BTreeMap::new();
    for index in indexes.into_iter().filter(|index| !index.columns.is_empty()) {
        by_table.entry(index.table.clone()).or_default().push(index);
    }

    let mut overlaps = Vec::new();
    for mut table_indexes in by_table.into_values() {
        table_indexes.sort_by(|a, b| {
            b.columns
                .len()
                .cmp(&a.columns.len())
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut dropped: BTreeSet<usize> = BTreeSet::new();
        for later in 0..table_indexes.len() {
            let narrow = &table_indexes[later];
            if narrow.unique {
                continue;
            }
            let replacement = (0..later).find(|earlier| {
                !dropped.contains(earlier)
                    && table_indexes[*earlier].columns[0] == narrow.columns[0]
                    && is_strict_prefix(&narrow.columns, &table_indexes[*earlier].columns)
            });
            if let Some(earlier) = replacement {
                dropped.insert(later);
                let wide = &table_indexes[earlier];
                overlaps.push(Overlap {
                    superseded: narrow.clone(),
                    replacement: wide.clone(),
                    caution: wide.bytes > thresholds.overlap_caution_bytes
                        && wide.scans < thresholds.overlap_caution_scans,
                });
            }
        }
    }
    overlaps
}

pub(super) async fn detect<D: DataSource>(
    ctx: &AppContext,
    source: &D,
    scope: &Scope,
    findings: &mut Findings,
) {
    let indexes = match load_candidates(source, scope).await {
        Ok(indexes) => indexes,
        Err(err) => {
            log_query_failure(
                DETECTOR,
                "overlapping_candidates",
                source.database_name(),
                &err,
            );
            return;
        }
    };

    for overlap in plan_overlaps(indexes, &ctx.config.thresholds) {
        let narrow = &overlap.superseded;
        let wide = &overlap.replacement;
        let mut detail = format!(
            "Table: {}, Index {} ({}) is a leading prefix of {} ({})\nSuperseded Index: '{}'\nReplacement Index: '{}'\n",
            narrow.table,
            narrow.name,
            narrow.columns.join(", "),
            wide.name,
            wide.columns.join(", "),
            narrow.definition,
            wide.definition,
        );
        if overlap.caution {
            detail.push_str(&format!(
                "CAUTION: replacement index is large ({}) and lightly used ({} scans); queries served by {} may slow down\n",
                wide.size, wide.scans, narrow.name,
            ));
        }
        findings.push(Issue::new(
            "IndexOverlapping",
            narrow.name.clone(),
            Severity::Medium,
            detail,
            drop_statement(&narrow.name),
        ));
    }
}

async fn load_candidates<D: DataSource>(source: &D, scope: &Scope) -> Result<Vec<IndexDescriptor>> {
    let rows = source.query_rows(OVERLAP_CANDIDATES_SQL, &[]).await?;
    let mut indexes = Vec::with_capacity(rows.len());
    for row in &rows {
        let index = IndexDescriptor::from_row(row)?;
        if scope.covers_table(&index.table_relname) {
            indexes.push(index);
        }
    }
    Ok(indexes)
}
