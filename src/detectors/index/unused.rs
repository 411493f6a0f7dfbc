use std::collections::BTreeMap;

use anyhow::Result;

use super::{DETECTOR, IndexDescriptor, drop_statement};
use crate::datasource::DataSource;
use crate::detectors::{Findings, Scope, log_query_failure};
use crate::issue::{Issue, Severity};
use crate::snapshot::StatsView;

const UNUSED_HISTORY_SQL: &str = r#"
/* pgscout:unused_index_history */
SELECT
    indexrelid::bigint AS index_oid,
    max(idx_scan)::bigint AS max_scans,
    count(DISTINCT captured_at)::bigint AS snapshots
FROM pgscout_pg_stat_user_indexes
GROUP BY indexrelid
"#;

// Non-unique btree, no expression columns, no constraint, not a partition.
const UNUSED_CANDIDATES_SQL: &str = r#"
/* pgscout:unused_index_candidates */
SELECT
    stat.indexrelid::bigint AS index_oid,
    stat.relname::text AS table_relname,
    stat.relid::regclass::text AS table_name,
    stat.indexrelid::regclass::text AS index_name,
    stat.idx_scan AS idx_scan,
    pg_relation_size(stat.indexrelid) AS index_bytes,
    pg_size_pretty(pg_relation_size(stat.indexrelid)) AS index_size,
    pg_size_pretty(pg_table_size(stat.relid)) AS table_size,
    pg_get_indexdef(stat.indexrelid) AS definition
FROM pg_catalog.pg_stat_user_indexes stat
JOIN pg_catalog.pg_index i ON i.indexrelid = stat.indexrelid
JOIN pg_catalog.pg_class ic ON ic.oid = stat.indexrelid
JOIN pg_catalog.pg_am am ON am.oid = ic.relam
WHERE am.amname = 'btree'
  AND 0 <> ALL (i.indkey)
  AND NOT i.indisunique
  AND NOT EXISTS (SELECT 1 FROM pg_catalog.pg_constraint c WHERE c.conindid = stat.indexrelid)
  AND NOT EXISTS (SELECT 1 FROM pg_catalog.pg_inherits inh WHERE inh.inhrelid = stat.indexrelid)
  AND stat.indexrelname NOT LIKE 'pgscout\_%'
ORDER BY table_name, index_name
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct UnusedCandidate {
    pub oid: i64,
    pub index: IndexDescriptor,
    pub table_size: String,
}

/// Scan history for one index across every recorded snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHistory {
    pub max_scans: i64,
    pub snapshots: i64,
}

/// Candidates whose highest scan count, over history and the live counter, is zero.
/// Indexes with no history yet are left alone.
pub fn select_unused<'c>(
    candidates: &'c [UnusedCandidate],
    history: &BTreeMap<i64, ScanHistory>,
) -> Vec<(&'c UnusedCandidate, ScanHistory)> {
    candidates
        .iter()
        .filter_map(|candidate| {
            let recorded = history.get(&candidate.oid)?;
            let effective = recorded.max_scans.max(candidate.index.scans);
            (effective == 0).then_some((candidate, *recorded))
        })
        .collect()
}

pub(super) async fn detect<D: DataSource>(source: &D, scope: &Scope, findings: &mut Findings) {
    let database = source.database_name();

    let history = match load_history(source).await {
        Ok(history) => history,
        Err(err) => {
            log_query_failure(DETECTOR, "unused_index_history", database, &err);
            return;
        }
    };
    if history.is_empty() {
        findings.warn(
            DETECTOR,
            database,
            format!(
                "no index usage snapshots in {}; unused index detection skipped",
                StatsView::StatUserIndexes.series()
            ),
        );
        return;
    }

    let candidates = match load_candidates(source, scope).await {
        Ok(candidates) => candidates,
        Err(err) => {
            log_query_failure(DETECTOR, "unused_index_candidates", database, &err);
            return;
        }
    };

    for (candidate, recorded) in select_unused(&candidates, &history) {
        let index = &candidate.index;
        let detail = format!(
            "Table: {}, Index Size: {}, Table Size: {}, Unused index ({}), no scans across {} snapshots\nIndex definition: '{}'\n",
            index.table,
            index.size,
            candidate.table_size,
            index.name,
            recorded.snapshots,
            index.definition,
        );
        findings.push(Issue::new(
            "IndexUnused",
            index.name.clone(),
            Severity::High,
            detail,
            drop_statement(&index.name),
        ));
    }
}

async fn load_history<D: DataSource>(source: &D) -> Result<BTreeMap<i64, ScanHistory>> {
    let rows = source.query_rows(UNUSED_HISTORY_SQL, &[]).await?;
    let mut history = BTreeMap::new();
    for row in &rows {
        history.insert(
            row.int("index_oid")?,
            ScanHistory {
                max_scans: row.opt_int("max_scans")?.unwrap_or(0),
                snapshots: row.opt_int("snapshots")?.unwrap_or(0),
            },
        );
    }
    Ok(history)
}

async fn load_candidates<D: DataSource>(source: &D, scope: &Scope) -> Result<Vec<UnusedCandidate>> {
    let rows = source.query_rows(UNUSED_CANDIDATES_SQL, &[]).await?;
    let mut candidates = Vec::new();
    for row in &rows {
        let index = IndexDescriptor::from_row(row)?;
        if !scope.covers_table(&index.table_relname) {
            continue;
        }
        candidates.push(UnusedCandidate {
            oid: row.int("index_oid")?,
            table_size: row.opt_text("table_size")?.unwrap_or_default(),
            index,
        });
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(oid: i64, live_scans: i64) -> UnusedCandidate {
        UnusedCandidate {
            oid,
            index: IndexDescriptor {
                table: "public.orders".into(),
                table_relname: "orders".into(),
                name: format!("orders_idx_{oid}"),
                columns: Vec::new(),
                unique: false,
                bytes: 16_384,
                size: "16 kB".into(),
                scans: live_scans,
                definition: String::new(),
            },
            table_size: "1 MB".into(),
        }
    }

    fn history(max_scans: i64) -> ScanHistory {
        ScanHistory {
            max_scans,
            snapshots: 12,
        }
    }

    #[test]
    fn zero_in_every_snapshot_is_unused() {
        let candidates = [candidate(1, 0)];
        let history = BTreeMap::from([(1, history(0))]);
        let unused = select_unused(&candidates, &history);
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].0.oid, 1);
    }

    #[test]
    fn earlier_nonzero_scans_are_not_unused() {
        // Counter reset since: live is 0 but history saw scans.
        let candidates = [candidate(1, 0)];
        let history = BTreeMap::from([(1, history(37))]);
        assert!(select_unused(&candidates, &history).is_empty());
    }

    #[test]
    fn live_scans_or_missing_history_keep_index() {
        let candidates = [candidate(1, 4), candidate(2, 0)];
        let history = BTreeMap::from([(1, history(0))]);
        assert!(select_unused(&candidates, &history).is_empty());
    }

    #[test]
    fn tracking_indexes_are_excluded_literally() {
        assert!(UNUSED_CANDIDATES_SQL.contains(r"pgscout\_%"));
        assert!(!UNUSED_CANDIDATES_SQL.contains("'pgscout_%'"));
    }
}
