use anyhow::Result;

use super::{DETECTOR, IndexDescriptor, drop_statement};
use crate::app::AppContext;
use crate::config::Thresholds;
use crate::datasource::{DataSource, Row};
use crate::detectors::{Findings, Scope, log_query_failure};
use crate::issue::{Issue, Severity};

// Live counters for removable indexes, with their table's scan and write totals.
const INDEX_USAGE_SQL: &str = r#"
/* pgscout:index_usage */
WITH table_activity AS (
    SELECT
        relid,
        coalesce(idx_scan, 0) + coalesce(seq_scan, 0) AS all_scans,
        n_tup_ins + n_tup_upd + n_tup_del AS writes,
        pg_table_size(relid) AS table_bytes
    FROM pg_catalog.pg_stat_user_tables
),
all_writes AS (
    SELECT coalesce(sum(writes), 0)::bigint AS total_writes FROM table_activity
)
SELECT
    stat.relname::text AS table_relname,
    stat.relid::regclass::text AS table_name,
    stat.indexrelid::regclass::text AS index_name,
    stat.idx_scan AS idx_scan,
    pg_relation_size(stat.indexrelid) AS index_bytes,
    pg_size_pretty(pg_relation_size(stat.indexrelid)) AS index_size,
    pg_size_pretty(t.table_bytes) AS table_size,
    pg_get_indexdef(stat.indexrelid) AS definition,
    am.amname = 'btree' AS is_btree,
    t.all_scans::bigint AS all_scans,
    t.writes::bigint AS writes,
    w.total_writes
FROM pg_catalog.pg_stat_user_indexes stat
JOIN pg_catalog.pg_index i ON i.indexrelid = stat.indexrelid
JOIN pg_catalog.pg_class ic ON ic.oid = stat.indexrelid
JOIN pg_catalog.pg_am am ON am.oid = ic.relam
JOIN table_activity t ON t.relid = stat.relid
CROSS JOIN all_writes w
WHERE NOT i.indisunique
  AND 0 <> ALL (i.indkey)
  AND stat.indexrelname NOT LIKE 'pgscout\_%'
  AND NOT EXISTS (SELECT 1 FROM pg_catalog.pg_constraint c WHERE c.conindid = stat.indexrelid)
  AND NOT EXISTS (SELECT 1 FROM pg_catalog.pg_inherits inh WHERE inh.inhrelid = stat.indexrelid)
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct UsageSample {
    pub index: IndexDescriptor,
    pub table_size: String,
    pub is_btree: bool,
    /// Index plus sequential scans on the owning table.
    pub all_scans: i64,
    pub writes: i64,
    pub total_writes: i64,
}

impl UsageSample {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            index: IndexDescriptor::from_row(row)?,
            table_size: row.opt_text("table_size")?.unwrap_or_default(),
            is_btree: row.bool("is_btree")?,
            all_scans: row.opt_int("all_scans")?.unwrap_or(0),
            writes: row.opt_int("writes")?.unwrap_or(0),
            total_writes: row.opt_int("total_writes")?.unwrap_or(0),
        })
    }

    pub fn index_scan_percent(&self) -> f64 {
        if self.all_scans == 0 {
            0.0
        } else {
            self.index.scans as f64 / self.all_scans as f64 * 100.0
        }
    }

    pub fn scans_per_write(&self) -> f64 {
        if self.writes == 0 {
            self.index.scans as f64
        } else {
            self.index.scans as f64 / self.writes as f64
        }
    }
}

/// Sub-issue an index falls into, if any. The three rules are mutually exclusive.
pub fn classify_usage(sample: &UsageSample, thresholds: &Thresholds) -> Option<&'static str> {
    let scans = sample.index.scans;
    let scan_pct = sample.index_scan_percent();
    let per_write = sample.scans_per_write();
    let large = sample.index.bytes > thresholds.large_index_bytes;

    if sample.is_btree && scans > 0 && per_write <= 1.0 && scan_pct < 10.0 && sample.writes > 100 {
        return Some("IndexLowScansHighWrites");
    }
    if sample.is_btree && scans > 0 && per_write > 1.0 && scan_pct < 5.0 && large {
        return Some("IndexSeldomUsedLarge");
    }
    let write_share = sample.writes as f64 / (sample.total_writes as f64 + 1.0);
    if !sample.is_btree && large && write_share > 0.02 {
        return Some("IndexHighWriteLargeNonBtree");
    }
    None
}

fn rank(issue: &str) -> usize {
    super::USAGE
        .iter()
        .position(|candidate| *candidate == issue)
        .unwrap_or(usize::MAX)
}

pub(super) async fn detect<D: DataSource>(
    ctx: &AppContext,
    source: &D,
    scope: &Scope,
    findings: &mut Findings,
) {
    let samples = match load_samples(source, scope).await {
        Ok(samples) => samples,
        Err(err) => {
            log_query_failure(DETECTOR, "index_usage", source.database_name(), &err);
            return;
        }
    };

    let mut flagged: Vec<(&'static str, UsageSample)> = samples
        .into_iter()
        .filter_map(|sample| {
            classify_usage(&sample, &ctx.config.thresholds).map(|issue| (issue, sample))
        })
        .filter(|(issue, _)| scope.wants(issue))
        .collect();
    flagged.sort_by(|(a, left), (b, right)| {
        rank(a)
            .cmp(&rank(b))
            .then_with(|| right.index.bytes.cmp(&left.index.bytes))
            .then_with(|| left.index.name.cmp(&right.index.name))
    });

    for (issue_type, sample) in flagged {
        let index = &sample.index;
        let detail = format!(
            "Table: {}, Index Size: {}, Table Size: {}, Index scan share: {:.2}%, Scans per write: {:.2} ({})\nIndex definition: '{}'\n",
            index.table,
            index.size,
            sample.table_size,
            sample.index_scan_percent(),
            sample.scans_per_write(),
            index.name,
            index.definition,
        );
        findings.push(Issue::new(
            issue_type,
            index.name.clone(),
            Severity::High,
            detail,
            drop_statement(&index.name),
        ));
    }
}

async fn load_samples<D: DataSource>(source: &D, scope: &Scope) -> Result<Vec<UsageSample>> {
    let rows = source.query_rows(INDEX_USAGE_SQL, &[]).await?;
    let mut samples = Vec::new();
    for row in &rows {
        let sample = UsageSample::from_row(row)?;
        if scope.covers_table(&sample.index.table_relname) {
            samples.push(sample);
        }
    }
    Ok(samples)
}
