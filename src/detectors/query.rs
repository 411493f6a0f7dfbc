use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument};
use xxhash_rust::xxh3::xxh3_64;

use super::{Findings, is_insufficient_history, log_query_failure};
use crate::app::AppContext;
use crate::datasource::{DataSource, Param, Row};
use crate::delta::{Counters, compute_deltas, counters_from_rows};
use crate::issue::{Issue, NO_SOLUTION, Severity};
use crate::snapshot::{AnalysisWindow, StatsView, resolve_window};

const DETECTOR: &str = "QueryIssues";
const ISSUE_TYPE: &str = "QueryHighLoad";
const COUNTERS: &[&str] = &["calls", "total_exec_time"];

const TOTAL_TIME_SQL: &str = r#"
/* pgscout:query_total_time */
SELECT coalesce(sum(total_exec_time), 0)::float8
FROM pgscout_pg_stat_statements
WHERE captured_at = $1
"#;

// Statements above the cumulative cutoff at the window end, system users excluded.
// Zero-time rows are EXPLAIN and PREPARE noise.
const WINDOW_END_SQL: &str = r#"
/* pgscout:query_window_end */
SELECT
    u.usename::text AS username,
    s.queryid::bigint AS queryid,
    s.calls::bigint AS calls,
    s.mean_exec_time::float8 AS mean_exec_time,
    s.total_exec_time::float8 AS total_exec_time,
    s.query::text AS query
FROM pgscout_pg_stat_statements s
JOIN pg_catalog.pg_user u ON u.usesysid = s.userid
WHERE s.captured_at = $1
  AND s.total_exec_time <> 0
  AND s.total_exec_time > $2
  AND NOT (u.usename = ANY($3))
"#;

const WINDOW_START_SQL: &str = r#"
/* pgscout:query_window_start */
SELECT
    u.usename::text AS username,
    s.queryid::bigint AS queryid,
    s.calls::bigint AS calls,
    s.total_exec_time::float8 AS total_exec_time
FROM pgscout_pg_stat_statements s
JOIN pg_catalog.pg_user u ON u.usesysid = s.userid
WHERE s.captured_at = $1
  AND s.total_exec_time <> 0
  AND s.queryid = ANY($2)
"#;

/// A statement is one query id run by one user.
pub type StatementKey = (i64, String);

/// Window activity for one statement, ready to rank.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLoad {
    pub queryid: i64,
    pub username: String,
    pub calls: f64,
    pub exec_time_ms: f64,
    pub mean_ms: f64,
    pub percent: f64,
    pub text: String,
}

/// 64-bit xxh3 of the statement text, as 16 hex digits.
pub fn fingerprint(query: &str) -> String {
    format!("{:016x}", xxh3_64(query.as_bytes()))
}

/// Label for a statement: an exact fingerprint entry wins, then the first
/// `/substring/` entry whose text occurs in the query.
pub fn label_for<'a>(labels: &'a BTreeMap<String, String>, query: &str) -> Option<&'a str> {
    if let Some(label) = labels.get(&fingerprint(query)) {
        return Some(label);
    }
    labels.iter().find_map(|(key, label)| {
        let pattern = key.strip_prefix('/')?.strip_suffix('/')?;
        (!pattern.is_empty() && query.contains(pattern)).then_some(label.as_str())
    })
}

pub fn severity_for(percent: f64) -> Severity {
    if percent >= 20.0 {
        Severity::High
    } else if percent >= 5.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Shares are relative to the summed window time of every ranked statement.
/// Ordered by window time descending, then key.
pub fn rank_loads(
    deltas: &BTreeMap<StatementKey, Counters>,
    texts: &BTreeMap<StatementKey, (f64, String)>,
) -> Vec<QueryLoad> {
    let total: f64 = deltas
        .values()
        .map(|counters| counters.get("total_exec_time").copied().unwrap_or(0.0))
        .sum();

    let mut loads: Vec<QueryLoad> = deltas
        .iter()
        .map(|((queryid, username), counters)| {
            let calls = counters.get("calls").copied().unwrap_or(0.0);
            let exec_time_ms = counters.get("total_exec_time").copied().unwrap_or(0.0);
            let (end_mean, text) = texts
                .get(&(*queryid, username.clone()))
                .cloned()
                .unwrap_or_default();
            QueryLoad {
                queryid: *queryid,
                username: username.clone(),
                calls,
                exec_time_ms,
                mean_ms: if calls > 0.0 { exec_time_ms / calls } else { end_mean },
                percent: if total > 0.0 {
                    exec_time_ms * 100.0 / total
                } else {
                    0.0
                },
                text,
            }
        })
        .collect();

    loads.sort_by(|a, b| {
        b.exec_time_ms
            .total_cmp(&a.exec_time_ms)
            .then_with(|| a.queryid.cmp(&b.queryid))
            .then_with(|| a.username.cmp(&b.username))
    });
    loads
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn statement_key(row: &Row) -> Result<StatementKey> {
    Ok((row.int("queryid")?, row.text("username")?))
}

#[instrument(skip_all, fields(database = source.database_name()))]
pub async fn run<D: DataSource>(ctx: &AppContext, source: &D, findings: &mut Findings) {
    let database = source.database_name();
    let requested = ctx.requested_window(Utc::now());

    let window = match resolve_window(source, StatsView::StatStatements, requested).await {
        Ok(window) => window,
        Err(err) if is_insufficient_history(&err) => {
            findings.warn(DETECTOR, database, err.to_string());
            return;
        }
        Err(err) => {
            log_query_failure(DETECTOR, "snapshot_timestamps", database, &err);
            return;
        }
    };
    if window.start == window.end {
        findings.warn(
            DETECTOR,
            database,
            format!(
                "only one snapshot ({}) falls near the requested window; take more snapshots",
                window.end
            ),
        );
        return;
    }

    if let Err(err) = analyze_window(ctx, source, window, findings).await {
        log_query_failure(DETECTOR, "query_window", database, &err);
    }
}

async fn analyze_window<D: DataSource>(
    ctx: &AppContext,
    source: &D,
    window: AnalysisWindow,
    findings: &mut Findings,
) -> Result<()> {
    let database = source.database_name();
    let share = ctx.config.thresholds.query_share_percent;

    let total_ms = source
        .query_scalar(TOTAL_TIME_SQL, &[Param::Timestamp(window.end)])
        .await?
        .as_f64()
        .unwrap_or(0.0);
    if ctx.verbose {
        info!(
            database,
            duration = ?ctx.duration,
            start = %window.start,
            end = %window.end,
            span_seconds = window.span_seconds(),
            total_exec_time_ms = total_ms,
            "analyzing query load"
        );
    }
    let cutoff = total_ms * share / 100.0;

    let end_rows = source
        .query_rows(
            WINDOW_END_SQL,
            &[
                Param::Timestamp(window.end),
                Param::Float(cutoff),
                Param::TextList(ctx.config.excluded_users.clone()),
            ],
        )
        .await?;
    let mut texts = BTreeMap::new();
    for row in &end_rows {
        texts.insert(
            statement_key(row)?,
            (
                row.opt_float("mean_exec_time")?.unwrap_or(0.0),
                row.opt_text("query")?.unwrap_or_default(),
            ),
        );
    }
    let end = counters_from_rows(&end_rows, COUNTERS, statement_key)?;

    let mut queryids: Vec<i64> = end.keys().map(|(queryid, _)| *queryid).collect();
    queryids.dedup();
    let start_rows = source
        .query_rows(
            WINDOW_START_SQL,
            &[Param::Timestamp(window.start), Param::IntList(queryids)],
        )
        .await?;
    let start = counters_from_rows(&start_rows, COUNTERS, statement_key)?;

    let deltas = compute_deltas(&start, &end);
    let fresh: Vec<String> = deltas
        .newly_observed()
        .map(|((queryid, _), _)| queryid.to_string())
        .collect();
    if !fresh.is_empty() {
        findings.warn(
            DETECTOR,
            database,
            format!(
                "not all queries matched in the window, data suspect (end: {}, start: {}); unmatched query ids: {}",
                end.len(),
                start.len(),
                fresh.join(", ")
            ),
        );
    }

    if deltas.vanished > 0 {
        findings.warn(
            DETECTOR,
            database,
            format!(
                "{} queries seen at the window start are gone at the end (evicted or reset); their load is not counted",
                deltas.vanished
            ),
        );
    }

    let mut usable = BTreeMap::new();
    for (key, record) in deltas.records {
        if record.get("total_exec_time") < 0.0 || record.get("calls") < 0.0 {
            findings.warn(
                DETECTOR,
                database,
                format!(
                    "query id {} counters went backwards in the window; statistics were reset, skipped",
                    key.0
                ),
            );
            continue;
        }
        usable.insert(key, record.counters);
    }

    let labels = &ctx.config.query_labels;
    for load in rank_loads(&usable, &texts) {
        if load.percent < share {
            continue;
        }
        let label = label_for(labels, &load.text)
            .map(|label| format!(", Label: {label}"))
            .unwrap_or_default();
        let detail = format!(
            "User: {}, Calls: {}, Mean: {:.2}ms, Total: {:.2}ms, Share: {:.2}%, Fingerprint: {}{label}\nQuery: {}\n",
            load.username,
            load.calls as i64,
            load.mean_ms,
            load.exec_time_ms,
            load.percent,
            fingerprint(&load.text),
            one_line(&load.text),
        );
        findings.push(Issue::new(
            ISSUE_TYPE,
            format!("queryid {}", load.queryid),
            severity_for(load.percent),
            detail,
            NO_SOLUTION,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(calls: f64, time: f64) -> Counters {
        Counters::from([("calls", calls), ("total_exec_time", time)])
    }

    #[test]
    fn ranking_is_by_window_time_with_shares() {
        let deltas = BTreeMap::from([
            ((1, "app".to_string()), counters(10.0, 100.0)),
            ((2, "app".to_string()), counters(5.0, 700.0)),
            ((3, "etl".to_string()), counters(1.0, 200.0)),
        ]);
        let loads = rank_loads(&deltas, &BTreeMap::new());
        let order: Vec<i64> = loads.iter().map(|load| load.queryid).collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert_eq!(loads[0].percent, 70.0);
        assert_eq!(loads[0].mean_ms, 140.0);
        assert_eq!(severity_for(loads[0].percent), Severity::High);
        assert_eq!(severity_for(loads[1].percent), Severity::High);
        assert_eq!(severity_for(loads[2].percent), Severity::Medium);
        assert_eq!(severity_for(1.5), Severity::Low);
    }

    #[test]
    fn labels_prefer_fingerprint_over_pattern() {
        let query = "SELECT * FROM orders WHERE id = $1";
        let labels = BTreeMap::from([
            ("/FROM orders/".to_string(), "orders".to_string()),
            (fingerprint(query), "order by id".to_string()),
        ]);
        assert_eq!(label_for(&labels, query), Some("order by id"));
        assert_eq!(label_for(&labels, "SELECT 1 FROM orders"), Some("orders"));
        assert_eq!(label_for(&labels, "SELECT 1"), None);
    }

    #[test]
    fn fingerprint_is_sixteen_hex_digits() {
        let fp = fingerprint("SELECT 1");
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, fingerprint("SELECT 1"));
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
