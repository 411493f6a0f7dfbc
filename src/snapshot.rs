use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::datasource::DataSource;
use crate::error::EngineError;

/// Prefix for every tracking table the monitor creates.
pub const TRACKING_PREFIX: &str = "pgscout_";
/// Column appended to each tracking table holding the capture instant.
pub const CAPTURED_AT: &str = "captured_at";

/// System views copied into tracking tables on every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsView {
    StatUserIndexes,
    StatioUserIndexes,
    StatUserTables,
    StatioUserTables,
    StatStatements,
    StatActivity,
}

impl StatsView {
    pub const ALL: [StatsView; 6] = [
        StatsView::StatUserIndexes,
        StatsView::StatioUserIndexes,
        StatsView::StatUserTables,
        StatsView::StatioUserTables,
        StatsView::StatStatements,
        StatsView::StatActivity,
    ];

    pub fn view_name(self) -> &'static str {
        match self {
            StatsView::StatUserIndexes => "pg_stat_user_indexes",
            StatsView::StatioUserIndexes => "pg_statio_user_indexes",
            StatsView::StatUserTables => "pg_stat_user_tables",
            StatsView::StatioUserTables => "pg_statio_user_tables",
            StatsView::StatStatements => "pg_stat_statements",
            StatsView::StatActivity => "pg_stat_activity",
        }
    }

    /// Name of the tracking table (the snapshot series) for this view.
    pub fn series(self) -> String {
        format!("{TRACKING_PREFIX}{}", self.view_name())
    }
}

/// A `[start, end]` analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AnalysisWindow {
    pub fn span_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }
}

/// Pick the candidate nearest to `target`. Equidistant candidates resolve to the first
/// one in slice order.
pub fn closest_timestamp(
    candidates: &[DateTime<Utc>],
    target: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    candidates
        .iter()
        .copied()
        .min_by_key(|captured| (*captured - target).num_milliseconds().unsigned_abs())
}

/// Distinct capture instants recorded in a series, oldest first.
pub async fn capture_timestamps<D: DataSource>(
    source: &D,
    view: StatsView,
) -> Result<Vec<DateTime<Utc>>> {
    let sql = format!(
        "/* pgscout:snapshot_timestamps */ SELECT DISTINCT {CAPTURED_AT} FROM {} ORDER BY {CAPTURED_AT}",
        view.series()
    );
    let rows = source.query_rows(&sql, &[]).await?;
    rows.iter().map(|row| row.timestamp(CAPTURED_AT)).collect()
}

/// Resolve `target` to the nearest snapshot actually captured for `view`.
pub async fn resolve_closest<D: DataSource>(
    source: &D,
    view: StatsView,
    target: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let captured = capture_timestamps(source, view).await?;
    closest_timestamp(&captured, target).ok_or_else(|| {
        EngineError::InsufficientHistory {
            series: view.series(),
        }
        .into()
    })
}

/// Resolve both ends of a requested window against one series.
pub async fn resolve_window<D: DataSource>(
    source: &D,
    view: StatsView,
    requested: AnalysisWindow,
) -> Result<AnalysisWindow> {
    let captured = capture_timestamps(source, view).await?;
    let insufficient = || EngineError::InsufficientHistory {
        series: view.series(),
    };
    let start = closest_timestamp(&captured, requested.start).ok_or_else(insufficient)?;
    let end = closest_timestamp(&captured, requested.end).ok_or_else(insufficient)?;
    debug!(
        series = %view.series(),
        requested_start = %requested.start,
        requested_end = %requested.end,
        %start,
        %end,
        "resolved analysis window"
    );
    Ok(AnalysisWindow { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn closest_picks_minimum_absolute_distance() {
        let series = [ts(0, 0), ts(1, 0), ts(2, 0), ts(9, 0)];
        assert_eq!(closest_timestamp(&series, ts(1, 20)), Some(ts(1, 0)));
        assert_eq!(closest_timestamp(&series, ts(1, 40)), Some(ts(2, 0)));
        assert_eq!(closest_timestamp(&series, ts(23, 0)), Some(ts(9, 0)));
        assert_eq!(closest_timestamp(&series, ts(0, 0)), Some(ts(0, 0)));
    }

    #[test]
    fn closest_tolerates_large_gaps_and_keeps_first_tie() {
        let series = [ts(1, 0), ts(3, 0)];
        assert_eq!(closest_timestamp(&series, ts(2, 0)), Some(ts(1, 0)));
        assert_eq!(closest_timestamp(&[], ts(2, 0)), None);
    }

    #[test]
    fn series_names_follow_tracking_prefix() {
        assert_eq!(
            StatsView::StatStatements.series(),
            "pgscout_pg_stat_statements"
        );
        assert!(StatsView::ALL.iter().all(|view| view.series().starts_with(TRACKING_PREFIX)));
    }
}
