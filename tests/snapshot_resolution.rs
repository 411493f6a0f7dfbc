mod common;

use common::{ScriptedSource, at, timestamps};
use pgscout::EngineError;
use pgscout::snapshot::{AnalysisWindow, StatsView, resolve_closest, resolve_window};

const STATEMENTS_SERIES: &[&str] = &["pgscout:snapshot_timestamps", "pgscout_pg_stat_statements"];

#[tokio::test]
async fn resolves_nearest_capture_across_agent_downtime() {
    let source = ScriptedSource::new().rows(
        STATEMENTS_SERIES,
        timestamps(&[at(1, 0), at(1, 1), at(3, 0)]),
    );

    let found = resolve_closest(&source, StatsView::StatStatements, at(2, 0))
        .await
        .expect("resolved");
    assert_eq!(found, at(1, 1));

    let far_future = resolve_closest(&source, StatsView::StatStatements, at(20, 0))
        .await
        .expect("resolved");
    assert_eq!(far_future, at(3, 0));
}

#[tokio::test]
async fn empty_series_reports_insufficient_history() {
    let source = ScriptedSource::new().rows(STATEMENTS_SERIES, Vec::new());

    let err = resolve_closest(&source, StatsView::StatStatements, at(2, 0))
        .await
        .unwrap_err();
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::InsufficientHistory { series }) => {
            assert_eq!(series, "pgscout_pg_stat_statements")
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn window_ends_resolve_independently() {
    let source = ScriptedSource::new().rows(
        STATEMENTS_SERIES,
        timestamps(&[at(1, 0), at(1, 12), at(2, 0), at(2, 12)]),
    );

    let window = resolve_window(
        &source,
        StatsView::StatStatements,
        AnalysisWindow {
            start: at(1, 11),
            end: at(2, 13),
        },
    )
    .await
    .expect("window");
    assert_eq!(window.start, at(1, 12));
    assert_eq!(window.end, at(2, 12));
    assert_eq!(window.span_seconds(), 24 * 3600);
}
