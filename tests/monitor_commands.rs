mod common;

use common::{Reply, ScriptedSource, context};
use pgscout::EngineError;
use pgscout::monitor::{self, MonitorCommand};
use pgscout::snapshot::StatsView;

#[tokio::test]
async fn dry_run_lists_statements_without_executing() {
    let ctx = context().with_flags(false, true);
    let source = ScriptedSource::new();

    let report = monitor::run(MonitorCommand::Initialize, &ctx, &source).await;

    assert!(source.calls().is_empty());
    assert_eq!(report.failures, 0);
    assert_eq!(report.statements.len(), StatsView::ALL.len() * 4);
    assert!(report.statements[0].starts_with("CREATE TABLE IF NOT EXISTS pgscout_"));
    assert!(
        report
            .statements
            .last()
            .is_some_and(|sql| sql.starts_with("INSERT INTO pgscout_"))
    );
}

#[tokio::test]
async fn reset_runs_stats_reset_then_drop_then_initialize() {
    let ctx = context();
    let source = ScriptedSource::new();

    let report = monitor::run(MonitorCommand::Reset, &ctx, &source).await;

    let views = StatsView::ALL.len();
    assert_eq!(report.statements.len(), 1 + views + views * 4);
    assert_eq!(report.statements[0], "SELECT pg_stat_reset()");
    assert!(
        report.statements[1..=views]
            .iter()
            .all(|sql| sql.starts_with("DROP TABLE IF EXISTS pgscout_"))
    );
    assert_eq!(source.calls(), report.statements);
}

#[tokio::test]
async fn failing_view_is_counted_and_others_continue() {
    let ctx = context();
    let source = ScriptedSource::new().on(
        &["AS TABLE pg_stat_statements"],
        Reply::Fail("relation \"pg_stat_statements\" does not exist".into()),
    );

    let report = monitor::run(MonitorCommand::Initialize, &ctx, &source).await;

    assert_eq!(report.failures, 1);
    assert_eq!(source.calls().len(), StatsView::ALL.len() * 4);
}

#[tokio::test]
async fn summary_requires_tracking_tables() {
    let source = ScriptedSource::new().scalar(&["pgscout:tracking_table_count"], 0_i64);

    let err = monitor::summary(&source).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::MonitorNotInitialized { schema }) if schema == "public"
    ));
}
