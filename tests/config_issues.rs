mod common;

use common::{ScriptedSource, context};
use pgscout::{Detector, DetectorKind, Row, Severity, Value};

fn setting(name: &str, value: &str, unit: Option<&str>) -> Row {
    Row::from_pairs([
        ("name", Value::from(name)),
        ("setting", Value::from(value)),
        ("unit", Value::from(unit)),
    ])
}

fn oversized_server(peak: Value) -> ScriptedSource {
    ScriptedSource::new()
        .rows(
            &["pgscout:config_settings"],
            vec![
                setting("max_connections", "500", None),
                setting("work_mem", "4096", Some("kB")),
            ],
        )
        .scalar(&["pgscout:max_active_connections"], peak)
}

#[tokio::test]
async fn idle_oversized_pool_is_clamped_before_work_mem() {
    let ctx = context();
    let source = oversized_server(Value::Int(50));

    let mut detector = Detector::init(DetectorKind::ConfigIssues, &ctx, &source);
    detector.execute(None).await;

    let issues = detector.issues();
    assert_eq!(issues.len(), 2);
    assert_eq!(issues[0].target, "max_connections");
    assert_eq!(issues[0].severity, Severity::High);
    assert_eq!(
        issues[0].solution,
        "Update postgresql.conf - 'max_connections = 200'\n"
    );
    assert!(issues[0].detail.contains("maximum observed: 50"));

    assert_eq!(issues[1].target, "work_mem");
    assert!(issues[1].detail.contains("max_connections(200)"));
    assert!(issues[1].detail.contains(" - low\n"));
    assert!(detector.warnings().is_empty());
}

#[tokio::test]
async fn busy_pool_keeps_configured_connections() {
    let ctx = context();
    let source = oversized_server(Value::Int(150));

    let mut detector = Detector::init(DetectorKind::ConfigIssues, &ctx, &source);
    detector.execute(None).await;

    let issues = detector.issues();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].target, "work_mem");
    assert!(issues[0].detail.contains("max_connections(500)"));
}

#[tokio::test]
async fn missing_activity_history_warns_and_uses_configured_value() {
    let ctx = context();
    let source = oversized_server(Value::Null);

    let mut detector = Detector::init(DetectorKind::ConfigIssues, &ctx, &source);
    detector.execute(None).await;

    assert_eq!(detector.warnings().len(), 1);
    assert!(detector.warnings()[0].contains("pgscout_pg_stat_activity"));
    let issues = detector.issues();
    assert_eq!(issues.len(), 1);
    assert!(issues[0].detail.contains("max_connections(500)"));
}

#[tokio::test]
async fn settings_query_failure_reports_nothing() {
    let ctx = context();
    let source = ScriptedSource::new();

    let mut detector = Detector::init(DetectorKind::ConfigIssues, &ctx, &source);
    detector.execute(None).await;

    assert!(detector.issues().is_empty());
    assert!(detector.warnings().is_empty());
    assert_eq!(source.calls().len(), 1);
}

#[tokio::test]
async fn unparsable_max_connections_still_evaluates_other_settings() {
    let ctx = context();
    let source = ScriptedSource::new()
        .rows(
            &["pgscout:config_settings"],
            vec![
                setting("max_connections", "abc", None),
                setting("shared_buffers", "16384", Some("8kB")),
                setting("work_mem", "4096", Some("kB")),
            ],
        )
        .scalar(&["pgscout:max_active_connections"], 50_i64);

    let mut detector = Detector::init(DetectorKind::ConfigIssues, &ctx, &source);
    detector.execute(None).await;

    let targets: Vec<&str> = detector
        .issues()
        .iter()
        .map(|issue| issue.target.as_str())
        .collect();
    assert_eq!(targets, ["shared_buffers"]);
    assert!(
        source
            .calls()
            .iter()
            .all(|sql| !sql.contains("pgscout:max_active_connections"))
    );
}
