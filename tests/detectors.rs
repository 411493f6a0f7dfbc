mod common;

use common::{ScriptedSource, context};
use pgscout::{Detector, DetectorKind, EngineError, Row, Value};

fn tuned_settings() -> ScriptedSource {
    ScriptedSource::new()
        .rows(
            &["pgscout:config_settings"],
            vec![
                Row::from_pairs([
                    ("name", Value::from("max_connections")),
                    ("setting", Value::from("500")),
                    ("unit", Value::Null),
                ]),
                Row::from_pairs([
                    ("name", Value::from("default_statistics_target")),
                    ("setting", Value::from("100")),
                    ("unit", Value::Null),
                ]),
            ],
        )
        .scalar(&["pgscout:max_active_connections"], 10_i64)
}

#[test]
fn unknown_detector_name_is_an_error() {
    let ctx = context();
    let source = ScriptedSource::new();
    let err = Detector::by_name("IndexMagic", &ctx, &source).err();
    assert!(matches!(err, Some(EngineError::UnknownDetector(name)) if name == "IndexMagic"));

    let known = Detector::by_name("TableBloat", &ctx, &source).map(|d| d.kind());
    assert!(matches!(known, Ok(DetectorKind::TableBloat)));
}

#[tokio::test]
async fn all_keeps_going_after_routine_failures() {
    let ctx = context();
    let source = tuned_settings();

    let mut detector = Detector::init(DetectorKind::All, &ctx, &source);
    detector.execute(None).await;

    // Only the config routine has data; everything else failed and was logged.
    let issues = detector.issues();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].target, "max_connections");

    let calls = source.calls();
    assert!(calls[0].contains("pgscout:table_bloat"));
    assert!(
        calls
            .last()
            .is_some_and(|sql| sql.contains("pgscout:snapshot_timestamps"))
    );
}

#[tokio::test]
async fn execute_is_repeatable() {
    let ctx = context();
    let source = tuned_settings();

    let mut detector = Detector::init(DetectorKind::ConfigIssues, &ctx, &source);
    detector.execute(None).await;
    let first = detector.issues().to_vec();
    detector.execute(None).await;

    assert_eq!(detector.issues(), first.as_slice());
}

#[tokio::test]
async fn help_touches_no_data() {
    let ctx = context();
    let source = ScriptedSource::new();

    let mut detector = Detector::init(DetectorKind::Help, &ctx, &source);
    detector.execute(None).await;

    assert!(detector.issues().is_empty());
    assert!(source.calls().is_empty());
}
