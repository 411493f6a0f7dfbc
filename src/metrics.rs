use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::issue::{Issue, Severity};

const SEVERITIES: [Severity; 3] = [Severity::High, Severity::Medium, Severity::Low];

/// Per-run metrics, written out in node exporter textfile format.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Arc<Registry>,
    detectors: DetectorMetrics,
    monitor: MonitorMetrics,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("pgscout".into()), None)?);

        let detectors = DetectorMetrics::register(&registry)?;
        let monitor = MonitorMetrics::register(&registry)?;

        Ok(Self {
            registry,
            detectors,
            monitor,
        })
    }

    /// Record one finished detector run: its duration, issue counts per severity,
    /// and warnings raised.
    pub fn record_detector(
        &self,
        database: &str,
        detector: &str,
        duration: Duration,
        issues: &[Issue],
        warnings: usize,
    ) {
        self.detectors
            .duration
            .with_label_values(&[database, detector])
            .observe(duration.as_secs_f64());

        for severity in SEVERITIES {
            let count = issues
                .iter()
                .filter(|issue| issue.severity == severity)
                .count();
            self.detectors
                .issues
                .with_label_values(&[database, detector, severity.as_str()])
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }

        self.detectors
            .warnings_total
            .with_label_values(&[database, detector])
            .inc_by(warnings as u64);
    }

    /// Count monitor statements that failed for one command.
    pub fn record_monitor(&self, database: &str, command: &str, failures: usize) {
        self.monitor
            .failures_total
            .with_label_values(&[database, command])
            .inc_by(failures as u64);
    }

    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct DetectorMetrics {
    duration: HistogramVec,
    issues: IntGaugeVec,
    warnings_total: IntCounterVec,
}

impl DetectorMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let duration = HistogramVec::new(
            HistogramOpts::new("detector_duration_seconds", "Detector wall-clock duration"),
            &["database", "detector"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        let issues = IntGaugeVec::new(
            Opts::new("issues", "Issues reported by the last detector run"),
            &["database", "detector", "severity"],
        )?;
        registry.register(Box::new(issues.clone()))?;

        let warnings_total = IntCounterVec::new(
            Opts::new("warnings_total", "Insufficient-data warnings raised by detectors"),
            &["database", "detector"],
        )?;
        registry.register(Box::new(warnings_total.clone()))?;

        Ok(Self {
            duration,
            issues,
            warnings_total,
        })
    }
}

#[derive(Clone)]
struct MonitorMetrics {
    failures_total: IntCounterVec,
}

impl MonitorMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let failures_total = IntCounterVec::new(
            Opts::new(
                "monitor_statement_failures_total",
                "Tracking table statements that failed",
            ),
            &["database", "command"],
        )?;
        registry.register(Box::new(failures_total.clone()))?;

        Ok(Self { failures_total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_run_exports_issue_counts_by_severity() {
        let metrics = EngineMetrics::new().expect("metrics");
        let issues = vec![
            Issue::new("IndexUnused", "a_idx", Severity::High, "", ""),
            Issue::new("IndexUnused", "b_idx", Severity::High, "", ""),
            Issue::new("IndexBloat", "c_idx", Severity::Medium, "", ""),
        ];
        metrics.record_detector("app", "IndexIssues", Duration::from_millis(120), &issues, 1);

        let output = metrics.encode().expect("encode");
        let high = output.lines().find(|line| {
            line.starts_with("pgscout_issues{")
                && line.contains("severity=\"high\"")
                && line.trim_end().ends_with(" 2")
        });
        assert!(high.is_some(), "high severity gauge missing: {output}");
        assert!(output.contains("pgscout_detector_duration_seconds_count"));
        assert!(
            output.contains("pgscout_warnings_total{database=\"app\",detector=\"IndexIssues\"} 1")
        );
    }
}
