use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::AppConfig;
use crate::snapshot::AnalysisWindow;

/// Per-invocation context handed to detectors and monitor commands.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub verbose: bool,
    pub dry_run: bool,
    /// Length of the analysis window.
    pub duration: Duration,
    /// How far before "now" the window ends.
    pub duration_offset: Duration,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let duration = config.analysis.duration;
        let duration_offset = config.analysis.offset;
        Self {
            config: Arc::new(config),
            verbose: false,
            dry_run: false,
            duration,
            duration_offset,
        }
    }

    pub fn with_flags(mut self, verbose: bool, dry_run: bool) -> Self {
        self.verbose = verbose;
        self.dry_run = dry_run;
        self
    }

    pub fn with_window(mut self, duration: Duration, duration_offset: Duration) -> Self {
        self.duration = duration;
        self.duration_offset = duration_offset;
        self
    }

    /// Requested window ending `duration_offset` before `now`.
    pub fn requested_window(&self, now: DateTime<Utc>) -> AnalysisWindow {
        let end = shift_back(now, self.duration_offset);
        let start = shift_back(end, self.duration);
        AnalysisWindow { start, end }
    }
}

fn shift_back(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_ends_offset_before_now() {
        let ctx = AppContext::new(AppConfig::default())
            .with_window(Duration::from_secs(3600), Duration::from_secs(600));
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let window = ctx.requested_window(now);
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 5, 1, 11, 50, 0).unwrap());
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 5, 1, 10, 50, 0).unwrap());
    }
}
