//! Server settings compared against targets derived from installed memory.
//!
//! `max_connections` is judged first. When it is clamped, the clamped value is the
//! divisor for the `work_mem` target.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use tracing::{error, instrument};

use super::{Findings, log_query_failure};
use crate::app::AppContext;
use crate::config::Thresholds;
use crate::datasource::DataSource;
use crate::format::{clear_to_gb, clear_to_mb, pg_units_to_bytes, pretty_memory};
use crate::issue::{Issue, Severity};
use crate::snapshot::StatsView;

const DETECTOR: &str = "ConfigIssues";
const ISSUE_TYPE: &str = "Config";
const MAX_CONNECTIONS: &str = "max_connections";
/// Observed peak times this factor must stay under this budget for a clamp.
const OBSERVED_FACTOR: i64 = 15;
const OBSERVED_BUDGET: i64 = 2000;
const GB: f64 = 1024.0 * 1024.0 * 1024.0;
const MB: f64 = 1024.0 * 1024.0;

const SETTINGS_SQL: &str = r#"
/* pgscout:config_settings */
SELECT name::text AS name, setting::text AS setting, unit::text AS unit
FROM pg_catalog.pg_settings
WHERE name IN (
    'checkpoint_completion_target',
    'default_statistics_target',
    'effective_cache_size',
    'maintenance_work_mem',
    'max_connections',
    'shared_buffers',
    'work_mem'
)
"#;

const MAX_ACTIVE_SQL: &str = r#"
/* pgscout:max_active_connections */
SELECT max(active)::bigint
FROM (
    SELECT count(*) AS active
    FROM pgscout_pg_stat_activity
    WHERE state = 'active'
    GROUP BY captured_at
) AS per_snapshot
"#;

/// One `pg_settings` row: raw value text and optional unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub value: String,
    pub unit: Option<String>,
}

impl Setting {
    pub fn new(value: impl Into<String>, unit: Option<&str>) -> Self {
        Self {
            value: value.into(),
            unit: unit.map(str::to_string),
        }
    }

    fn units(&self) -> &str {
        self.unit.as_deref().unwrap_or("")
    }

    fn int(&self) -> Result<i64> {
        self.value
            .trim()
            .parse()
            .with_context(|| format!("'{}' is not an integer", self.value))
    }

    fn float(&self) -> Result<f64> {
        self.value
            .trim()
            .parse()
            .with_context(|| format!("'{}' is not a number", self.value))
    }

    fn bytes(&self) -> Result<i64> {
        pg_units_to_bytes(self.int()?, self.units())
    }
}

fn out_of_band(value: f64, low: f64, high: f64) -> Option<&'static str> {
    if value < low {
        Some("low")
    } else if value > high {
        Some("high")
    } else {
        None
    }
}

fn config_issue(name: &str, detail: String, solution: String) -> Issue {
    Issue::new(ISSUE_TYPE, name, Severity::High, detail, solution)
}

fn update_conf(name: &str, value: String) -> String {
    format!("Update postgresql.conf - '{name} = {value}'\n")
}

/// Judge `max_connections` against the busiest observed snapshot. Returns the issue,
/// if any, and the value later targets should divide by.
pub fn evaluate_max_connections(
    configured: i64,
    observed_peak: i64,
    thresholds: &Thresholds,
) -> (Option<Issue>, i64) {
    let cap = thresholds.max_connections_cap;
    if configured > cap && observed_peak * OBSERVED_FACTOR < OBSERVED_BUDGET {
        let issue = config_issue(
            MAX_CONNECTIONS,
            format!(
                "Setting: {MAX_CONNECTIONS}, value: {configured} - excessively large, maximum observed: {observed_peak}\n"
            ),
            update_conf(MAX_CONNECTIONS, cap.to_string()),
        );
        (Some(issue), cap)
    } else {
        (None, configured)
    }
}

/// Compare every fetched setting except `max_connections` to its target band.
/// Unknown names and unparsable values are logged and skipped; without a
/// `max_connections` divisor `work_mem` is skipped as well.
pub fn analyze_settings(
    settings: &BTreeMap<String, Setting>,
    max_connections: Option<i64>,
    thresholds: &Thresholds,
) -> Vec<Issue> {
    let mut issues = Vec::new();
    for (name, setting) in settings {
        if name == MAX_CONNECTIONS {
            continue;
        }
        match judge_setting(name, setting, max_connections, thresholds) {
            Ok(Some(issue)) => issues.push(issue),
            Ok(None) => {}
            Err(err) => error!(
                detector = DETECTOR,
                setting = %name,
                value = %setting.value,
                unit = setting.units(),
                error = %err,
                "internal error evaluating setting"
            ),
        }
    }
    issues
}

fn judge_setting(
    name: &str,
    setting: &Setting,
    max_connections: Option<i64>,
    thresholds: &Thresholds,
) -> Result<Option<Issue>> {
    let memory = thresholds.memory_total_bytes as f64;
    let issue = match name {
        "checkpoint_completion_target" => {
            let value = setting.float()?;
            (!(0.85..=0.95).contains(&value)).then(|| {
                config_issue(
                    name,
                    format!(
                        "Setting: {name}, value(units): {}{} - unusual\n",
                        setting.value,
                        setting.units()
                    ),
                    "Review setting - this is typically 0.9\n".to_string(),
                )
            })
        }
        "default_statistics_target" => {
            let value = setting.int()?;
            (value != 100).then(|| {
                config_issue(
                    name,
                    format!("Setting: {name}, value: {value}\n"),
                    "Review setting - this is typically 100\n".to_string(),
                )
            })
        }
        "effective_cache_size" => {
            let bytes = setting.bytes()?;
            let target = memory * 0.5;
            out_of_band(bytes as f64, 0.8 * target, 1.2 * target).map(|verdict| {
                config_issue(
                    name,
                    format!(
                        "Setting: {name}, value(units): {} {} ({:.2}GB) - {verdict}\nGoal: Total RAM * 0.5\n",
                        setting.value,
                        setting.units(),
                        bytes as f64 / GB
                    ),
                    update_conf(name, pretty_memory(clear_to_gb(target as i64))),
                )
            })
        }
        "maintenance_work_mem" => {
            let bytes = setting.bytes()?;
            let target = memory * 0.05;
            out_of_band(bytes as f64, 0.5 * target, 1.5 * target).map(|verdict| {
                config_issue(
                    name,
                    format!(
                        "Setting: {name}, value(units): {} {} ({:.2}MB) - {verdict}\nGoal: Total RAM * 0.05\n",
                        setting.value,
                        setting.units(),
                        bytes as f64 / MB
                    ),
                    update_conf(name, pretty_memory(clear_to_mb(target as i64))),
                )
            })
        }
        "shared_buffers" => {
            let bytes = setting.bytes()?;
            out_of_band(bytes as f64, 0.15 * memory, 0.25 * memory).map(|verdict| {
                config_issue(
                    name,
                    format!(
                        "Setting: {name}, value(units): {} {} ({:.2}GB) - {verdict}\nGoal: 15% to 25% of the machine's total RAM\n",
                        setting.value,
                        setting.units(),
                        bytes as f64 / GB
                    ),
                    update_conf(name, pretty_memory(thresholds.memory_total_bytes / 4)),
                )
            })
        }
        "work_mem" => {
            let Some(max_connections) = max_connections.filter(|value| *value > 0) else {
                return Err(anyhow!("work_mem target needs a usable max_connections"));
            };
            let bytes = setting.bytes()?;
            let target = memory * 0.25 / max_connections as f64;
            out_of_band(bytes as f64, 0.8 * target, 1.2 * target).map(|verdict| {
                config_issue(
                    name,
                    format!(
                        "Setting: {name}, value(units): {} {} ({:.2}MB) - {verdict}\nGoal: Total RAM * 0.25 / max_connections({max_connections})\n",
                        setting.value,
                        setting.units(),
                        bytes as f64 / MB
                    ),
                    update_conf(name, pretty_memory(clear_to_mb(target as i64))),
                )
            })
        }
        other => return Err(anyhow!("unexpected setting name '{other}'")),
    };
    Ok(issue)
}

#[instrument(skip_all, fields(database = source.database_name()))]
pub async fn run<D: DataSource>(ctx: &AppContext, source: &D, findings: &mut Findings) {
    let database = source.database_name();
    let thresholds = &ctx.config.thresholds;

    let settings = match load_settings(source).await {
        Ok(settings) => settings,
        Err(err) => {
            log_query_failure(DETECTOR, "config_settings", database, &err);
            return;
        }
    };

    // Without a usable max_connections only the checks that depend on it are skipped.
    let configured = match settings.get(MAX_CONNECTIONS).map(Setting::int) {
        Some(Ok(value)) => Some(value),
        Some(Err(err)) => {
            error!(
                detector = DETECTOR,
                database,
                error = %err,
                "internal error evaluating max_connections"
            );
            None
        }
        None => {
            error!(detector = DETECTOR, database, "max_connections missing from pg_settings");
            None
        }
    };

    let max_connections = match configured {
        Some(configured) => {
            Some(judge_max_connections(source, configured, thresholds, findings).await)
        }
        None => None,
    };

    for issue in analyze_settings(&settings, max_connections, thresholds) {
        findings.push(issue);
    }
}

/// Judge `max_connections` against the activity history and return the `work_mem` divisor.
async fn judge_max_connections<D: DataSource>(
    source: &D,
    configured: i64,
    thresholds: &Thresholds,
    findings: &mut Findings,
) -> i64 {
    let database = source.database_name();
    let observed = match source.query_scalar(MAX_ACTIVE_SQL, &[]).await {
        Ok(value) => value.as_i64(),
        Err(err) => {
            log_query_failure(DETECTOR, "max_active_connections", database, &err);
            return configured;
        }
    };

    match observed {
        Some(peak) => {
            let (issue, effective) = evaluate_max_connections(configured, peak, thresholds);
            if let Some(issue) = issue {
                findings.push(issue);
            }
            effective
        }
        None => {
            findings.warn(
                DETECTOR,
                database,
                format!(
                    "no connection activity recorded in {}; max_connections not evaluated",
                    StatsView::StatActivity.series()
                ),
            );
            configured
        }
    }
}

async fn load_settings<D: DataSource>(source: &D) -> Result<BTreeMap<String, Setting>> {
    let rows = source.query_rows(SETTINGS_SQL, &[]).await?;
    let mut settings = BTreeMap::new();
    for row in &rows {
        settings.insert(
            row.text("name")?,
            Setting {
                value: row.text("setting")?,
                unit: row.opt_text("unit")?,
            },
        );
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuned(thresholds: &Thresholds) -> BTreeMap<String, Setting> {
        let memory_kb = thresholds.memory_total_bytes / 1024;
        BTreeMap::from([
            ("checkpoint_completion_target".to_string(), Setting::new("0.9", None)),
            ("default_statistics_target".to_string(), Setting::new("100", None)),
            (
                "effective_cache_size".to_string(),
                Setting::new((memory_kb / 2 / 8).to_string(), Some("8kB")),
            ),
            (
                "maintenance_work_mem".to_string(),
                Setting::new((memory_kb / 20).to_string(), Some("kB")),
            ),
            (
                "shared_buffers".to_string(),
                Setting::new((memory_kb / 5 / 8).to_string(), Some("8kB")),
            ),
            (
                "work_mem".to_string(),
                Setting::new((memory_kb / 4 / 100).to_string(), Some("kB")),
            ),
        ])
    }

    #[test]
    fn tuned_server_has_no_issues() {
        let thresholds = Thresholds::default();
        assert!(analyze_settings(&tuned(&thresholds), Some(100), &thresholds).is_empty());
    }

    #[test]
    fn clamp_applies_only_when_observed_load_is_light() {
        let thresholds = Thresholds::default();
        let (issue, effective) = evaluate_max_connections(500, 50, &thresholds);
        let issue = issue.unwrap();
        assert_eq!(issue.severity, Severity::High);
        assert!(issue.solution.contains("max_connections = 200"));
        assert_eq!(effective, 200);

        let (issue, effective) = evaluate_max_connections(500, 150, &thresholds);
        assert!(issue.is_none());
        assert_eq!(effective, 500);
    }

    #[test]
    fn work_mem_target_uses_clamped_connections() {
        let thresholds = Thresholds::default();
        let settings = BTreeMap::from([(
            "work_mem".to_string(),
            Setting::new("4096", Some("kB")),
        )]);
        let issues = analyze_settings(&settings, Some(200), &thresholds);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].detail.contains("max_connections(200)"));
        assert!(issues[0].detail.contains("- low"));
        // 128GiB * 0.25 / 200 = 163.84MiB, truncated to 163MB.
        assert_eq!(issues[0].solution, "Update postgresql.conf - 'work_mem = 163MB'\n");
    }

    #[test]
    fn shared_buffers_proposes_quarter_of_ram() {
        let thresholds = Thresholds::default();
        let settings = BTreeMap::from([(
            "shared_buffers".to_string(),
            Setting::new("16384", Some("8kB")),
        )]);
        let issues = analyze_settings(&settings, Some(100), &thresholds);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].solution, "Update postgresql.conf - 'shared_buffers = 32GB'\n");
    }

    #[test]
    fn bad_values_and_unknown_names_are_skipped() {
        let thresholds = Thresholds::default();
        let settings = BTreeMap::from([
            ("default_statistics_target".to_string(), Setting::new("lots", None)),
            ("random_page_cost".to_string(), Setting::new("4", None)),
            ("checkpoint_completion_target".to_string(), Setting::new("0.5", None)),
        ]);
        let issues = analyze_settings(&settings, Some(100), &thresholds);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].target, "checkpoint_completion_target");
    }

    #[test]
    fn missing_divisor_skips_only_work_mem() {
        let thresholds = Thresholds::default();
        let settings = BTreeMap::from([
            ("shared_buffers".to_string(), Setting::new("16384", Some("8kB"))),
            ("work_mem".to_string(), Setting::new("4096", Some("kB"))),
        ]);
        let issues = analyze_settings(&settings, None, &thresholds);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].target, "shared_buffers");
    }
}
