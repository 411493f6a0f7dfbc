use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "/config/pgscout.yaml";

/// Top-level configuration for pgscout.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Label used in logs and metrics when `databases` is empty.
    #[serde(default = "AppConfig::default_database")]
    pub database: String,
    #[serde(default = "AppConfig::default_schema")]
    pub schema: String,
    /// Databases to visit in turn; each gets its own pool on the same server.
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default)]
    pub dsn: String,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default = "AppConfig::default_excluded_users")]
    pub excluded_users: Vec<String>,
    /// Query fingerprint (16 hex digits) or `/substring/` mapped to a friendly label.
    #[serde(default)]
    pub query_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub timeouts: StatementTimeouts,
}

impl AppConfig {
    fn default_database() -> String {
        "postgres".to_string()
    }

    fn default_schema() -> String {
        "public".to_string()
    }

    fn default_excluded_users() -> Vec<String> {
        ["rdsrepladmin", "rdsadmin", "rdstopmgr"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: Self::default_database(),
            schema: Self::default_schema(),
            databases: Vec::new(),
            dsn: String::new(),
            analysis: AnalysisConfig::default(),
            thresholds: Thresholds::default(),
            excluded_users: Self::default_excluded_users(),
            query_labels: BTreeMap::new(),
            timeouts: StatementTimeouts::default(),
        }
    }
}

/// Analysis window defaults; CLI flags override them.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "AnalysisConfig::default_duration", with = "humantime_serde")]
    pub duration: Duration,
    #[serde(default, with = "humantime_serde")]
    pub offset: Duration,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub dry_run: bool,
}

impl AnalysisConfig {
    const fn default_duration() -> Duration {
        Duration::from_secs(24 * 3600)
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            duration: Self::default_duration(),
            offset: Duration::ZERO,
            verbose: false,
            dry_run: false,
        }
    }
}

/// Heuristic thresholds shared by the detectors.
#[derive(Debug, Clone, Deserialize)]
pub struct Thresholds {
    #[serde(default = "Thresholds::default_small_table_rows")]
    pub small_table_rows: i64,
    /// Shortest snapshot span the growth detector will judge.
    #[serde(
        default = "Thresholds::default_growth_min_span",
        with = "humantime_serde"
    )]
    pub growth_min_span: Duration,
    #[serde(default = "Thresholds::default_growth_daily_percent")]
    pub growth_daily_percent: f64,
    #[serde(default = "Thresholds::default_growth_report_rows")]
    pub growth_report_rows: i64,
    #[serde(default = "Thresholds::default_large_table_rows")]
    pub large_table_rows: i64,
    #[serde(default = "Thresholds::default_index_bloat_percent")]
    pub index_bloat_percent: f64,
    #[serde(default = "Thresholds::default_index_bloat_bytes")]
    pub index_bloat_bytes: i64,
    #[serde(default = "Thresholds::default_table_bloat_percent")]
    pub table_bloat_percent: f64,
    #[serde(default = "Thresholds::default_table_bloat_mb")]
    pub table_bloat_mb: f64,
    #[serde(default = "Thresholds::default_table_bloat_large_percent")]
    pub table_bloat_large_percent: f64,
    #[serde(default = "Thresholds::default_table_bloat_large_mb")]
    pub table_bloat_large_mb: f64,
    #[serde(default = "Thresholds::default_overlap_caution_bytes")]
    pub overlap_caution_bytes: i64,
    #[serde(default = "Thresholds::default_overlap_caution_scans")]
    pub overlap_caution_scans: i64,
    #[serde(default = "Thresholds::default_large_index_bytes")]
    pub large_index_bytes: i64,
    /// Installed memory on the database host, used for configuration targets.
    #[serde(default = "Thresholds::default_memory_total_bytes")]
    pub memory_total_bytes: i64,
    #[serde(default = "Thresholds::default_max_connections_cap")]
    pub max_connections_cap: i64,
    #[serde(default = "Thresholds::default_query_share_percent")]
    pub query_share_percent: f64,
}

impl Thresholds {
    const fn default_small_table_rows() -> i64 {
        100
    }

    const fn default_growth_min_span() -> Duration {
        Duration::from_secs(12 * 3600)
    }

    const fn default_growth_daily_percent() -> f64 {
        0.5
    }

    const fn default_growth_report_rows() -> i64 {
        100_000
    }

    const fn default_large_table_rows() -> i64 {
        10_000_000
    }

    const fn default_index_bloat_percent() -> f64 {
        50.0
    }

    const fn default_index_bloat_bytes() -> i64 {
        50 * 1024 * 1024
    }

    const fn default_table_bloat_percent() -> f64 {
        50.0
    }

    const fn default_table_bloat_mb() -> f64 {
        20.0
    }

    const fn default_table_bloat_large_percent() -> f64 {
        25.0
    }

    const fn default_table_bloat_large_mb() -> f64 {
        1_000.0
    }

    const fn default_overlap_caution_bytes() -> i64 {
        100 * 1024 * 1024
    }

    const fn default_overlap_caution_scans() -> i64 {
        50
    }

    const fn default_large_index_bytes() -> i64 {
        100_000_000
    }

    const fn default_memory_total_bytes() -> i64 {
        128 * 1024 * 1024 * 1024
    }

    const fn default_max_connections_cap() -> i64 {
        200
    }

    const fn default_query_share_percent() -> f64 {
        1.0
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            small_table_rows: Self::default_small_table_rows(),
            growth_min_span: Self::default_growth_min_span(),
            growth_daily_percent: Self::default_growth_daily_percent(),
            growth_report_rows: Self::default_growth_report_rows(),
            large_table_rows: Self::default_large_table_rows(),
            index_bloat_percent: Self::default_index_bloat_percent(),
            index_bloat_bytes: Self::default_index_bloat_bytes(),
            table_bloat_percent: Self::default_table_bloat_percent(),
            table_bloat_mb: Self::default_table_bloat_mb(),
            table_bloat_large_percent: Self::default_table_bloat_large_percent(),
            table_bloat_large_mb: Self::default_table_bloat_large_mb(),
            overlap_caution_bytes: Self::default_overlap_caution_bytes(),
            overlap_caution_scans: Self::default_overlap_caution_scans(),
            large_index_bytes: Self::default_large_index_bytes(),
            memory_total_bytes: Self::default_memory_total_bytes(),
            max_connections_cap: Self::default_max_connections_cap(),
            query_share_percent: Self::default_query_share_percent(),
        }
    }
}

/// Postgres session timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct StatementTimeouts {
    #[serde(default = "StatementTimeouts::default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    #[serde(default = "StatementTimeouts::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl StatementTimeouts {
    const fn default_statement_timeout_ms() -> u64 {
        60_000
    }

    const fn default_lock_timeout_ms() -> u64 {
        5_000
    }
}

impl Default for StatementTimeouts {
    fn default() -> Self {
        Self {
            statement_timeout_ms: Self::default_statement_timeout_ms(),
            lock_timeout_ms: Self::default_lock_timeout_ms(),
        }
    }
}

/// Load configuration from YAML disk file, falling back to defaults + env overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("PGSCOUT_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            AppConfig::default()
        }
    };

    enforce_yaml_policy(&config)?;
    apply_env_overrides(&mut config)?;
    ensure_required_secrets(&config)?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => parse_config(&raw)
            .with_context(|| format!("failed to parse YAML config at {}", path.display()))
            .map(Some),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

pub fn parse_config(raw: &str) -> Result<AppConfig> {
    let config = serde_yaml::from_str(raw)?;
    Ok(config)
}

fn enforce_yaml_policy(config: &AppConfig) -> Result<()> {
    if !config.dsn.trim().is_empty() {
        bail!(
            "Remove `dsn` from pgscout YAML config; set the Postgres connection string via the PGSCOUT_DSN environment variable."
        );
    }
    Ok(())
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(database) = env::var("PGSCOUT_DATABASE") {
        if !database.is_empty() {
            config.database = database;
        }
    }

    match env::var("PGSCOUT_DSN") {
        Ok(dsn) => {
            if dsn.trim().is_empty() {
                bail!(
                    "Environment variable PGSCOUT_DSN is set but empty; populate it in your .env file."
                );
            }
            config.dsn = dsn;
        }
        Err(env::VarError::NotPresent) => {}
        Err(err) => return Err(err.into()),
    };

    Ok(())
}

fn ensure_required_secrets(config: &AppConfig) -> Result<()> {
    if config.dsn.trim().is_empty() {
        bail!(
            "Missing Postgres DSN. Set the PGSCOUT_DSN environment variable. Secrets must not be stored in YAML."
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.schema, "public");
        assert_eq!(config.thresholds.small_table_rows, 100);
        assert_eq!(config.thresholds.max_connections_cap, 200);
        assert_eq!(config.analysis.duration, Duration::from_secs(86_400));
        assert_eq!(config.excluded_users.len(), 3);
    }

    #[test]
    fn humantime_durations_and_labels_parse() {
        let raw = r#"
analysis:
  duration: 6h
  offset: 30m
thresholds:
  growth_min_span: 1d
  memory_total_bytes: 68719476736
query_labels:
  "/FROM orders/": order lookups
"#;
        let config = parse_config(raw).unwrap();
        assert_eq!(config.analysis.duration, Duration::from_secs(6 * 3600));
        assert_eq!(config.analysis.offset, Duration::from_secs(1800));
        assert_eq!(config.thresholds.growth_min_span, Duration::from_secs(86_400));
        assert_eq!(config.thresholds.memory_total_bytes, 64 * 1024 * 1024 * 1024);
        assert_eq!(
            config.query_labels.get("/FROM orders/").map(String::as_str),
            Some("order lookups")
        );
    }

    #[test]
    fn dsn_in_yaml_is_rejected() {
        let config = parse_config("dsn: postgres://localhost/app").unwrap();
        assert!(enforce_yaml_policy(&config).is_err());
    }
}
