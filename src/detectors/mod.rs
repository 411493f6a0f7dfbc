pub mod config;
pub mod index;
pub mod query;
pub mod table;

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::app::AppContext;
use crate::datasource::DataSource;
use crate::error::EngineError;
use crate::issue::Issue;

/// Every detector the engine can run, addressable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorKind {
    All,
    Help,
    IndexIssues,
    TableIssues,
    ConfigIssues,
    QueryIssues,
    DuplicateIndexes,
    UnusedIndexes,
    SmallIndexes,
    OverlappingIndexes,
    IndexBloat,
    IndexUsage,
    TableBloat,
    TableGrowth,
}

impl DetectorKind {
    pub const REGISTRY: [DetectorKind; 14] = [
        DetectorKind::All,
        DetectorKind::Help,
        DetectorKind::IndexIssues,
        DetectorKind::TableIssues,
        DetectorKind::ConfigIssues,
        DetectorKind::QueryIssues,
        DetectorKind::DuplicateIndexes,
        DetectorKind::UnusedIndexes,
        DetectorKind::SmallIndexes,
        DetectorKind::OverlappingIndexes,
        DetectorKind::IndexBloat,
        DetectorKind::IndexUsage,
        DetectorKind::TableBloat,
        DetectorKind::TableGrowth,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DetectorKind::All => "All",
            DetectorKind::Help => "Help",
            DetectorKind::IndexIssues => "IndexIssues",
            DetectorKind::TableIssues => "TableIssues",
            DetectorKind::ConfigIssues => "ConfigIssues",
            DetectorKind::QueryIssues => "QueryIssues",
            DetectorKind::DuplicateIndexes => "DuplicateIndexes",
            DetectorKind::UnusedIndexes => "UnusedIndexes",
            DetectorKind::SmallIndexes => "SmallIndexes",
            DetectorKind::OverlappingIndexes => "OverlappingIndexes",
            DetectorKind::IndexBloat => "IndexBloat",
            DetectorKind::IndexUsage => "IndexUsage",
            DetectorKind::TableBloat => "TableBloat",
            DetectorKind::TableGrowth => "TableGrowth",
        }
    }

    pub fn help_text(self) -> &'static str {
        match self {
            DetectorKind::All => "Run table, index, config and query detectors in turn",
            DetectorKind::Help => "List the available detectors",
            DetectorKind::IndexIssues => {
                "Analyze indexes for issues; optional arg: sub-issue name or table"
            }
            DetectorKind::TableIssues => {
                "Analyze tables for issues; optional arg: sub-issue name or table"
            }
            DetectorKind::ConfigIssues => "Compare memory and connection settings to targets",
            DetectorKind::QueryIssues => {
                "Report queries with significant impact on the system over the window"
            }
            DetectorKind::DuplicateIndexes => "Indexes structurally identical to another",
            DetectorKind::UnusedIndexes => "Indexes never scanned across the snapshot history",
            DetectorKind::SmallIndexes => "Scanned indexes on tiny tables; stale table stats",
            DetectorKind::OverlappingIndexes => "Indexes whose columns prefix a wider index",
            DetectorKind::IndexBloat => "B-tree indexes with estimated waste over threshold",
            DetectorKind::IndexUsage => "Indexes costing more in writes than they save in reads",
            DetectorKind::TableBloat => "Tables with estimated heap waste over threshold",
            DetectorKind::TableGrowth => "Fast growing tables and large unpartitioned tables",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DetectorKind {
    type Err = EngineError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::REGISTRY
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| EngineError::UnknownDetector(name.to_string()))
    }
}

/// Registry listing printed for `Help`.
pub fn help_listing() -> String {
    DetectorKind::REGISTRY
        .iter()
        .map(|kind| format!("{:<20}{}\n", kind.name(), kind.help_text()))
        .collect()
}

/// Routines `All` runs, in order. Resolved by name so a bad entry is logged, not fatal.
const ALL_ROUTINES: [&str; 4] = ["TableIssues", "IndexIssues", "ConfigIssues", "QueryIssues"];

/// Accumulator threaded through one detector run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Findings {
    pub issues: Vec<Issue>,
    /// Insufficient-data notes for the operator; never issues.
    pub warnings: Vec<String>,
}

impl Findings {
    pub fn push(&mut self, issue: Issue) {
        self.issues.push(issue);
    }

    pub fn warn(&mut self, detector: &str, database: &str, message: String) {
        warn!(detector, database, "{message}");
        self.warnings.push(message);
    }

    pub fn extend(&mut self, other: Findings) {
        self.issues.extend(other.issues);
        self.warnings.extend(other.warnings);
    }
}

/// Narrows a detector run to some sub-issues and/or a single table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    issues: Option<&'static [&'static str]>,
    table: Option<String>,
}

impl Scope {
    /// An argument naming one of `known` selects that sub-issue; anything else is a table.
    pub fn parse(arg: Option<&str>, known: &'static [&'static str]) -> Self {
        let Some(arg) = arg else {
            return Self::default();
        };
        match known.iter().position(|issue| *issue == arg) {
            Some(idx) => Self {
                issues: Some(&known[idx..=idx]),
                table: None,
            },
            None => Self {
                issues: None,
                table: Some(arg.to_string()),
            },
        }
    }

    /// A fixed family of sub-issues, optionally limited to one table.
    pub fn family(issues: &'static [&'static str], table: Option<&str>) -> Self {
        Self {
            issues: Some(issues),
            table: table.map(str::to_string),
        }
    }

    pub fn wants(&self, issue: &str) -> bool {
        self.issues.is_none_or(|list| list.contains(&issue))
    }

    pub fn wants_any(&self, issues: &[&str]) -> bool {
        issues.iter().any(|issue| self.wants(issue))
    }

    pub fn covers_table(&self, relname: &str) -> bool {
        self.table.as_deref().is_none_or(|table| table == relname)
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }
}

pub(crate) fn log_query_failure(
    detector: &str,
    purpose: &str,
    database: &str,
    err: &anyhow::Error,
) {
    error!(detector, purpose, database, error = ?err, "query failed");
}

/// True when `err` is the resolver reporting an empty snapshot series.
pub(crate) fn is_insufficient_history(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::InsufficientHistory { .. })
    )
}

/// One detector bound to a context and a data source. Each `execute` replaces the
/// previous run's findings.
pub struct Detector<'a, D> {
    kind: DetectorKind,
    ctx: &'a AppContext,
    source: &'a D,
    findings: Findings,
    duration: Duration,
}

impl<'a, D: DataSource> Detector<'a, D> {
    pub fn init(kind: DetectorKind, ctx: &'a AppContext, source: &'a D) -> Self {
        Self {
            kind,
            ctx,
            source,
            findings: Findings::default(),
            duration: Duration::ZERO,
        }
    }

    pub fn by_name(name: &str, ctx: &'a AppContext, source: &'a D) -> Result<Self, EngineError> {
        let kind = name.parse()?;
        Ok(Self::init(kind, ctx, source))
    }

    pub fn kind(&self) -> DetectorKind {
        self.kind
    }

    #[instrument(skip_all, fields(detector = %self.kind, database = self.source.database_name()))]
    pub async fn execute(&mut self, arg: Option<&str>) {
        let started = Instant::now();
        let mut findings = Findings::default();

        match self.kind {
            DetectorKind::All => run_all(self.ctx, self.source, &mut findings).await,
            DetectorKind::Help => debug!("help requested; nothing to analyze"),
            kind => {
                if let Err(err) = run_leaf(kind, self.ctx, self.source, arg, &mut findings).await {
                    error!(error = %err, "detector could not run");
                }
            }
        }

        self.findings = findings;
        self.duration = started.elapsed();
        info!(
            issues = self.findings.issues.len(),
            warnings = self.findings.warnings.len(),
            elapsed_ms = self.duration_ms(),
            "detector finished"
        );
    }

    pub fn issues(&self) -> &[Issue] {
        &self.findings.issues
    }

    pub fn warnings(&self) -> &[String] {
        &self.findings.warnings
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn duration_ms(&self) -> i64 {
        i64::try_from(self.duration.as_millis()).unwrap_or(i64::MAX)
    }
}

async fn run_all<D: DataSource>(ctx: &AppContext, source: &D, findings: &mut Findings) {
    for routine in ALL_ROUTINES {
        let kind = match routine.parse::<DetectorKind>() {
            Ok(kind) => kind,
            Err(err) => {
                error!(routine, error = %err, "skipping routine");
                continue;
            }
        };
        if let Err(err) = run_leaf(kind, ctx, source, None, findings).await {
            error!(routine, error = %err, "skipping routine");
        }
    }
}

/// Dispatch a single non-composite detector.
async fn run_leaf<D: DataSource>(
    kind: DetectorKind,
    ctx: &AppContext,
    source: &D,
    arg: Option<&str>,
    findings: &mut Findings,
) -> Result<(), EngineError> {
    match kind {
        DetectorKind::All | DetectorKind::Help => {
            return Err(EngineError::NotSelectable(kind.name()));
        }
        DetectorKind::IndexIssues => {
            index::run(ctx, source, &Scope::parse(arg, index::ISSUES), findings).await
        }
        DetectorKind::TableIssues => {
            table::run(ctx, source, &Scope::parse(arg, table::ISSUES), findings).await
        }
        DetectorKind::ConfigIssues => config::run(ctx, source, findings).await,
        DetectorKind::QueryIssues => query::run(ctx, source, findings).await,
        DetectorKind::DuplicateIndexes => {
            index::run(ctx, source, &Scope::family(index::DUPLICATE, arg), findings).await
        }
        DetectorKind::UnusedIndexes => {
            index::run(ctx, source, &Scope::family(index::UNUSED, arg), findings).await
        }
        DetectorKind::SmallIndexes => {
            index::run(ctx, source, &Scope::family(index::SMALL, arg), findings).await
        }
        DetectorKind::OverlappingIndexes => {
            index::run(ctx, source, &Scope::family(index::OVERLAPPING, arg), findings).await
        }
        DetectorKind::IndexBloat => {
            index::run(ctx, source, &Scope::family(index::BLOAT, arg), findings).await
        }
        DetectorKind::IndexUsage => {
            index::run(ctx, source, &Scope::family(index::USAGE, arg), findings).await
        }
        DetectorKind::TableBloat => {
            table::run(ctx, source, &Scope::family(table::BLOAT, arg), findings).await
        }
        DetectorKind::TableGrowth => {
            table::run(ctx, source, &Scope::family(table::GROWTH, arg), findings).await
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_names_round_trip_and_unknown_is_named_error() {
        for kind in DetectorKind::REGISTRY {
            assert_eq!(kind.name().parse::<DetectorKind>().unwrap(), kind);
        }
        let err = "IndexMagic".parse::<DetectorKind>().unwrap_err();
        assert!(matches!(err, EngineError::UnknownDetector(name) if name == "IndexMagic"));
    }

    #[test]
    fn all_routines_resolve() {
        for routine in ALL_ROUTINES {
            assert!(routine.parse::<DetectorKind>().is_ok(), "{routine}");
        }
    }

    #[test]
    fn scope_argument_selects_issue_or_table() {
        let issue = Scope::parse(Some("IndexBloat"), index::ISSUES);
        assert!(issue.wants("IndexBloat"));
        assert!(!issue.wants("IndexDuplicate"));
        assert!(issue.covers_table("orders"));

        let table = Scope::parse(Some("orders"), index::ISSUES);
        assert!(table.wants("IndexDuplicate"));
        assert!(table.covers_table("orders"));
        assert!(!table.covers_table("customers"));

        let family = Scope::family(index::SMALL, None);
        assert!(family.wants("AnalyzeSuggested"));
        assert!(!family.wants("IndexUnused"));
    }

    #[test]
    fn help_lists_every_detector() {
        let listing = help_listing();
        assert_eq!(listing.lines().count(), DetectorKind::REGISTRY.len());
        assert!(listing.contains("QueryIssues"));
    }
}
