mod bloat;
mod duplicate;
mod overlap;
mod small;
mod unused;
mod usage;

pub use bloat::{IndexBloatEstimate, IndexBloatSample, estimate_index_bloat};
pub use duplicate::{DuplicateDrop, plan_duplicate_drops};
pub use overlap::{Overlap, plan_overlaps};
pub use small::{RowCountSplit, split_by_row_count};
pub use unused::{ScanHistory, UnusedCandidate, select_unused};
pub use usage::{UsageSample, classify_usage};

use anyhow::Result;
use tracing::instrument;

use super::{Findings, Scope};
use crate::app::AppContext;
use crate::datasource::{DataSource, Row};
use crate::format::format_bytes;

pub const DUPLICATE: &[&str] = &["IndexDuplicate"];
pub const SMALL: &[&str] = &["IndexSmall", "AnalyzeSuggested"];
pub const UNUSED: &[&str] = &["IndexUnused"];
pub const OVERLAPPING: &[&str] = &["IndexOverlapping"];
pub const BLOAT: &[&str] = &["IndexBloat"];
pub const USAGE: &[&str] = &[
    "IndexLowScansHighWrites",
    "IndexSeldomUsedLarge",
    "IndexHighWriteLargeNonBtree",
];

/// Every sub-issue the index family can report.
pub const ISSUES: &[&str] = &[
    "IndexDuplicate",
    "IndexSmall",
    "AnalyzeSuggested",
    "IndexUnused",
    "IndexOverlapping",
    "IndexBloat",
    "IndexLowScansHighWrites",
    "IndexSeldomUsedLarge",
    "IndexHighWriteLargeNonBtree",
];

const DETECTOR: &str = "IndexIssues";

/// Column separator used when catalog queries flatten an index's key columns.
const COLUMN_SEPARATOR: char = '\u{1f}';

/// Index metadata as the detectors need it, rebuilt from the catalog on every run.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDescriptor {
    /// Table name as `regclass` renders it (schema-qualified when off the search path).
    pub table: String,
    pub table_relname: String,
    /// Index name as `regclass` renders it; safe to paste into DDL.
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub bytes: i64,
    pub size: String,
    pub scans: i64,
    pub definition: String,
}

impl IndexDescriptor {
    /// Only the three name columns are required; each query selects what its check needs.
    fn from_row(row: &Row) -> Result<Self> {
        let bytes = if_present(row, "index_bytes", Row::opt_int)?.unwrap_or(0);
        let size = if_present(row, "index_size", Row::opt_text)?;

        Ok(Self {
            table: row.text("table_name")?,
            table_relname: row.text("table_relname")?,
            name: row.text("index_name")?,
            columns: if_present(row, "columns", Row::opt_text)?
                .map(|raw| split_columns(&raw))
                .unwrap_or_default(),
            unique: if_present(row, "is_unique", |row, name| row.bool(name).map(Some))?
                .unwrap_or(false),
            bytes,
            size: size.unwrap_or_else(|| format_bytes(bytes)),
            scans: if_present(row, "idx_scan", Row::opt_int)?.unwrap_or(0),
            definition: if_present(row, "definition", Row::opt_text)?.unwrap_or_default(),
        })
    }
}

fn if_present<T>(
    row: &Row,
    name: &str,
    read: impl FnOnce(&Row, &str) -> Result<Option<T>>,
) -> Result<Option<T>> {
    if row.get(name).is_some() {
        read(row, name)
    } else {
        Ok(None)
    }
}

fn split_columns(raw: &str) -> Vec<String> {
    raw.split(COLUMN_SEPARATOR)
        .filter(|column| !column.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn drop_statement(index_name: &str) -> String {
    format!("DROP INDEX {index_name};\n")
}

/// Run every index check the scope allows, in a fixed order.
#[instrument(skip_all, fields(database = source.database_name()))]
pub async fn run<D: DataSource>(
    ctx: &AppContext,
    source: &D,
    scope: &Scope,
    findings: &mut Findings,
) {
    if scope.wants_any(DUPLICATE) {
        duplicate::detect(source, scope, findings).await;
    }
    if scope.wants_any(SMALL) {
        small::detect(ctx, source, scope, findings).await;
    }
    if scope.wants_any(UNUSED) {
        unused::detect(source, scope, findings).await;
    }
    if scope.wants_any(OVERLAPPING) {
        overlap::detect(ctx, source, scope, findings).await;
    }
    if scope.wants_any(BLOAT) {
        bloat::detect(ctx, source, scope, findings).await;
    }
    if scope.wants_any(USAGE) {
        usage::detect(ctx, source, scope, findings).await;
    }
}

/// Names of the unused indexes on one table. Warnings from this nested run are dropped.
pub async fn unused_index_names<D: DataSource>(source: &D, table_relname: &str) -> Vec<String> {
    let mut scratch = Findings::default();
    let scope = Scope::family(UNUSED, Some(table_relname));
    unused::detect(source, &scope, &mut scratch).await;
    scratch.issues.into_iter().map(|issue| issue.target).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::Value;

    #[test]
    fn descriptor_reads_optional_columns() {
        let row = Row::from_pairs([
            ("table_name", Value::from("public.orders")),
            ("table_relname", Value::from("orders")),
            ("index_name", Value::from("orders_customer_idx")),
            ("columns", Value::from("customer_id\u{1f}created_at")),
            ("is_unique", Value::Bool(false)),
            ("index_bytes", Value::Int(2048)),
            ("definition", Value::from("CREATE INDEX ...")),
        ]);
        let index = IndexDescriptor::from_row(&row).unwrap();
        assert_eq!(index.columns, vec!["customer_id", "created_at"]);
        assert_eq!(index.size, "2.00 KB");
        assert_eq!(index.scans, 0);
    }
}
