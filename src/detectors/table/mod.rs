mod bloat;
mod growth;

pub use bloat::{TableBloatEstimate, TableBloatSample, estimate_table_bloat};
pub use growth::{GrowthSample, GrowthVerdict, judge_growth};

use tracing::instrument;

use super::{Findings, Scope};
use crate::app::AppContext;
use crate::datasource::DataSource;

pub const BLOAT: &[&str] = &["TableBloat"];
pub const GROWTH: &[&str] = &["TableGrowth", "TableSizeLarge"];

/// Every sub-issue the table family can report.
pub const ISSUES: &[&str] = &["TableBloat", "TableGrowth", "TableSizeLarge"];

const DETECTOR: &str = "TableIssues";

pub(crate) const REVIEW_TABLE: &str = "REVIEW table - consider partitioning and/or pruning\n";

/// Bloat first, then growth and size from the snapshot history.
#[instrument(skip_all, fields(database = source.database_name()))]
pub async fn run<D: DataSource>(
    ctx: &AppContext,
    source: &D,
    scope: &Scope,
    findings: &mut Findings,
) {
    if scope.wants_any(BLOAT) {
        bloat::detect(ctx, source, scope, findings).await;
    }
    if scope.wants_any(GROWTH) {
        growth::detect(ctx, source, scope, findings).await;
    }
}
