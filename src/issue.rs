use std::fmt;

use serde::Serialize;

/// Fallback solution text for findings that have no mechanical fix.
pub const NO_SOLUTION: &str = "NONE proposed\n";

/// Severity level for detected issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding. `issue_type` is the sub-issue name (e.g. `IndexDuplicate`),
/// `target` the object it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub issue_type: String,
    pub target: String,
    pub severity: Severity,
    pub detail: String,
    pub solution: String,
}

impl Issue {
    pub fn new(
        issue_type: &str,
        target: impl Into<String>,
        severity: Severity,
        detail: impl Into<String>,
        solution: impl Into<String>,
    ) -> Self {
        Self {
            issue_type: issue_type.to_string(),
            target: target.into(),
            severity,
            detail: detail.into(),
            solution: solution.into(),
        }
    }

    /// Human-readable block used by the CLI; multi-line bodies are tab indented.
    pub fn dump(&self) -> String {
        format!(
            "ISSUE: {}\nSEVERITY: {}\nTARGET: {}\nDETAIL:\n{}SUGGESTION:\n{}",
            self.issue_type,
            self.severity,
            self.target,
            indent(&self.detail),
            indent(&self.solution)
        )
    }
}

fn indent(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for line in text.lines() {
        out.push('\t');
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_lists_every_field() {
        let issue = Issue::new(
            "IndexUnused",
            "public.orders_status_idx",
            Severity::High,
            "Table: public.orders\n",
            "DROP INDEX public.orders_status_idx;\n",
        );
        assert_eq!(
            issue.dump(),
            "ISSUE: IndexUnused\nSEVERITY: high\nTARGET: public.orders_status_idx\n\
             DETAIL:\n\tTable: public.orders\n\
             SUGGESTION:\n\tDROP INDEX public.orders_status_idx;\n"
        );
    }

    #[test]
    fn severity_serializes_lowercase() {
        let json = serde_json::to_string(&Severity::Medium).unwrap();
        assert_eq!(json, "\"medium\"");
    }
}
