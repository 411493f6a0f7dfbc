use std::collections::BTreeMap;

use anyhow::Result;

use super::{DETECTOR, IndexDescriptor, drop_statement};
use crate::datasource::DataSource;
use crate::detectors::{Findings, Scope, log_query_failure};
use crate::format::format_bytes;
use crate::issue::{Issue, Severity};

// Structural key: opclasses, key columns, expressions, predicate.
const DUPLICATE_SQL: &str = r#"
/* pgscout:duplicate_indexes */
SELECT
    i.indrelid::regclass::text AS table_name,
    c.relname::text AS table_relname,
    i.indexrelid::regclass::text AS index_name,
    i.indisunique AS is_unique,
    pg_relation_size(i.indexrelid) AS index_bytes,
    pg_get_indexdef(i.indexrelid) AS definition,
    i.indclass::text || E'\n' || i.indkey::text || E'\n' ||
        coalesce(i.indexprs::text, '') || E'\n' || coalesce(i.indpred::text, '') AS structural_key
FROM pg_catalog.pg_index i
JOIN pg_catalog.pg_class c ON c.oid = i.indrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
  AND n.nspname !~ '^pg_toast'
ORDER BY table_name, index_name
"#;

/// One proposed drop from a duplicate group.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateDrop {
    pub keep: IndexDescriptor,
    pub drop: IndexDescriptor,
    /// Every member of the group, kept index first.
    pub group: Vec<String>,
    pub group_bytes: i64,
}

/// Group indexes by table and structural key. In each group of two or more the
/// keeper is a unique index if there is one, otherwise the smallest name; every
/// other member is proposed for removal.
pub fn plan_duplicate_drops(candidates: Vec<(String, IndexDescriptor)>) -> Vec<DuplicateDrop> {
    let mut groups: BTreeMap<(String, String), Vec<IndexDescriptor>> = BTreeMap::new();
    for (key, index) in candidates {
        groups
            .entry((index.table.clone(), key))
            .or_default()
            .push(index);
    }

    let mut drops = Vec::new();
    for mut members in groups.into_values().filter(|members| members.len() > 1) {
        members.sort_by(|a, b| b.unique.cmp(&a.unique).then_with(|| a.name.cmp(&b.name)));
        let group: Vec<String> = members.iter().map(|index| index.name.clone()).collect();
        let group_bytes = members.iter().map(|index| index.bytes).sum();
        let mut members = members.into_iter();
        let Some(keep) = members.next() else {
            continue;
        };
        for drop in members {
            drops.push(DuplicateDrop {
                keep: keep.clone(),
                drop,
                group: group.clone(),
                group_bytes,
            });
        }
    }
    drops
}

pub(super) async fn detect<D: DataSource>(source: &D, scope: &Scope, findings: &mut Findings) {
    let candidates = match load_candidates(source, scope).await {
        Ok(candidates) => candidates,
        Err(err) => {
            log_query_failure(DETECTOR, "duplicate_indexes", source.database_name(), &err);
            return;
        }
    };

    for planned in plan_duplicate_drops(candidates) {
        let detail = format!(
            "Table: {}, Index Size: {}, Duplicate indexes ({})\nKept Index: '{}'\nDropped Index: '{}'\n",
            planned.keep.table,
            format_bytes(planned.group_bytes),
            planned.group.join(", "),
            planned.keep.definition,
            planned.drop.definition,
        );
        findings.push(Issue::new(
            "IndexDuplicate",
            planned.drop.name.clone(),
            Severity::High,
            detail,
            drop_statement(&planned.drop.name),
        ));
    }
}

async fn load_candidates<D: DataSource>(
    source: &D,
    scope: &Scope,
) -> Result<Vec<(String, IndexDescriptor)>> {
    let rows = source.query_rows(DUPLICATE_SQL, &[]).await?;
    let mut candidates = Vec::with_capacity(rows.len());
    for row in &rows {
        let index = IndexDescriptor::from_row(row)?;
        if scope.covers_table(&index.table_relname) {
            candidates.push((row.text("structural_key")?, index));
        }
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(name: &str, unique: bool) -> IndexDescriptor {
        IndexDescriptor {
            table: "public.orders".into(),
            table_relname: "orders".into(),
            name: name.into(),
            columns: vec!["customer_id".into()],
            unique,
            bytes: 8192,
            size: "8192 bytes".into(),
            scans: 0,
            definition: format!("CREATE INDEX {name} ON public.orders (customer_id)"),
        }
    }

    #[test]
    fn unique_member_is_always_kept() {
        for order in [["a_plain", "z_unique"], ["z_unique", "a_plain"]] {
            let candidates = order
                .iter()
                .map(|name| ("k1".to_string(), index(name, *name == "z_unique")))
                .collect();
            let drops = plan_duplicate_drops(candidates);
            assert_eq!(drops.len(), 1);
            assert_eq!(drops[0].keep.name, "z_unique");
            assert_eq!(drops[0].drop.name, "a_plain");
        }
    }

    #[test]
    fn non_unique_tie_keeps_smallest_name_and_drops_the_rest() {
        let candidates = vec![
            ("k1".to_string(), index("orders_c", false)),
            ("k1".to_string(), index("orders_a", false)),
            ("k1".to_string(), index("orders_b", false)),
            ("k2".to_string(), index("orders_other", false)),
        ];
        let drops = plan_duplicate_drops(candidates);
        let dropped: Vec<&str> = drops.iter().map(|d| d.drop.name.as_str()).collect();
        assert_eq!(dropped, vec!["orders_b", "orders_c"]);
        assert!(drops.iter().all(|d| d.keep.name == "orders_a"));
        assert_eq!(drops[0].group, vec!["orders_a", "orders_b", "orders_c"]);
        assert_eq!(drops[0].group_bytes, 3 * 8192);
    }

    #[test]
    fn same_key_on_different_tables_is_not_a_duplicate() {
        let mut other = index("customers_idx", false);
        other.table = "public.customers".into();
        let candidates = vec![
            ("k1".to_string(), index("orders_idx", false)),
            ("k1".to_string(), other),
        ];
        assert!(plan_duplicate_drops(candidates).is_empty());
    }
}
