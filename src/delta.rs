use std::collections::BTreeMap;

use anyhow::Result;

use crate::datasource::Row;

/// Named counters for one entity at one snapshot.
pub type Counters = BTreeMap<&'static str, f64>;

/// Counter differences for one entity across a window.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaRecord {
    pub counters: Counters,
    /// The entity had no row at the window start; counters carry the full end values.
    pub newly_observed: bool,
}

impl DeltaRecord {
    pub fn get(&self, counter: &str) -> f64 {
        self.counters.get(counter).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Deltas<K> {
    pub records: BTreeMap<K, DeltaRecord>,
    /// Entities seen at the start but gone at the end.
    pub vanished: usize,
}

impl<K> Deltas<K> {
    pub fn newly_observed(&self) -> impl Iterator<Item = (&K, &DeltaRecord)> {
        self.records.iter().filter(|(_, record)| record.newly_observed)
    }
}

/// `end - start` per entity and counter. Decreases are reported as negative values.
pub fn compute_deltas<K: Ord + Clone>(
    start: &BTreeMap<K, Counters>,
    end: &BTreeMap<K, Counters>,
) -> Deltas<K> {
    let records = end
        .iter()
        .map(|(key, end_counters)| {
            let record = match start.get(key) {
                Some(start_counters) => DeltaRecord {
                    counters: end_counters
                        .iter()
                        .map(|(name, value)| {
                            let base = start_counters.get(name).copied().unwrap_or(0.0);
                            (*name, value - base)
                        })
                        .collect(),
                    newly_observed: false,
                },
                None => DeltaRecord {
                    counters: end_counters.clone(),
                    newly_observed: true,
                },
            };
            (key.clone(), record)
        })
        .collect();

    let vanished = start.keys().filter(|key| !end.contains_key(*key)).count();

    Deltas { records, vanished }
}

/// Collect the named counter columns of each row, keyed by `key`.
pub fn counters_from_rows<K, F>(
    rows: &[Row],
    counter_columns: &[&'static str],
    key: F,
) -> Result<BTreeMap<K, Counters>>
where
    K: Ord,
    F: Fn(&Row) -> Result<K>,
{
    let mut out = BTreeMap::new();
    for row in rows {
        let mut counters = Counters::new();
        for column in counter_columns {
            counters.insert(*column, row.opt_float(column)?.unwrap_or(0.0));
        }
        out.insert(key(row)?, counters);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(calls: f64, time: f64) -> Counters {
        Counters::from([("calls", calls), ("total_exec_time", time)])
    }

    #[test]
    fn delta_is_exact_difference_including_negative() {
        let start = BTreeMap::from([(1, counters(10.0, 100.0)), (2, counters(50.0, 900.0))]);
        let end = BTreeMap::from([(1, counters(15.0, 160.5)), (2, counters(5.0, 20.0))]);

        let deltas = compute_deltas(&start, &end);
        let first = &deltas.records[&1];
        assert_eq!(first.get("calls"), 5.0);
        assert_eq!(first.get("total_exec_time"), 60.5);
        assert!(!first.newly_observed);

        let reset = &deltas.records[&2];
        assert_eq!(reset.get("calls"), -45.0);
        assert_eq!(reset.get("total_exec_time"), -880.0);
    }

    #[test]
    fn end_only_entities_are_new_and_start_only_are_dropped() {
        let start = BTreeMap::from([(1, counters(1.0, 1.0)), (9, counters(4.0, 4.0))]);
        let end = BTreeMap::from([(1, counters(2.0, 2.0)), (7, counters(3.0, 30.0))]);

        let deltas = compute_deltas(&start, &end);
        assert_eq!(deltas.records.len(), 2);
        assert!(!deltas.records.contains_key(&9));
        assert_eq!(deltas.vanished, 1);

        let fresh = &deltas.records[&7];
        assert!(fresh.newly_observed);
        assert_eq!(fresh.get("total_exec_time"), 30.0);
        assert_eq!(deltas.newly_observed().count(), 1);
    }
}
