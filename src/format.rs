use anyhow::{Result, bail};

use crate::datasource::{Row, Value};

const KB: i64 = 1024;
const MB: i64 = 1024 * KB;
const GB: i64 = 1024 * MB;
const TB: i64 = 1024 * GB;

/// Render a byte count in the shorthand postgresql.conf accepts (`128kB`, `4GB`, ...).
/// Values that are not whole multiples of a unit fall back to the next smaller unit.
pub fn pretty_memory(bytes: i64) -> String {
    if bytes <= 0 {
        return bytes.to_string();
    }

    let lowest_bit = bytes.trailing_zeros();
    if lowest_bit < 10 {
        bytes.to_string()
    } else if lowest_bit < 20 {
        format!("{}kB", bytes >> 10)
    } else if lowest_bit < 30 {
        format!("{}MB", bytes >> 20)
    } else {
        format!("{}GB", bytes >> 30)
    }
}

pub fn clear_to_mb(bytes: i64) -> i64 {
    (bytes >> 20) << 20
}

pub fn clear_to_gb(bytes: i64) -> i64 {
    (bytes >> 30) << 30
}

/// Convert a `pg_settings` value and unit into bytes.
pub fn pg_units_to_bytes(value: i64, unit: &str) -> Result<i64> {
    let multiplier = match unit {
        "B" => 1,
        "kB" => KB,
        "8kB" => 8 * KB,
        "MB" => MB,
        "GB" => GB,
        other => bail!("unrecognised memory unit '{other}'"),
    };
    Ok(value * multiplier)
}

pub fn format_bytes(bytes: i64) -> String {
    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

pub fn format_number(n: i64) -> String {
    let s = n.unsigned_abs().to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    if n < 0 {
        result.push('-');
    }
    result.chars().rev().collect()
}

/// Tab separated dump of a result set with a header line, as printed by `query-rows`.
pub fn render_rows(rows: &[Row]) -> String {
    let Some(first) = rows.first() else {
        return String::new();
    };

    let mut out = first
        .columns()
        .iter()
        .map(|column| column.name.as_str())
        .collect::<Vec<_>>()
        .join("\t");
    out.push('\n');

    for row in rows {
        let line = row
            .values()
            .iter()
            .map(|value| quote_if_needed(&dump_value(value)))
            .collect::<Vec<_>>()
            .join("\t");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn dump_value(value: &Value) -> String {
    match value {
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::Timestamp(v) => v.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        other => other.to_string(),
    }
}

fn quote_if_needed(value: &str) -> String {
    if value.contains(['\t', ',', '"']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Double-quote a Postgres identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_memory_uses_largest_exact_unit() {
        assert_eq!(pretty_memory(128 * KB), "128kB");
        assert_eq!(pretty_memory(128 * MB), "128MB");
        assert_eq!(pretty_memory(128 * GB), "128GB");
        assert_eq!(pretty_memory(6533 * MB), "6533MB");
        assert_eq!(pretty_memory(12), "12");
        assert_eq!(pretty_memory(0), "0");
    }

    #[test]
    fn clearing_truncates_to_unit_boundary() {
        let value = 3 * GB + 5 * MB + 7 * KB + 3;
        assert_eq!(clear_to_mb(value), 3 * GB + 5 * MB);
        assert_eq!(clear_to_gb(value), 3 * GB);
    }

    #[test]
    fn pg_units_cover_settings_units() {
        assert_eq!(pg_units_to_bytes(16384, "8kB").unwrap(), 128 * MB);
        assert_eq!(pg_units_to_bytes(4096, "kB").unwrap(), 4 * MB);
        assert!(pg_units_to_bytes(1, "ms").is_err());
    }

    #[test]
    fn render_rows_quotes_awkward_values() {
        let rows = vec![Row::from_pairs([
            ("name", Value::from("a,b")),
            ("n", Value::Int(3)),
            ("ok", Value::Bool(true)),
            ("gone", Value::Null),
        ])];
        assert_eq!(
            render_rows(&rows),
            "name\tn\tok\tgone\n\"a,b\"\t3\t1\tNULL\n"
        );
    }

    #[test]
    fn format_number_groups_thousands() {
        assert_eq!(format_number(1_234_567), "1,234,567");
        assert_eq!(format_number(-4_200), "-4,200");
    }
}
