use std::{str::FromStr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column as _, PgPool, Postgres, Row as _, TypeInfo, ValueRef};
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::datasource::{Column, DataSource, Param, Row, Value};
use crate::format::quote_ident;

pub type DbPool = PgPool;

/// Build a pool for one database on the configured server. `database` overrides the
/// database named in the DSN.
pub async fn create_pool(config: &AppConfig, database: Option<&str>) -> Result<DbPool> {
    let mut connect_options = PgConnectOptions::from_str(&config.dsn)
        .context("invalid Postgres DSN supplied")?
        .application_name("pgscout")
        .options([
            (
                "statement_timeout",
                config.timeouts.statement_timeout_ms.to_string(),
            ),
            ("lock_timeout", config.timeouts.lock_timeout_ms.to_string()),
        ]);
    if let Some(database) = database {
        connect_options = connect_options.database(database);
    }

    let search_path = format!("SET search_path = {}, public", quote_ident(&config.schema));
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .after_connect(move |conn, _meta| {
            let search_path = search_path.clone();
            Box::pin(async move {
                sqlx::query(&search_path)
                    .execute(&mut *conn)
                    .await
                    .map_err(|err| {
                        error!(error = ?err, "failed to set search_path");
                        err
                    })?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await
        .with_context(|| {
            format!(
                "failed to connect to postgres database {}",
                database.unwrap_or(&config.database)
            )
        })?;

    info!(database = database.unwrap_or(&config.database), "connected");
    Ok(pool)
}

/// True when the error is Postgres reporting an unknown relation or object,
/// e.g. `pg_stat_statements` without the extension.
pub fn is_missing_relation(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db_err)) => db_err
            .code()
            .is_some_and(|code| code == "42P01" || code == "42704"),
        _ => false,
    }
}

/// `DataSource` backed by an sqlx pool.
#[derive(Clone)]
pub struct PgSource {
    pool: DbPool,
    database: String,
    schema: String,
}

impl PgSource {
    pub fn new(pool: DbPool, database: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            pool,
            database: database.into(),
            schema: schema.into(),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[Param],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Param::Text(value) => query.bind(value.clone()),
            Param::Int(value) => query.bind(*value),
            Param::Float(value) => query.bind(*value),
            Param::Timestamp(value) => query.bind(*value),
            Param::TextList(values) => query.bind(values.clone()),
            Param::IntList(values) => query.bind(values.clone()),
        };
    }
    query
}

fn decode_value(row: &PgRow, idx: usize, type_name: &str) -> Result<Value> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(Value::Null);
    }
    let value = match type_name {
        "BOOL" => Value::Bool(row.try_get(idx)?),
        "INT2" => Value::Int(i64::from(row.try_get::<i16, _>(idx)?)),
        "INT4" => Value::Int(i64::from(row.try_get::<i32, _>(idx)?)),
        "INT8" => Value::Int(row.try_get(idx)?),
        "OID" => Value::Int(i64::from(row.try_get::<sqlx::postgres::types::Oid, _>(idx)?.0)),
        "FLOAT4" => Value::Float(f64::from(row.try_get::<f32, _>(idx)?)),
        "FLOAT8" => Value::Float(row.try_get(idx)?),
        "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" => Value::Text(row.try_get(idx)?),
        "TIMESTAMPTZ" => Value::Timestamp(row.try_get::<DateTime<Utc>, _>(idx)?),
        "TIMESTAMP" => Value::Timestamp(row.try_get::<NaiveDateTime, _>(idx)?.and_utc()),
        other => Value::Unsupported(other.to_string()),
    };
    Ok(value)
}

fn convert_rows(rows: &[PgRow]) -> Result<Vec<Row>> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let columns: Arc<[Column]> = first
        .columns()
        .iter()
        .map(|column| Column {
            name: column.name().to_string(),
            type_name: column.type_info().name().to_string(),
        })
        .collect();

    rows.iter()
        .map(|row| {
            let values = columns
                .iter()
                .enumerate()
                .map(|(idx, column)| {
                    decode_value(row, idx, &column.type_name)
                        .with_context(|| format!("failed to decode column {}", column.name))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Row::new(columns.clone(), values))
        })
        .collect()
}

fn purpose(sql: &str) -> &str {
    sql.trim_start()
        .strip_prefix("/* pgscout:")
        .and_then(|rest| rest.split_once(" */"))
        .map_or("adhoc", |(purpose, _)| purpose)
}

impl DataSource for PgSource {
    async fn query_rows(&self, sql: &str, params: &[Param]) -> Result<Vec<Row>> {
        debug!(database = %self.database, purpose = purpose(sql), "query");
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("query {} failed", purpose(sql)))?;
        convert_rows(&rows)
    }

    async fn query_scalar(&self, sql: &str, params: &[Param]) -> Result<Value> {
        let rows = self.query_rows(sql, params).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.values().first().cloned())
            .unwrap_or(Value::Null))
    }

    async fn exec(&self, sql: &str, params: &[Param]) -> Result<u64> {
        debug!(database = %self.database, purpose = purpose(sql), "exec");
        let result = bind_params(sqlx::query(sql), params)
            .execute(&self.pool)
            .await
            .with_context(|| format!("statement {} failed", purpose(sql)))?;
        Ok(result.rows_affected())
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    fn schema(&self) -> &str {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purpose_tag_is_read_from_leading_comment() {
        assert_eq!(
            purpose("\n/* pgscout:table_growth */\nSELECT 1"),
            "table_growth"
        );
        assert_eq!(purpose("SELECT 1"), "adhoc");
    }

    #[test]
    fn non_database_errors_are_not_missing_relations() {
        let err = anyhow::anyhow!("boom");
        assert!(!is_missing_relation(&err));
    }
}
