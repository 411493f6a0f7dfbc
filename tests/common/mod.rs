#![allow(dead_code)]

use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use pgscout::app::AppContext;
use pgscout::config::AppConfig;
use pgscout::{DataSource, Param, Row, Value};

/// Canned answer for every statement containing all of a script entry's fragments.
#[derive(Debug, Clone)]
pub enum Reply {
    Rows(Vec<Row>),
    Scalar(Value),
    Fail(String),
}

/// In-memory `DataSource` answering from a script. First matching entry wins;
/// unscripted statements fail like a missing relation would.
pub struct ScriptedSource {
    database: String,
    schema: String,
    script: Vec<(Vec<&'static str>, Reply)>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            database: "appdb".to_string(),
            schema: "public".to_string(),
            script: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, fragments: &[&'static str], reply: Reply) -> Self {
        self.script.push((fragments.to_vec(), reply));
        self
    }

    pub fn rows(self, fragments: &[&'static str], rows: Vec<Row>) -> Self {
        self.on(fragments, Reply::Rows(rows))
    }

    pub fn scalar(self, fragments: &[&'static str], value: impl Into<Value>) -> Self {
        self.on(fragments, Reply::Scalar(value.into()))
    }

    /// Every statement seen so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, sql: &str) -> Result<Reply> {
        self.calls.lock().unwrap().push(sql.to_string());
        self.script
            .iter()
            .find(|(fragments, _)| fragments.iter().all(|fragment| sql.contains(fragment)))
            .map(|(_, reply)| reply.clone())
            .ok_or_else(|| anyhow!("unscripted statement: {sql}"))
    }
}

impl DataSource for ScriptedSource {
    async fn query_rows(&self, sql: &str, _params: &[Param]) -> Result<Vec<Row>> {
        match self.answer(sql)? {
            Reply::Rows(rows) => Ok(rows),
            Reply::Scalar(value) => Ok(vec![Row::from_pairs([("value", value)])]),
            Reply::Fail(message) => Err(anyhow!(message)),
        }
    }

    async fn query_scalar(&self, sql: &str, _params: &[Param]) -> Result<Value> {
        match self.answer(sql)? {
            Reply::Rows(rows) => Ok(rows
                .first()
                .and_then(|row| row.values().first().cloned())
                .unwrap_or(Value::Null)),
            Reply::Scalar(value) => Ok(value),
            Reply::Fail(message) => Err(anyhow!(message)),
        }
    }

    async fn exec(&self, sql: &str, _params: &[Param]) -> Result<u64> {
        match self.answer(sql) {
            Ok(Reply::Fail(message)) => Err(anyhow!(message)),
            Ok(_) => Ok(0),
            // Statements nobody scripted succeed; monitor tests only care about order.
            Err(_) => Ok(0),
        }
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    fn schema(&self) -> &str {
        &self.schema
    }
}

pub fn context() -> AppContext {
    AppContext::new(AppConfig::default())
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, day, hour, 0, 0).unwrap()
}

pub fn timestamps(series: &[DateTime<Utc>]) -> Vec<Row> {
    series
        .iter()
        .map(|captured| Row::from_pairs([("captured_at", Value::from(*captured))]))
        .collect()
}
