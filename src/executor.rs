//! Executor seams between generated queries and the backing stores.
//!
//! Drivers live outside this crate; they plug in through [`SqlExecutor`] and
//! [`DocumentExecutor`]. [`LoggingExecutor`] is a dry run that records every
//! query and reports a match.

use crate::error::ExecutionError;
use crate::sql_translator::SqlStatement;
use async_trait::async_trait;
use serde_json::json;
use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Runs a SQL statement and returns the `count(*)` of every UNION branch.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn count_rows(&self, statement: &SqlStatement) -> Result<Vec<i64>, ExecutionError>;
}

/// Counts documents in one collection matching a filter.
#[async_trait]
pub trait DocumentExecutor: Send + Sync {
    async fn count(&self, collection: &str, filter: &serde_json::Value) -> Result<u64, ExecutionError>;
}

/// Caller-side cancellation and deadline for one decision.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The earlier of the caller deadline and `now + timeout`.
    pub fn deadline_within(&self, timeout: Duration) -> Instant {
        let local = Instant::now() + timeout;
        match self.deadline {
            Some(deadline) => deadline.min(local),
            None => local,
        }
    }
}

fn sql_value_to_json(value: &sea_query::Value) -> serde_json::Value {
    use sea_query::Value;
    match value {
        Value::Bool(Some(b)) => json!(b),
        Value::TinyInt(Some(i)) => json!(i),
        Value::SmallInt(Some(i)) => json!(i),
        Value::Int(Some(i)) => json!(i),
        Value::BigInt(Some(i)) => json!(i),
        Value::Float(Some(f)) => json!(f),
        Value::Double(Some(f)) => json!(f),
        Value::String(Some(s)) => json!(s.to_string()),
        _ => serde_json::Value::Null,
    }
}

/// Dry-run executor. Writes one JSON line per query when a log file is
/// configured, otherwise logs through `tracing`. Always allows.
#[derive(Debug)]
pub struct LoggingExecutor {
    alias: String,
    output: Option<Mutex<File>>,
}

impl LoggingExecutor {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            output: None,
        }
    }

    pub fn with_output(alias: impl Into<String>, path: &Path) -> Result<Self, ExecutionError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ExecutionError::Driver(format!("cannot open {}: {}", path.display(), e)))?;
        Ok(Self {
            alias: alias.into(),
            output: Some(Mutex::new(File::from_std(file))),
        })
    }

    async fn record(&self, entry: serde_json::Value) -> Result<(), ExecutionError> {
        match &self.output {
            Some(output) => {
                let mut file = output.lock().await;
                let line = format!("{}\n", entry);
                file.write_all(line.as_bytes())
                    .await
                    .map_err(|e| ExecutionError::Driver(format!("cannot write dry-run log: {}", e)))?;
                file.flush()
                    .await
                    .map_err(|e| ExecutionError::Driver(format!("cannot flush dry-run log: {}", e)))
            }
            None => {
                tracing::info!(alias = %self.alias, query = %entry, "dry run");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl SqlExecutor for LoggingExecutor {
    async fn count_rows(&self, statement: &SqlStatement) -> Result<Vec<i64>, ExecutionError> {
        let parameters: Vec<serde_json::Value> =
            statement.values.0.iter().map(sql_value_to_json).collect();
        self.record(json!({ "query": statement.text, "parameter": parameters }))
            .await?;
        Ok(vec![1])
    }
}

#[async_trait]
impl DocumentExecutor for LoggingExecutor {
    async fn count(&self, collection: &str, filter: &serde_json::Value) -> Result<u64, ExecutionError> {
        self.record(json!({ "collection": collection, "query": filter }))
            .await?;
        Ok(1)
    }
}
