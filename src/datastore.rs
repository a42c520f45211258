//! A configured datastore: translator plus executor, reduced to allow/deny.

use crate::ast::Union;
use crate::config::{AppConfig, DatastoreType};
use crate::error::{ConfigError, Error, ExecutionError, TranslationError};
use crate::executor::{DocumentExecutor, ExecutionContext, LoggingExecutor, SqlExecutor};
use crate::mongo_translator::{DocumentQuery, MongoTranslator};
use crate::sql_translator::{SqlStatement, SqlTranslator};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};

pub use crate::config::DEFAULT_QUERY_TIMEOUT;

/// Lowers a Query-AST into a backend's native query.
pub trait DatastoreTranslator {
    type Output;

    fn translate(&self, query: &Union) -> Result<Self::Output, TranslationError>;
}

/// A translated query, ready to execute.
#[derive(Debug, Clone)]
pub enum DatastoreQuery {
    Sql(SqlStatement),
    Documents(DocumentQuery),
}

impl fmt::Display for DatastoreQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatastoreQuery::Sql(statement) => write!(f, "{}", statement),
            DatastoreQuery::Documents(query) => write!(f, "{}", query),
        }
    }
}

enum Backend {
    Sql {
        translator: SqlTranslator,
        executor: Arc<dyn SqlExecutor>,
    },
    Document {
        translator: MongoTranslator,
        executor: Arc<dyn DocumentExecutor>,
    },
}

/// Executor choice when building datastores from configuration.
#[derive(Clone)]
pub enum ExecutorHandle {
    Sql(Arc<dyn SqlExecutor>),
    Document(Arc<dyn DocumentExecutor>),
    /// dry run, see [`LoggingExecutor`]
    Logging,
}

pub struct Datastore {
    alias: String,
    backend: Backend,
    query_timeout: Duration,
}

impl fmt::Debug for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.backend {
            Backend::Sql { .. } => "sql",
            Backend::Document { .. } => "document",
        };
        f.debug_struct("Datastore")
            .field("alias", &self.alias)
            .field("backend", &kind)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl Datastore {
    pub fn sql(alias: impl Into<String>, translator: SqlTranslator, executor: Arc<dyn SqlExecutor>) -> Self {
        Self {
            alias: alias.into(),
            backend: Backend::Sql {
                translator,
                executor,
            },
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn document(
        alias: impl Into<String>,
        translator: MongoTranslator,
        executor: Arc<dyn DocumentExecutor>,
    ) -> Self {
        Self {
            alias: alias.into(),
            backend: Backend::Document {
                translator,
                executor,
            },
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn from_config(config: &AppConfig, alias: &str, executor: ExecutorHandle) -> Result<Self, ConfigError> {
        let datastore_config = config.datastore(alias)?;
        let mismatch = |expected| ConfigError::WrongDatastoreType {
            alias: alias.to_string(),
            kind: datastore_config.kind.to_string(),
            expected,
        };

        let datastore = match (datastore_config.kind, executor) {
            (DatastoreType::Mongo, ExecutorHandle::Document(executor)) => {
                Self::document(alias, MongoTranslator::from_config(config, alias)?, executor)
            }
            (DatastoreType::Mongo, ExecutorHandle::Logging) => Self::document(
                alias,
                MongoTranslator::from_config(config, alias)?,
                Arc::new(dry_run_executor(alias, datastore_config.dry_run_log.as_deref())),
            ),
            (DatastoreType::Mongo, ExecutorHandle::Sql(_)) => {
                return Err(mismatch("a target for a sql executor"))
            }
            (_, ExecutorHandle::Sql(executor)) => {
                Self::sql(alias, SqlTranslator::from_config(config, alias)?, executor)
            }
            (_, ExecutorHandle::Logging) => Self::sql(
                alias,
                SqlTranslator::from_config(config, alias)?,
                Arc::new(dry_run_executor(alias, datastore_config.dry_run_log.as_deref())),
            ),
            (_, ExecutorHandle::Document(_)) => {
                return Err(mismatch("a target for a document executor"))
            }
        };
        Ok(datastore.with_query_timeout(datastore_config.query_timeout()))
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn translate(&self, query: &Union) -> Result<DatastoreQuery, TranslationError> {
        match &self.backend {
            Backend::Sql { translator, .. } => translator.translate(query).map(DatastoreQuery::Sql),
            Backend::Document { translator, .. } => {
                translator.translate(query).map(DatastoreQuery::Documents)
            }
        }
    }

    /// Translates and executes; `true` if any branch matched.
    pub async fn run(&self, ctx: &ExecutionContext, query: &Union) -> Result<bool, Error> {
        let native = self.translate(query)?;
        Ok(self.execute(ctx, &native).await?)
    }

    pub async fn execute(&self, ctx: &ExecutionContext, query: &DatastoreQuery) -> Result<bool, ExecutionError> {
        let deadline = ctx.deadline_within(self.query_timeout);
        let allowed = match (&self.backend, query) {
            (Backend::Sql { executor, .. }, DatastoreQuery::Sql(statement)) => {
                self.execute_sql(ctx, deadline, executor.as_ref(), statement).await?
            }
            (Backend::Document { executor, .. }, DatastoreQuery::Documents(documents)) => {
                self.execute_documents(ctx, deadline, executor, documents).await?
            }
            _ => {
                return Err(ExecutionError::Driver(format!(
                    "query kind does not match datastore `{}`",
                    self.alias
                )))
            }
        };
        tracing::debug!(alias = %self.alias, allowed, "{}", if allowed { "ALLOWED" } else { "DENIED" });
        Ok(allowed)
    }

    async fn execute_sql(
        &self,
        ctx: &ExecutionContext,
        deadline: Instant,
        executor: &dyn SqlExecutor,
        statement: &SqlStatement,
    ) -> Result<bool, ExecutionError> {
        tracing::debug!(alias = %self.alias, statement = %statement.text, "executing statement");
        let counts = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(ExecutionError::Cancelled(self.alias.clone())),
            result = timeout_at(deadline, executor.count_rows(statement)) => match result {
                Ok(counts) => counts?,
                Err(_) => return Err(ExecutionError::Timeout(self.alias.clone())),
            },
        };
        tracing::debug!(alias = %self.alias, ?counts, "received results");
        Ok(counts.iter().any(|count| *count > 0))
    }

    /// One task per collection. All tasks are awaited; the first failure
    /// aborts the rest.
    async fn execute_documents(
        &self,
        ctx: &ExecutionContext,
        deadline: Instant,
        executor: &Arc<dyn DocumentExecutor>,
        query: &DocumentQuery,
    ) -> Result<bool, ExecutionError> {
        let mut tasks = JoinSet::new();
        for (collection, filter) in &query.filters {
            let filter: serde_json::Value =
                serde_json::from_str(filter).map_err(|source| ExecutionError::InvalidFilter {
                    collection: collection.clone(),
                    source,
                })?;
            tracing::debug!(alias = %self.alias, collection = %collection, filter = %filter, "executing filter");

            let executor = Arc::clone(executor);
            let collection = collection.clone();
            let alias = self.alias.clone();
            tasks.spawn(async move {
                match timeout_at(deadline, executor.count(&collection, &filter)).await {
                    Ok(count) => count.map(|count| (collection, count)),
                    Err(_) => Err(ExecutionError::Timeout(alias)),
                }
            });
        }

        let mut allowed = false;
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(ExecutionError::Cancelled(self.alias.clone()));
                }
                next = tasks.join_next() => match next {
                    None => break,
                    Some(Ok(Ok((collection, count)))) => {
                        tracing::debug!(alias = %self.alias, collection = %collection, count, "received count");
                        allowed |= count > 0;
                    }
                    Some(Ok(Err(e))) => {
                        tasks.abort_all();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        tasks.abort_all();
                        return Err(ExecutionError::Task(e.to_string()));
                    }
                },
            }
        }
        Ok(allowed)
    }
}

fn dry_run_executor(alias: &str, log: Option<&std::path::Path>) -> LoggingExecutor {
    match log.map(|path| LoggingExecutor::with_output(alias, path)) {
        Some(Ok(executor)) => executor,
        Some(Err(e)) => {
            tracing::warn!(alias, error = %e, "dry-run log unavailable, logging queries instead");
            LoggingExecutor::new(alias)
        }
        None => LoggingExecutor::new(alias),
    }
}
