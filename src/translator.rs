//! Request pipeline: partial evaluation output -> Query-AST -> datastore.

use crate::ast::Union;
use crate::config::{AppConfig, DatastoreType};
use crate::datastore::{Datastore, DatastoreQuery, ExecutorHandle};
use crate::error::{ConfigError, Error};
use crate::executor::ExecutionContext;
use crate::preprocessor::Preprocessor;
use crate::processor::Processor;
use crate::rego::PartialQueries;
use indexmap::IndexMap;

/// What a request compiles down to before anything is executed.
#[derive(Debug, Clone)]
pub enum Compiled {
    /// no query can succeed
    Denied,
    /// a body with no residual conditions
    Allowed,
    Pushdown { ast: Union, query: DatastoreQuery },
}

#[derive(Debug, Default)]
pub struct PolicyTranslator {
    datastores: IndexMap<String, Datastore>,
    processor: Processor,
}

impl PolicyTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds every configured datastore, asking `executors` for the
    /// executor of each one.
    pub fn from_config<F>(config: &AppConfig, mut executors: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str, DatastoreType) -> ExecutorHandle,
    {
        let mut translator = Self::new();
        for (alias, datastore) in &config.datastores {
            let handle = executors(alias, datastore.kind);
            translator.register(Datastore::from_config(config, alias, handle)?);
        }
        Ok(translator)
    }

    /// Every datastore runs as a dry run through the logging executor.
    pub fn dry_run(config: &AppConfig) -> Result<Self, ConfigError> {
        Self::from_config(config, |_, _| ExecutorHandle::Logging)
    }

    pub fn with_skip_unknown(mut self, skip_unknown: bool) -> Self {
        self.processor = self.processor.with_skip_unknown(skip_unknown);
        self
    }

    pub fn register(&mut self, datastore: Datastore) {
        self.datastores.insert(datastore.alias().to_string(), datastore);
    }

    pub fn datastore(&self, alias: &str) -> Option<&Datastore> {
        self.datastores.get(alias)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.datastores.keys().map(String::as_str)
    }

    pub fn compile(&self, queries: &PartialQueries, alias: &str) -> Result<Compiled, Error> {
        let datastore = self
            .datastore(alias)
            .ok_or_else(|| Error::UnknownDatastore(alias.to_string()))?;

        if queries.queries.is_empty() {
            tracing::debug!(alias, "no residual queries -> DENIED");
            return Ok(Compiled::Denied);
        }
        if queries.queries.iter().any(|body| body.is_empty()) {
            tracing::debug!(alias, "unconditional body -> ALLOWED");
            return Ok(Compiled::Allowed);
        }

        let bodies = Preprocessor::new(alias).process(&queries.queries)?;
        let ast = self.processor.process(&bodies)?;
        tracing::debug!(alias, ast = %ast, "built query ast");
        let query = datastore.translate(&ast)?;
        Ok(Compiled::Pushdown { ast, query })
    }

    pub async fn process(
        &self,
        ctx: &ExecutionContext,
        queries: &PartialQueries,
        alias: &str,
    ) -> Result<bool, Error> {
        match self.compile(queries, alias)? {
            Compiled::Denied => Ok(false),
            Compiled::Allowed => Ok(true),
            Compiled::Pushdown { query, .. } => {
                let datastore = self
                    .datastore(alias)
                    .ok_or_else(|| Error::UnknownDatastore(alias.to_string()))?;
                Ok(datastore.execute(ctx, &query).await?)
            }
        }
    }

    /// Fails closed: any error is logged and treated as a deny.
    pub async fn decide(&self, ctx: &ExecutionContext, queries: &PartialQueries, alias: &str) -> bool {
        match self.process(ctx, queries, alias).await {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::error!(alias, error = %e, "policy decision failed, denying");
                false
            }
        }
    }
}
