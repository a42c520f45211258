//! Pushes residual authorization policies down into datastores.
//!
//! Partially evaluated policy bodies are rewritten by the [`preprocessor`],
//! turned into a backend-neutral Query-AST by the [`processor`], lowered by
//! the [`sql_translator`] or [`mongo_translator`] and executed through a
//! [`datastore::Datastore`]. [`translator::PolicyTranslator`] ties the
//! stages together for one request.

pub mod ast;
pub mod config;
pub mod datastore;
pub mod error;
pub mod executor;
pub mod mongo_translator;
pub mod operands;
pub mod preprocessor;
pub mod processor;
pub mod rego;
pub mod schema;
pub mod sql_translator;
pub mod stack;
pub mod translator;

pub use config::AppConfig;
pub use datastore::{Datastore, DatastoreQuery, DatastoreTranslator, ExecutorHandle};
pub use error::{ConfigError, Error, ExecutionError, TranslationError};
pub use executor::{DocumentExecutor, ExecutionContext, LoggingExecutor, SqlExecutor};
pub use rego::PartialQueries;
pub use translator::{Compiled, PolicyTranslator};
