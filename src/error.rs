//! Error types for configuration, translation and execution.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal problems found while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("datastore `{0}` is not configured")]
    UnknownDatastore(String),

    #[error("datastore `{alias}` of type `{kind}` cannot be used as {expected}")]
    WrongDatastoreType {
        alias: String,
        kind: String,
        expected: &'static str,
    },

    #[error("datastore `{0}` has no entity schemas")]
    NoSchemas(String),

    #[error("datastore `{alias}` is relational but schema `{schema}` declares nested entities")]
    NestedEntitiesUnsupported { alias: String, schema: String },

    #[error("entity `{entity}` is declared more than once for datastore `{alias}`")]
    DuplicateEntity { alias: String, entity: String },

    #[error("table `{table}` in schema `{schema}` of datastore `{alias}` is mapped by more than one entity")]
    DuplicateTable {
        alias: String,
        schema: String,
        table: String,
    },

    #[error("no call operands available for datastore type `{0}`")]
    MissingCallOperands(String),

    #[error("invalid call operand `{op}`: {reason}")]
    InvalidCallOperand { op: String, reason: String },
}

/// Per-request failures while turning policy output into a native query.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TranslationError {
    #[error("reference `{reference}` targets datastore `{found}`, expected `{expected}`")]
    ReferenceMismatch {
        reference: String,
        expected: String,
        found: String,
    },

    #[error("invalid reference `{0}`")]
    InvalidReference(String),

    #[error("row identifier in `{0}` must be a variable")]
    UnsupportedRowIdentifier(String),

    #[error("table `{table}` is iterated by both `{first}` and `{second}`; self links are not supported")]
    SelfLink {
        table: String,
        first: String,
        second: String,
    },

    #[error("variable `{0}` is used before it is declared")]
    UndefinedVariable(String),

    #[error("unsupported expression `{0}`")]
    UnsupportedExpression(String),

    #[error("unsupported term `{0}`")]
    UnsupportedTerm(String),

    #[error("query body {0} does not reference any entity")]
    MissingRootEntity(usize),

    #[error("entity `{0}` is not part of any configured schema")]
    SchemaMismatch(String),

    #[error("operator `{0}` is not supported by this datastore")]
    UnsupportedOperator(String),

    #[error("operator `{op}` expects {expected} arguments, got {got}")]
    OperatorArity {
        op: String,
        expected: String,
        got: usize,
    },

    #[error("entity `{entity}` is not reachable from collection `{collection}`")]
    EntityMappingNotFound { collection: String, entity: String },

    #[error("malformed query: {0}")]
    MalformedQuery(String),
}

/// Failures while running a native query.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("query on datastore `{0}` timed out")]
    Timeout(String),

    #[error("query on datastore `{0}` was cancelled")]
    Cancelled(String),

    #[error("filter for collection `{collection}` is not valid JSON: {source}")]
    InvalidFilter {
        collection: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("driver error: {0}")]
    Driver(String),

    #[error("query task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("datastore `{0}` is not registered")]
    UnknownDatastore(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
