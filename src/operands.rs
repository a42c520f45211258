//! Call-operand registry: maps policy operators to backend syntax.
//!
//! Every datastore owns its own registry, built once from the embedded
//! defaults for its type plus optional override files, and read-only
//! afterwards.

use crate::config::DatastoreType;
use crate::error::{ConfigError, TranslationError};
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};

static ARG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)").expect("valid regex"));

const POSTGRES_OPERANDS: &str = include_str!("../call_operands/postgres.json");
const MYSQL_OPERANDS: &str = include_str!("../call_operands/mysql.json");
const SQLITE_OPERANDS: &str = include_str!("../call_operands/sqlite.json");
const MONGO_OPERANDS: &str = include_str!("../call_operands/mongo.json");

/// Renders a call from its already translated arguments.
pub type CallOperandFn = Arc<dyn Fn(&[String]) -> Result<String, TranslationError> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct CallOperandFile {
    call_operands: Vec<CallOperandEntry>,
}

#[derive(Debug, Deserialize)]
struct CallOperandEntry {
    op: String,
    args: usize,
    mapping: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Arg(usize),
}

/// Mapping template such as `$0 LIKE $1 || '%'`.
#[derive(Debug, Clone)]
struct Template {
    op: String,
    args: usize,
    segments: Vec<Segment>,
}

impl Template {
    fn parse(entry: CallOperandEntry) -> Result<Self, ConfigError> {
        let mut segments = Vec::new();
        let mut last = 0;
        for captures in ARG_PATTERN.captures_iter(&entry.mapping) {
            let (Some(whole), Some(index)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let index: usize = index.as_str().parse().map_err(|_| ConfigError::InvalidCallOperand {
                op: entry.op.clone(),
                reason: format!("bad argument reference `{}`", whole.as_str()),
            })?;
            if index >= entry.args {
                return Err(ConfigError::InvalidCallOperand {
                    op: entry.op.clone(),
                    reason: format!(
                        "mapping references ${} but only {} arguments are declared",
                        index, entry.args
                    ),
                });
            }
            if whole.start() > last {
                segments.push(Segment::Text(entry.mapping[last..whole.start()].to_string()));
            }
            segments.push(Segment::Arg(index));
            last = whole.end();
        }
        if last < entry.mapping.len() {
            segments.push(Segment::Text(entry.mapping[last..].to_string()));
        }

        Ok(Self {
            op: entry.op,
            args: entry.args,
            segments,
        })
    }

    /// Accepts `args` arguments, or one more as a default comparison
    /// rendered as `<mapping> = <last>`.
    fn render(&self, args: &[String]) -> Result<String, TranslationError> {
        if args.len() < self.args || args.len() > self.args + 1 {
            return Err(TranslationError::OperatorArity {
                op: self.op.clone(),
                expected: format!("{} or {}", self.args, self.args + 1),
                got: args.len(),
            });
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Arg(i) => out.push_str(&args[*i]),
            }
        }
        if args.len() > self.args {
            out.push_str(" = ");
            out.push_str(&args[args.len() - 1]);
        }
        Ok(out)
    }
}

#[derive(Clone, Default)]
pub struct CallOperands {
    handlers: IndexMap<String, CallOperandFn>,
}

impl fmt::Debug for CallOperands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOperands")
            .field("operators", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CallOperands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a `{"call_operands": [{"op", "args", "mapping"}]}` document.
    pub fn from_json_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let file: CallOperandFile =
            serde_json::from_str(content).map_err(|source| ConfigError::Parse {
                origin: origin.to_string(),
                source,
            })?;

        let mut operands = Self::new();
        for entry in file.call_operands {
            let template = Arc::new(Template::parse(entry)?);
            let op = template.op.clone();
            operands
                .handlers
                .insert(op, Arc::new(move |args: &[String]| template.render(args)));
        }
        Ok(operands)
    }

    /// Built-in operands for a datastore type.
    pub fn defaults(kind: DatastoreType) -> Result<Self, ConfigError> {
        let content = match kind {
            DatastoreType::Postgres => POSTGRES_OPERANDS,
            DatastoreType::Mysql => MYSQL_OPERANDS,
            DatastoreType::Sqlite => SQLITE_OPERANDS,
            DatastoreType::Mongo => MONGO_OPERANDS,
        };
        let operands = Self::from_json_str(content, &format!("built-in {} operands", kind))?;
        if operands.is_empty() {
            return Err(ConfigError::MissingCallOperands(kind.to_string()));
        }
        Ok(operands)
    }

    /// Built-ins overlaid with `<dir>/<type>.json` if present. A missing or
    /// broken override file only logs a warning.
    pub fn load(kind: DatastoreType, dir: Option<&Path>) -> Result<Self, ConfigError> {
        let mut operands = Self::defaults(kind)?;

        if let Some(dir) = dir {
            let path = dir.join(format!("{}.json", kind.as_str()));
            let custom = std::fs::read_to_string(&path)
                .map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })
                .and_then(|content| Self::from_json_str(&content, &path.display().to_string()));

            match custom {
                Ok(custom) => {
                    tracing::info!(
                        path = %path.display(),
                        count = custom.len(),
                        "loaded custom call operands"
                    );
                    operands.extend(custom);
                }
                Err(e) => {
                    tracing::warn!(
                        datastore_type = %kind,
                        error = %e,
                        "failed loading custom call operands, only built-ins will be used"
                    );
                }
            }
        }
        Ok(operands)
    }

    /// Registers or replaces a single operand.
    pub fn with_operand<F>(mut self, op: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[String]) -> Result<String, TranslationError> + Send + Sync + 'static,
    {
        self.handlers.insert(op.into(), Arc::new(handler));
        self
    }

    pub fn extend(&mut self, other: CallOperands) {
        self.handlers.extend(other.handlers);
    }

    pub fn lookup(&self, op: &str) -> Option<&CallOperandFn> {
        self.handlers.get(op)
    }

    pub fn map(&self, op: &str, args: &[String]) -> Result<String, TranslationError> {
        let handler = self
            .lookup(op)
            .ok_or_else(|| TranslationError::UnsupportedOperator(op.to_string()))?;
        handler(args)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_load_defaults_for_every_type() {
        for kind in [
            DatastoreType::Postgres,
            DatastoreType::Mysql,
            DatastoreType::Sqlite,
            DatastoreType::Mongo,
        ] {
            let operands = CallOperands::defaults(kind).unwrap();
            assert!(operands.lookup("eq").is_some(), "{} has no eq", kind);
            assert!(operands.lookup("equal").is_some());
        }
    }

    #[test]
    fn test_sql_templates() {
        let pg = CallOperands::defaults(DatastoreType::Postgres).unwrap();
        assert_eq!(pg.map("eq", &args(&["users.id", "$1"])).unwrap(), "users.id = $1");
        assert_eq!(pg.map("neq", &args(&["a", "b"])).unwrap(), "a <> b");
        assert_eq!(pg.map("plus", &args(&["a", "b"])).unwrap(), "(a + b)");
        assert_eq!(
            pg.map("startswith", &args(&["users.name", "$2"])).unwrap(),
            "users.name LIKE $2 || '%'"
        );

        let mysql = CallOperands::defaults(DatastoreType::Mysql).unwrap();
        assert_eq!(
            mysql.map("contains", &args(&["users.name", "?"])).unwrap(),
            "users.name LIKE CONCAT('%', ?, '%')"
        );
    }

    #[test]
    fn test_default_comparison_argument() {
        let pg = CallOperands::defaults(DatastoreType::Postgres).unwrap();
        assert_eq!(pg.map("abs", &args(&["users.age"])).unwrap(), "abs(users.age)");
        assert_eq!(
            pg.map("abs", &args(&["users.age", "$1"])).unwrap(),
            "abs(users.age) = $1"
        );
    }

    #[test]
    fn test_arity_errors() {
        let pg = CallOperands::defaults(DatastoreType::Postgres).unwrap();
        assert!(matches!(
            pg.map("eq", &args(&["a"])),
            Err(TranslationError::OperatorArity { got: 1, .. })
        ));
        assert!(matches!(
            pg.map("abs", &args(&["a", "b", "c"])),
            Err(TranslationError::OperatorArity { got: 3, .. })
        ));
    }

    #[test]
    fn test_unknown_operator() {
        let mongo = CallOperands::defaults(DatastoreType::Mongo).unwrap();
        assert_eq!(
            mongo.map("abs", &args(&["a"])),
            Err(TranslationError::UnsupportedOperator("abs".to_string()))
        );
    }

    #[test]
    fn test_mongo_templates() {
        let mongo = CallOperands::defaults(DatastoreType::Mongo).unwrap();
        assert_eq!(mongo.map("equal", &args(&["one", "two"])).unwrap(), "one: two");
        assert_eq!(
            mongo.map("gte", &args(&["\"age\"", "18"])).unwrap(),
            "\"age\": {\"$gte\": 18}"
        );
    }

    #[test]
    fn test_argument_reordering() {
        let operands = CallOperands::from_json_str(
            r#"{"call_operands": [{"op": "in", "args": 2, "mapping": "$1 IN ($0)"}]}"#,
            "test",
        )
        .unwrap();
        assert_eq!(operands.map("in", &args(&["a", "b"])).unwrap(), "b IN (a)");
    }

    #[test]
    fn test_template_out_of_range() {
        let result = CallOperands::from_json_str(
            r#"{"call_operands": [{"op": "bad", "args": 1, "mapping": "$0 + $1"}]}"#,
            "test",
        );
        assert!(matches!(result, Err(ConfigError::InvalidCallOperand { .. })));
    }

    #[test]
    fn test_load_external_overrides() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("mongo.json"),
            r#"{"call_operands": [
                {"op": "eq", "args": 2, "mapping": "override $0 $1"},
                {"op": "custom", "args": 1, "mapping": "custom $0"}
            ]}"#,
        )
        .unwrap();

        let operands = CallOperands::load(DatastoreType::Mongo, Some(dir.path())).unwrap();
        assert_eq!(operands.map("eq", &args(&["one", "two"])).unwrap(), "override one two");
        assert_eq!(operands.map("custom", &args(&["one"])).unwrap(), "custom one");
        assert_eq!(operands.map("equal", &args(&["one", "two"])).unwrap(), "one: two");
    }

    #[test]
    fn test_load_missing_or_broken_override_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = CallOperands::load(DatastoreType::Mongo, Some(&dir.path().join("nope"))).unwrap();
        assert!(missing.lookup("eq").is_some());

        fs::write(dir.path().join("postgres.json"), "not json").unwrap();
        let broken = CallOperands::load(DatastoreType::Postgres, Some(dir.path())).unwrap();
        assert_eq!(broken.map("eq", &args(&["a", "b"])).unwrap(), "a = b");
    }

    #[test]
    fn test_programmatic_override() {
        let operands = CallOperands::defaults(DatastoreType::Postgres)
            .unwrap()
            .with_operand("eq", |args: &[String]| Ok(format!("{} IS NOT DISTINCT FROM {}", args[0], args[1])));
        assert_eq!(
            operands.map("eq", &args(&["a", "b"])).unwrap(),
            "a IS NOT DISTINCT FROM b"
        );
    }
}
