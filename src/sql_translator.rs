//! Lowers the Query-AST into a parameterized SQL statement.
//!
//! Single post-order walk over the AST. Every node pops what its children
//! pushed and pushes its own text, so the finished statement is the only
//! thing left when the walk returns.

use crate::ast::{Clause, ConstantKind, NodeRef, Union, Walk};
use crate::config::{AppConfig, DatastoreType};
use crate::datastore::DatastoreTranslator;
use crate::error::{ConfigError, TranslationError};
use crate::operands::CallOperands;
use crate::schema::{resolve_entity, DatastoreSchemas};
use crate::stack::{OperandStack, Stack};
use sea_query::{MysqlQueryBuilder, PostgresQueryBuilder, QueryBuilder, SqliteQueryBuilder, Value, Values};
use std::fmt;
use std::sync::Arc;

/// SQL flavours that differ in placeholder style and schema handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    Mysql,
    Sqlite,
}

impl SqlDialect {
    pub fn from_type(kind: DatastoreType) -> Option<Self> {
        match kind {
            DatastoreType::Postgres => Some(SqlDialect::Postgres),
            DatastoreType::Mysql => Some(SqlDialect::Mysql),
            DatastoreType::Sqlite => Some(SqlDialect::Sqlite),
            DatastoreType::Mongo => None,
        }
    }

    /// Placeholder for the `index`-th (1-based) parameter.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::Postgres => placeholder_of(&PostgresQueryBuilder, index),
            SqlDialect::Mysql => placeholder_of(&MysqlQueryBuilder, index),
            SqlDialect::Sqlite => placeholder_of(&SqliteQueryBuilder, index),
        }
    }

    /// Tables in postgres' `public` schema are referenced unqualified.
    fn qualify(&self, schema: &str, table: &str) -> String {
        match self {
            SqlDialect::Postgres if schema == "public" => table.to_string(),
            _ => format!("{}.{}", schema, table),
        }
    }
}

fn placeholder_of<B: QueryBuilder>(builder: &B, index: usize) -> String {
    let (mark, numbered) = builder.placeholder();
    if numbered {
        format!("{}{}", mark, index)
    } else {
        mark.to_string()
    }
}

/// Statement text plus its positional parameters.
#[derive(Debug, Clone)]
pub struct SqlStatement {
    pub text: String,
    pub values: Values,
}

impl fmt::Display for SqlStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -- {:?}", self.text, self.values.0)
    }
}

#[derive(Debug, Clone)]
pub struct SqlTranslator {
    alias: String,
    dialect: SqlDialect,
    schemas: Arc<DatastoreSchemas>,
    operands: Arc<CallOperands>,
}

impl SqlTranslator {
    pub fn new(
        alias: impl Into<String>,
        dialect: SqlDialect,
        schemas: DatastoreSchemas,
        operands: CallOperands,
    ) -> Self {
        Self {
            alias: alias.into(),
            dialect,
            schemas: Arc::new(schemas),
            operands: Arc::new(operands),
        }
    }

    pub fn from_config(config: &AppConfig, alias: &str) -> Result<Self, ConfigError> {
        let datastore = config.datastore(alias)?;
        let dialect = SqlDialect::from_type(datastore.kind).ok_or_else(|| {
            ConfigError::WrongDatastoreType {
                alias: alias.to_string(),
                kind: datastore.kind.to_string(),
                expected: "a relational datastore",
            }
        })?;
        let schemas = config.schemas(alias)?.clone();
        let operands = CallOperands::load(datastore.kind, config.call_operands_dir.as_deref())?;
        tracing::info!(alias, dialect = ?dialect, operators = operands.len(), "configured sql translator");
        Ok(Self::new(alias, dialect, schemas, operands))
    }
}

impl DatastoreTranslator for SqlTranslator {
    type Output = SqlStatement;

    fn translate(&self, query: &Union) -> Result<SqlStatement, TranslationError> {
        let mut walker = SqlWalker::new(self);
        query.walk(&mut |node| walker.visit(node))?;
        let statement = walker.finish()?;
        tracing::debug!(
            alias = %self.alias,
            statement = %statement.text,
            params = statement.values.0.len(),
            "translated sql statement"
        );
        Ok(statement)
    }
}

/// Per-call walk state.
struct SqlWalker<'t> {
    translator: &'t SqlTranslator,
    statement: Option<String>,
    selects: Vec<String>,
    entities: Stack<String>,
    relations: Stack<String>,
    joins: Stack<String>,
    operands: OperandStack<String>,
    values: Vec<Value>,
}

impl<'t> SqlWalker<'t> {
    fn new(translator: &'t SqlTranslator) -> Self {
        Self {
            translator,
            statement: None,
            selects: Vec::new(),
            entities: Stack::new(),
            relations: Stack::new(),
            joins: Stack::new(),
            operands: OperandStack::new(),
            values: Vec::new(),
        }
    }

    fn finish(self) -> Result<SqlStatement, TranslationError> {
        let text = self
            .statement
            .ok_or_else(|| TranslationError::MalformedQuery("no union was translated".to_string()))?;
        Ok(SqlStatement {
            text,
            values: Values(self.values),
        })
    }

    fn visit(&mut self, node: NodeRef<'_>) -> Result<(), TranslationError> {
        match node {
            NodeRef::Union(_) => {
                self.statement = Some(self.selects.join(" UNION "));
                self.selects.clear();
            }
            NodeRef::Query(_) => {
                let condition = self.relations.pop()?;
                if !self.relations.is_empty() {
                    return Err(TranslationError::MalformedQuery(format!(
                        "{} relations left after building the condition",
                        self.relations.len()
                    )));
                }
                let joins = self.joins.pop()?;
                let from = self.entities.pop()?;
                self.selects
                    .push(format!("SELECT count(*) FROM {}{}{}", from, joins, condition));
            }
            NodeRef::Link(link) => {
                let entities = self.entities.pop_n(link.joins.len())?;
                let with_condition = link.joins.iter().filter(|j| j.condition.is_some()).count();
                let mut predicates = self.relations.pop_n(with_condition)?.into_iter();

                let mut joins = String::new();
                for (join, table) in link.joins.iter().zip(entities) {
                    let predicate = match join.condition {
                        Some(_) => predicates.next().unwrap_or_default(),
                        None => String::new(),
                    };
                    match predicate.strip_prefix(" WHERE ") {
                        Some(on) if !on.is_empty() => {
                            joins.push_str(&format!(" INNER JOIN {} ON {}", table, on))
                        }
                        _ => joins.push_str(&format!(" CROSS JOIN {}", table)),
                    }
                }
                self.joins.push(joins);
            }
            NodeRef::Condition(condition) => {
                if condition.is_empty() {
                    self.relations.push(String::new());
                } else {
                    let relation = self.relations.pop()?;
                    self.relations.push(format!(" WHERE {}", relation));
                }
            }
            NodeRef::Conjunction(conj) => self.combine(&conj.clauses, " AND ")?,
            NodeRef::Disjunction(disj) => self.combine(&disj.clauses, " OR ")?,
            NodeRef::Attribute(attribute) => {
                let entity = self.entities.pop()?;
                self.operands
                    .append_to_top(format!("{}.{}", entity, attribute.name))?;
            }
            NodeRef::Call(_) => {
                let frame = self.operands.pop_frame()?;
                let (op, args) = frame.split_first().ok_or_else(|| {
                    TranslationError::MalformedQuery("call without operator".to_string())
                })?;
                let rendered = self.translator.operands.map(op, args)?;
                if self.operands.is_empty() {
                    self.relations.push(rendered);
                } else {
                    self.operands.append_to_top(rendered)?;
                }
            }
            NodeRef::Operator(operator) => self.operands.push_frame_with(operator.name.clone()),
            NodeRef::Entity(entity) => {
                let (schema, config) = resolve_entity(&self.translator.schemas, &entity.name)
                    .ok_or_else(|| TranslationError::SchemaMismatch(entity.name.clone()))?;
                self.entities
                    .push(self.translator.dialect.qualify(schema, &config.name));
            }
            NodeRef::Constant(constant) => {
                let value = match (&constant.text, constant.kind) {
                    (Some(text), _) => Value::from(text.clone()),
                    (None, ConstantKind::Integer) => constant
                        .value
                        .parse::<i64>()
                        .map(Value::from)
                        .unwrap_or_else(|_| Value::from(constant.value.clone())),
                    (None, ConstantKind::Float) => constant
                        .value
                        .parse::<f64>()
                        .map(Value::from)
                        .unwrap_or_else(|_| Value::from(constant.value.clone())),
                    (None, ConstantKind::String) => Value::from(constant.value.clone()),
                };
                self.values.push(value);
                let placeholder = self.translator.dialect.placeholder(self.values.len());
                self.operands.append_to_top(placeholder)?;
            }
        }
        Ok(())
    }

    fn combine(&mut self, clauses: &[Clause], separator: &str) -> Result<(), TranslationError> {
        let produced = clauses.iter().filter(|c| !c.is_empty()).count();
        let relations = self.relations.pop_n(produced)?;
        match relations.len() {
            0 => {}
            1 => self.relations.push(relations.join("")),
            _ => self
                .relations
                .push(format!("({})", relations.join(separator))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        Attribute, Call, Clause, Condition, Conjunction, Constant, Disjunction, Entity, Join,
        Link, Operand, Query,
    };
    use crate::schema::{EntityConfig, EntitySchema};

    fn schemas(schema: &str, tables: &[(&str, Option<&str>)]) -> DatastoreSchemas {
        let entities = tables
            .iter()
            .map(|(name, alias)| match alias {
                Some(alias) => EntityConfig::new(*name).with_alias(*alias),
                None => EntityConfig::new(*name),
            })
            .collect();
        let mut schemas = DatastoreSchemas::new();
        schemas.insert(schema.to_string(), EntitySchema::new(entities));
        schemas
    }

    fn translator(kind: DatastoreType, schema: &str) -> SqlTranslator {
        SqlTranslator::new(
            "db",
            SqlDialect::from_type(kind).unwrap(),
            schemas(schema, &[("users", None), ("user_apps", Some("apps"))]),
            CallOperands::defaults(kind).unwrap(),
        )
    }

    fn eq(left: Operand, right: Operand) -> Clause {
        Clause::Call(Call::new("eq", vec![left, right]))
    }

    fn att(entity: &str, name: &str) -> Operand {
        Operand::Attribute(Attribute::new(entity, name))
    }

    fn lit(raw: &str) -> Operand {
        Operand::Constant(Constant::classify(raw))
    }

    fn simple_query(entity: &str, clauses: Vec<Clause>) -> Query {
        Query {
            from: Entity::new(entity),
            link: Link::default(),
            condition: Condition {
                clause: Clause::Conjunction(Conjunction { clauses }),
            },
        }
    }

    #[test]
    fn test_postgres_public_schema() {
        let union = Union {
            clauses: vec![simple_query("users", vec![eq(att("users", "id"), lit("5"))])],
        };
        let statement = translator(DatastoreType::Postgres, "public")
            .translate(&union)
            .unwrap();
        assert_eq!(statement.text, "SELECT count(*) FROM users WHERE users.id = $1");
        assert_eq!(statement.values.0, vec![Value::from(5i64)]);
    }

    #[test]
    fn test_mysql_qualifies_schema() {
        let union = Union {
            clauses: vec![simple_query("users", vec![eq(att("users", "id"), lit("5"))])],
        };
        let statement = translator(DatastoreType::Mysql, "appstore")
            .translate(&union)
            .unwrap();
        assert_eq!(
            statement.text,
            "SELECT count(*) FROM appstore.users WHERE appstore.users.id = ?"
        );
    }

    #[test]
    fn test_postgres_other_schema_is_qualified() {
        let union = Union {
            clauses: vec![simple_query("apps", vec![eq(att("apps", "id"), lit("1"))])],
        };
        let statement = translator(DatastoreType::Postgres, "store")
            .translate(&union)
            .unwrap();
        assert_eq!(
            statement.text,
            "SELECT count(*) FROM store.user_apps WHERE store.user_apps.id = $1"
        );
    }

    #[test]
    fn test_union_numbers_placeholders_globally() {
        let union = Union {
            clauses: vec![
                simple_query(
                    "users",
                    vec![
                        eq(att("users", "name"), lit("\"bob\"")),
                        eq(att("users", "age"), lit("1.5")),
                    ],
                ),
                simple_query("apps", vec![eq(att("apps", "id"), lit("7"))]),
            ],
        };
        let statement = translator(DatastoreType::Postgres, "public")
            .translate(&union)
            .unwrap();
        assert_eq!(
            statement.text,
            "SELECT count(*) FROM users WHERE (users.name = $1 AND users.age = $2) UNION SELECT count(*) FROM user_apps WHERE user_apps.id = $3"
        );
        assert_eq!(
            statement.values.0,
            vec![
                Value::from("bob".to_string()),
                Value::from(1.5f64),
                Value::from(7i64)
            ]
        );
    }

    #[test]
    fn test_inner_join_with_predicate() {
        let query = Query {
            from: Entity::new("users"),
            link: Link {
                joins: vec![Join {
                    entity: Entity::new("apps"),
                    condition: Some(Condition {
                        clause: eq(att("apps", "owner"), att("users", "id")),
                    }),
                }],
            },
            condition: Condition {
                clause: Clause::Conjunction(Conjunction {
                    clauses: vec![eq(att("users", "name"), lit("\"bob\""))],
                }),
            },
        };
        let statement = translator(DatastoreType::Postgres, "public")
            .translate(&Union { clauses: vec![query] })
            .unwrap();
        assert_eq!(
            statement.text,
            "SELECT count(*) FROM users INNER JOIN user_apps ON user_apps.owner = users.id WHERE users.name = $1"
        );
    }

    #[test]
    fn test_cross_join_and_empty_condition() {
        let query = Query {
            from: Entity::new("users"),
            link: Link {
                joins: vec![Join {
                    entity: Entity::new("apps"),
                    condition: None,
                }],
            },
            condition: Condition {
                clause: Clause::Conjunction(Conjunction::default()),
            },
        };
        let statement = translator(DatastoreType::Sqlite, "main")
            .translate(&Union { clauses: vec![query] })
            .unwrap();
        assert_eq!(
            statement.text,
            "SELECT count(*) FROM main.users CROSS JOIN main.user_apps"
        );
        assert!(statement.values.0.is_empty());
    }

    #[test]
    fn test_disjunction_and_nested_call() {
        let abs = Operand::Call(Call::new("abs", vec![att("users", "balance")]));
        let query = simple_query(
            "users",
            vec![Clause::Disjunction(Disjunction {
                clauses: vec![
                    eq(abs, lit("3")),
                    Clause::Call(Call::new("lower", vec![att("users", "name"), lit("\"bob\"")])),
                ],
            })],
        );
        let statement = translator(DatastoreType::Postgres, "public")
            .translate(&Union { clauses: vec![query] })
            .unwrap();
        assert_eq!(
            statement.text,
            "SELECT count(*) FROM users WHERE (abs(users.balance) = $1 OR lower(users.name) = $2)"
        );
    }

    #[test]
    fn test_unsupported_operator() {
        let query = simple_query(
            "users",
            vec![Clause::Call(Call::new("regex.match", vec![att("users", "name"), lit("\"x\"")]))],
        );
        let err = translator(DatastoreType::Postgres, "public")
            .translate(&Union { clauses: vec![query] })
            .unwrap_err();
        assert_eq!(err, TranslationError::UnsupportedOperator("regex.match".to_string()));
    }

    #[test]
    fn test_schema_mismatch() {
        let query = simple_query("ghosts", vec![eq(att("ghosts", "id"), lit("1"))]);
        let err = translator(DatastoreType::Postgres, "public")
            .translate(&Union { clauses: vec![query] })
            .unwrap_err();
        assert_eq!(err, TranslationError::SchemaMismatch("ghosts".to_string()));
    }

    #[test]
    fn test_quoted_numeric_string_binds_as_text() {
        let union = Union {
            clauses: vec![simple_query(
                "users",
                vec![
                    eq(att("users", "zip"), Operand::Constant(Constant::string("01234"))),
                    eq(att("users", "id"), lit("5")),
                ],
            )],
        };
        let statement = translator(DatastoreType::Postgres, "public")
            .translate(&union)
            .unwrap();
        assert_eq!(
            statement.text,
            "SELECT count(*) FROM users WHERE (users.zip = $1 AND users.id = $2)"
        );
        assert_eq!(
            statement.values.0,
            vec![Value::from("01234".to_string()), Value::from(5i64)]
        );
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(SqlDialect::Postgres.placeholder(3), "$3");
        assert_eq!(SqlDialect::Mysql.placeholder(3), "?");
        assert_eq!(SqlDialect::Sqlite.placeholder(1), "?");
    }

    #[test]
    fn test_from_config_rejects_document_store() {
        let config = AppConfig::from_json_str(
            r#"{
                "datastores": {"mongo": {"type": "mongo"}},
                "entity_schemas": {"mongo": {"app": {"entities": [{"name": "apps"}]}}}
            }"#,
        )
        .unwrap();
        assert!(matches!(
            SqlTranslator::from_config(&config, "mongo"),
            Err(ConfigError::WrongDatastoreType { .. })
        ));
    }
}
