//! Lowers the Query-AST into document-store count filters.
//!
//! Attributes are emitted with a deferred `{{<entity>.}}` marker. Once all
//! branches are known, filters are grouped by root collection and the
//! markers are replaced with the entity's path inside that collection.

use crate::ast::{Clause, ConstantKind, NodeRef, Query, Union, Walk};
use crate::config::{AppConfig, DatastoreType};
use crate::datastore::DatastoreTranslator;
use crate::error::{ConfigError, TranslationError};
use crate::operands::CallOperands;
use crate::schema::DatastoreSchemas;
use crate::stack::{OperandStack, Stack};
use indexmap::IndexMap;
use regex::Regex;
use std::fmt;
use std::sync::{Arc, LazyLock};

static ENTITY_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("valid regex"));

/// collection -> entity -> physical path starting at the collection
type EntityPaths = IndexMap<String, IndexMap<String, Vec<String>>>;

/// Collection name -> filter document, each run as its own count query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentQuery {
    pub filters: IndexMap<String, String>,
}

impl fmt::Display for DocumentQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (collection, filter)) in self.filters.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}: {}", collection, filter)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MongoTranslator {
    alias: String,
    schemas: Arc<DatastoreSchemas>,
    entity_paths: Arc<EntityPaths>,
    operands: Arc<CallOperands>,
}

impl MongoTranslator {
    pub fn new(alias: impl Into<String>, schemas: DatastoreSchemas, operands: CallOperands) -> Self {
        let mut entity_paths = EntityPaths::new();
        for schema in schemas.values() {
            entity_paths.extend(schema.entity_paths());
        }
        Self {
            alias: alias.into(),
            schemas: Arc::new(schemas),
            entity_paths: Arc::new(entity_paths),
            operands: Arc::new(operands),
        }
    }

    pub fn from_config(config: &AppConfig, alias: &str) -> Result<Self, ConfigError> {
        let datastore = config.datastore(alias)?;
        if datastore.kind != DatastoreType::Mongo {
            return Err(ConfigError::WrongDatastoreType {
                alias: alias.to_string(),
                kind: datastore.kind.to_string(),
                expected: "a document datastore",
            });
        }
        let schemas = config.schemas(alias)?.clone();
        let operands = CallOperands::load(datastore.kind, config.call_operands_dir.as_deref())?;
        tracing::info!(alias, operators = operands.len(), "configured document translator");
        Ok(Self::new(alias, schemas, operands))
    }

    fn collection_name(&self, logical: &str) -> Option<&str> {
        self.schemas
            .values()
            .find_map(|schema| schema.top_level(logical))
    }

    /// Join predicates are dropped for documents, so every linked entity
    /// has to live inside the root collection.
    fn check_links(&self, query: &Query) -> Result<(), TranslationError> {
        let root = &query.from.name;
        for join in &query.link.joins {
            let entity = &join.entity.name;
            let nested = entity == root
                || self
                    .entity_paths
                    .get(root)
                    .is_some_and(|paths| paths.contains_key(entity));
            if !nested {
                return Err(TranslationError::EntityMappingNotFound {
                    collection: root.clone(),
                    entity: entity.clone(),
                });
            }
        }
        Ok(())
    }

    /// Replaces `{{<entity>.}}` markers relative to `collection`.
    fn resolve_markers(&self, collection: &str, filter: &str) -> Result<String, TranslationError> {
        let mut out = String::with_capacity(filter.len());
        let mut last = 0;
        for captures in ENTITY_MARKER.captures_iter(filter) {
            let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            out.push_str(&filter[last..whole.start()]);
            last = whole.end();

            let entity = inner.as_str().trim_end_matches('.');
            if entity == collection {
                continue;
            }
            let path = self
                .entity_paths
                .get(collection)
                .and_then(|paths| paths.get(entity))
                .ok_or_else(|| TranslationError::EntityMappingNotFound {
                    collection: collection.to_string(),
                    entity: entity.to_string(),
                })?;
            if path.len() > 1 {
                out.push_str(&path[1..].join("."));
                out.push('.');
            }
        }
        out.push_str(&filter[last..]);
        Ok(out)
    }
}

impl DatastoreTranslator for MongoTranslator {
    type Output = DocumentQuery;

    fn translate(&self, query: &Union) -> Result<DocumentQuery, TranslationError> {
        let mut walker = MongoWalker::new(self);
        query.walk(&mut |node| walker.visit(node))?;
        let result = walker.result;
        for (collection, filter) in &result.filters {
            tracing::debug!(alias = %self.alias, collection = %collection, filter = %filter, "translated filter");
        }
        Ok(result)
    }
}

struct MongoWalker<'t> {
    translator: &'t MongoTranslator,
    result: DocumentQuery,
    filters: Vec<(String, String)>,
    entities: Stack<String>,
    relations: Stack<String>,
    operands: OperandStack<String>,
}

impl<'t> MongoWalker<'t> {
    fn new(translator: &'t MongoTranslator) -> Self {
        Self {
            translator,
            result: DocumentQuery::default(),
            filters: Vec::new(),
            entities: Stack::new(),
            relations: Stack::new(),
            operands: OperandStack::new(),
        }
    }

    fn visit(&mut self, node: NodeRef<'_>) -> Result<(), TranslationError> {
        match node {
            NodeRef::Union(_) => self.finish_union()?,
            NodeRef::Query(query) => {
                self.translator.check_links(query)?;
                let members = self.relations.pop()?;
                if !self.relations.is_empty() {
                    return Err(TranslationError::MalformedQuery(format!(
                        "{} relations left after building the filter",
                        self.relations.len()
                    )));
                }
                let root = self.entities.pop()?;
                self.filters.push((root, format!("{{{}}}", members)));
            }
            // documents are not joined; nested entities are addressed by path
            NodeRef::Link(_) => {
                self.entities.clear();
                self.relations.clear();
            }
            NodeRef::Condition(condition) => {
                if condition.is_empty() {
                    self.relations.push(String::new());
                }
            }
            NodeRef::Conjunction(conj) => {
                let members = self.pop_produced(&conj.clauses)?;
                if !members.is_empty() {
                    self.relations.push(members.join(", "));
                }
            }
            NodeRef::Disjunction(disj) => {
                let members = self.pop_produced(&disj.clauses)?;
                if !members.is_empty() {
                    let branches: Vec<String> =
                        members.iter().map(|m| format!("{{{}}}", m)).collect();
                    self.relations
                        .push(format!("\"$or\": [ {} ]", branches.join(", ")));
                }
            }
            NodeRef::Attribute(attribute) => {
                let entity = self.entities.pop()?;
                self.operands
                    .append_to_top(format!("\"{{{{{}.}}}}{}\"", entity, attribute.name))?;
            }
            NodeRef::Call(_) => {
                let mut frame = self.operands.pop_frame()?;
                if frame.is_empty() {
                    return Err(TranslationError::MalformedQuery(
                        "call without operator".to_string(),
                    ));
                }
                let op = frame.remove(0);
                let mut args = frame;

                // equality is expressed as `field: value`, so the field goes first
                if (op == "eq" || op == "equal")
                    && (args.len() == 2 || args.len() == 3)
                    && !ENTITY_MARKER.is_match(&args[0])
                {
                    args.swap(0, 1);
                }

                let rendered = self.translator.operands.map(&op, &args)?;
                if self.operands.is_empty() {
                    self.relations.push(rendered);
                } else {
                    self.operands.append_to_top(rendered)?;
                }
            }
            NodeRef::Operator(operator) => self.operands.push_frame_with(operator.name.clone()),
            NodeRef::Entity(entity) => self.entities.push(entity.name.clone()),
            NodeRef::Constant(constant) => {
                let literal = match constant.kind {
                    ConstantKind::Integer | ConstantKind::Float => constant.value.clone(),
                    // `{{` is reserved for entity markers
                    ConstantKind::String => serde_json::Value::String(constant.value.clone())
                        .to_string()
                        .replace("{{", "{\\u007b"),
                };
                self.operands.append_to_top(literal)?;
            }
        }
        Ok(())
    }

    fn pop_produced(&mut self, clauses: &[Clause]) -> Result<Vec<String>, TranslationError> {
        let produced = clauses.iter().filter(|c| !c.is_empty()).count();
        self.relations.pop_n(produced)
    }

    fn finish_union(&mut self) -> Result<(), TranslationError> {
        let mut by_collection: IndexMap<String, Vec<String>> = IndexMap::new();
        for (root, filter) in self.filters.drain(..) {
            by_collection.entry(root).or_default().push(filter);
        }

        for (root, filters) in by_collection {
            let combined = format!("{{ \"$or\": [ {} ] }}", filters.join(", "));
            let resolved = self.translator.resolve_markers(&root, &combined)?;
            let collection = self
                .translator
                .collection_name(&root)
                .ok_or_else(|| TranslationError::SchemaMismatch(root.clone()))?;
            self.result.filters.insert(collection.to_string(), resolved);
        }
        Ok(())
    }
}
