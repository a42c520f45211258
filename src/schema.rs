//! 实体 schema: 逻辑实体名到物理表/集合位置的映射

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// 单个实体配置。文档型数据库可以嵌套子实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    /// 物理名 (表名, 集合名或文档字段名)
    pub name: String,
    /// 策略中使用的逻辑名, 缺省时与物理名相同
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<EntityConfig>,
}

impl EntityConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            entities: Vec::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_entities(mut self, entities: Vec<EntityConfig>) -> Self {
        self.entities = entities;
        self
    }

    pub fn logical_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    fn find(&self, logical: &str) -> Option<&EntityConfig> {
        if self.logical_name() == logical {
            return Some(self);
        }
        self.entities.iter().find_map(|e| e.find(logical))
    }

    fn collect_paths(&self, prefix: &[String], out: &mut IndexMap<String, Vec<String>>) {
        let mut path = prefix.to_vec();
        path.push(self.name.clone());
        out.entry(self.logical_name().to_string())
            .or_insert_with(|| path.clone());
        for child in &self.entities {
            child.collect_paths(&path, out);
        }
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        out.push(self.logical_name());
        for child in &self.entities {
            child.collect_names(out);
        }
    }
}

/// 一个 schema 下的实体列表
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntitySchema {
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

impl EntitySchema {
    pub fn new(entities: Vec<EntityConfig>) -> Self {
        Self { entities }
    }

    /// 递归查找逻辑实体名
    pub fn contains_entity(&self, logical: &str) -> bool {
        self.find_entity(logical).is_some()
    }

    pub fn find_entity(&self, logical: &str) -> Option<&EntityConfig> {
        self.entities.iter().find_map(|e| e.find(logical))
    }

    /// 顶层实体的物理名
    pub fn top_level(&self, logical: &str) -> Option<&str> {
        self.entities
            .iter()
            .find(|e| e.logical_name() == logical)
            .map(|e| e.name.as_str())
    }

    pub fn has_nested_entities(&self) -> bool {
        self.entities.iter().any(|e| !e.entities.is_empty())
    }

    /// 所有逻辑实体名, 深度优先
    pub fn entity_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for entity in &self.entities {
            entity.collect_names(&mut names);
        }
        names
    }

    /// 集合逻辑名 -> (实体逻辑名 -> 从集合开始的物理路径)
    ///
    /// 例如 `A -> nested -> B` 得到 `paths["A"]["B"] == ["A", "nested", "B"]`。
    pub fn entity_paths(&self) -> IndexMap<String, IndexMap<String, Vec<String>>> {
        let mut result = IndexMap::new();
        for collection in &self.entities {
            let mut paths = IndexMap::new();
            collection.collect_paths(&[], &mut paths);
            result.insert(collection.logical_name().to_string(), paths);
        }
        result
    }
}

/// 某个数据源的全部 schema, 保持配置文件中的顺序
pub type DatastoreSchemas = IndexMap<String, EntitySchema>;

/// 在配置顺序中第一个包含该实体的 schema, 返回 (schema 名, 实体配置)
pub fn resolve_entity<'a>(
    schemas: &'a DatastoreSchemas,
    logical: &str,
) -> Option<(&'a str, &'a EntityConfig)> {
    schemas.iter().find_map(|(schema_name, schema)| {
        schema
            .find_entity(logical)
            .map(|entity| (schema_name.as_str(), entity))
    })
}
