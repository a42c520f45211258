//! 配置模块，负责加载并校验JSON配置文件

use crate::error::ConfigError;
use crate::schema::DatastoreSchemas;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认的单次查询超时
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// 数据源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreType {
    Postgres,
    Mysql,
    Sqlite,
    Mongo,
}

impl DatastoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatastoreType::Postgres => "postgres",
            DatastoreType::Mysql => "mysql",
            DatastoreType::Sqlite => "sqlite",
            DatastoreType::Mongo => "mongo",
        }
    }

    pub fn is_relational(&self) -> bool {
        !matches!(self, DatastoreType::Mongo)
    }
}

impl std::fmt::Display for DatastoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个数据源配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastoreConfig {
    #[serde(rename = "type")]
    pub kind: DatastoreType,
    /// 单次查询超时 (毫秒)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_timeout_ms: Option<u64>,
    /// 空跑模式下把查询以 JSON 行写入该文件, 缺省时只写日志
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run_log: Option<PathBuf>,
}

impl DatastoreConfig {
    pub fn new(kind: DatastoreType) -> Self {
        Self {
            kind,
            query_timeout_ms: None,
            dry_run_log: None,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_QUERY_TIMEOUT)
    }
}

/// 应用配置: 数据源, 每个数据源的实体 schema, 以及可选的自定义运算符目录
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub datastores: IndexMap<String, DatastoreConfig>,
    #[serde(default)]
    pub entity_schemas: IndexMap<String, DatastoreSchemas>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_operands_dir: Option<PathBuf>,
}

impl AppConfig {
    /// 从JSON文件加载配置并校验
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        let content = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;

        let config: AppConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                origin: path_ref.display().to_string(),
                source,
            })?;

        config.validate()?;
        tracing::info!(
            path = %path_ref.display(),
            datastores = config.datastores.len(),
            "loaded configuration"
        );
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            serde_json::from_str(content).map_err(|source| ConfigError::Parse {
                origin: "<inline>".to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn datastore(&self, alias: &str) -> Result<&DatastoreConfig, ConfigError> {
        self.datastores
            .get(alias)
            .ok_or_else(|| ConfigError::UnknownDatastore(alias.to_string()))
    }

    pub fn schemas(&self, alias: &str) -> Result<&DatastoreSchemas, ConfigError> {
        match self.entity_schemas.get(alias) {
            Some(schemas) if !schemas.is_empty() => Ok(schemas),
            _ => Err(ConfigError::NoSchemas(alias.to_string())),
        }
    }

    /// 校验:
    /// - schema 只能属于已配置的数据源, 且每个数据源至少一个 schema
    /// - 关系型数据源不允许嵌套实体
    /// - 同一数据源内逻辑实体名唯一
    /// - 同一 schema 内每张物理表只能被一个实体映射, 否则别名会造成自连接
    pub fn validate(&self) -> Result<(), ConfigError> {
        for alias in self.entity_schemas.keys() {
            if !self.datastores.contains_key(alias) {
                return Err(ConfigError::UnknownDatastore(alias.clone()));
            }
        }

        for (alias, datastore) in &self.datastores {
            let schemas = self.schemas(alias)?;

            let mut seen = HashSet::new();
            for (schema_name, schema) in schemas {
                if datastore.kind.is_relational() && schema.has_nested_entities() {
                    return Err(ConfigError::NestedEntitiesUnsupported {
                        alias: alias.clone(),
                        schema: schema_name.clone(),
                    });
                }
                let mut tables = HashSet::new();
                for entity in &schema.entities {
                    if !tables.insert(entity.name.as_str()) {
                        return Err(ConfigError::DuplicateTable {
                            alias: alias.clone(),
                            schema: schema_name.clone(),
                            table: entity.name.clone(),
                        });
                    }
                }
                for entity in schema.entity_names() {
                    if !seen.insert(entity) {
                        return Err(ConfigError::DuplicateEntity {
                            alias: alias.clone(),
                            entity: entity.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const VALID: &str = r#"{
        "datastores": {
            "pg": { "type": "postgres", "query_timeout_ms": 250 },
            "mongo": { "type": "mongo" }
        },
        "entity_schemas": {
            "pg": {
                "public": { "entities": [ { "name": "users" }, { "name": "user_apps", "alias": "apps" } ] }
            },
            "mongo": {
                "appstore": { "entities": [
                    { "name": "apps", "entities": [ { "name": "rights" } ] }
                ] }
            }
        }
    }"#;

    #[test]
    fn test_load_valid_json_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", VALID).unwrap();

        let config = AppConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.datastores.len(), 2);
        assert_eq!(
            config.datastores.keys().collect::<Vec<_>>(),
            vec!["pg", "mongo"]
        );

        let pg = config.datastore("pg").unwrap();
        assert_eq!(pg.kind, DatastoreType::Postgres);
        assert_eq!(pg.query_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.datastore("mongo").unwrap().query_timeout(),
            DEFAULT_QUERY_TIMEOUT
        );
        assert!(config.schemas("pg").unwrap()["public"].contains_entity("apps"));
        assert!(config.call_operands_dir.is_none());
    }

    #[test]
    fn test_invalid_json_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid json").unwrap();

        let result = AppConfig::from_json_file(file.path());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::from_json_file(dir.path().join("non_existent_file.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_unknown_datastore_type() {
        let result = AppConfig::from_json_str(
            r#"{"datastores": {"x": {"type": "oracle"}}, "entity_schemas": {}}"#,
        );
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_missing_schemas() {
        let result = AppConfig::from_json_str(r#"{"datastores": {"pg": {"type": "postgres"}}}"#);
        assert!(matches!(result, Err(ConfigError::NoSchemas(alias)) if alias == "pg"));
    }

    #[test]
    fn test_nested_entities_rejected_for_sql() {
        let result = AppConfig::from_json_str(
            r#"{
                "datastores": {"pg": {"type": "postgres"}},
                "entity_schemas": {"pg": {"public": {"entities": [
                    {"name": "apps", "entities": [{"name": "rights"}]}
                ]}}}
            }"#,
        );
        assert!(matches!(
            result,
            Err(ConfigError::NestedEntitiesUnsupported { .. })
        ));
    }

    #[test]
    fn test_duplicate_entity_across_schemas() {
        let result = AppConfig::from_json_str(
            r#"{
                "datastores": {"pg": {"type": "postgres"}},
                "entity_schemas": {"pg": {
                    "public": {"entities": [{"name": "users"}]},
                    "audit": {"entities": [{"name": "audit_users", "alias": "users"}]}
                }}
            }"#,
        );
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateEntity { entity, .. }) if entity == "users"
        ));
    }

    #[test]
    fn test_aliased_copy_of_table_rejected() {
        let result = AppConfig::from_json_str(
            r#"{
                "datastores": {"pg": {"type": "postgres"}},
                "entity_schemas": {"pg": {
                    "public": {"entities": [{"name": "users"}, {"name": "users", "alias": "managers"}]}
                }}
            }"#,
        );
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateTable { schema, table, .. }) if schema == "public" && table == "users"
        ));

        // the same table name in different schemas is fine
        let config = AppConfig::from_json_str(
            r#"{
                "datastores": {"pg": {"type": "postgres"}},
                "entity_schemas": {"pg": {
                    "public": {"entities": [{"name": "users"}]},
                    "audit": {"entities": [{"name": "users", "alias": "audit_users"}]}
                }}
            }"#,
        );
        assert!(config.is_ok());
    }

    #[test]
    fn test_schema_for_unknown_datastore() {
        let result = AppConfig::from_json_str(
            r#"{
                "datastores": {},
                "entity_schemas": {"ghost": {"public": {"entities": [{"name": "users"}]}}}
            }"#,
        );
        assert!(matches!(result, Err(ConfigError::UnknownDatastore(alias)) if alias == "ghost"));
    }
}
