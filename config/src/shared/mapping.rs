use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;

use crate::shared::ValidationError;

/// A schema qualified table name as written in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct TableReference {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub name: String,
}

fn default_schema() -> String {
    "public".to_string()
}

impl fmt::Display for TableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Type a replicated column is decoded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int,
    Float,
    Text,
    Bool,
    Timestamp,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Text => "text",
            FieldType::Bool => "bool",
            FieldType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// One column of a watched table.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldMappingConfig {
    /// Zero based ordinal of the column in the replicated tuple.
    pub index: usize,
    /// Column name, used both for schema validation and as the event field name.
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableMappingConfig {
    #[serde(flatten)]
    pub table: TableReference,
    pub fields: Vec<FieldMappingConfig>,
}

/// Versioned mapping from replicated column positions to event fields.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMappingConfig {
    pub version: u32,
    pub tables: Vec<TableMappingConfig>,
}

impl ColumnMappingConfig {
    pub const SUPPORTED_VERSION: u32 = 1;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.version != Self::SUPPORTED_VERSION {
            return Err(ValidationError::UnsupportedMappingVersion {
                found: self.version,
                expected: Self::SUPPORTED_VERSION,
            });
        }
        if self.tables.is_empty() {
            return Err(ValidationError::NoWatchedTables);
        }

        let mut tables = HashSet::new();
        for table in &self.tables {
            if !tables.insert(&table.table) {
                return Err(ValidationError::DuplicateMapping {
                    table: table.table.to_string(),
                    what: "table",
                    value: table.table.to_string(),
                });
            }
            table.validate()?;
        }

        Ok(())
    }
}

impl TableMappingConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.fields.is_empty() {
            return Err(ValidationError::invalid_field(
                format!("mapping.tables[{}].fields", self.table),
                "must contain at least one field",
            ));
        }

        let mut indexes = HashSet::new();
        let mut names = HashSet::new();
        for field in &self.fields {
            if !indexes.insert(field.index) {
                return Err(ValidationError::DuplicateMapping {
                    table: self.table.to_string(),
                    what: "index",
                    value: field.index.to_string(),
                });
            }
            if !names.insert(field.name.as_str()) {
                return Err(ValidationError::DuplicateMapping {
                    table: self.table.to_string(),
                    what: "field",
                    value: field.name.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(json: &str) -> ColumnMappingConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn deserializes_flattened_table_reference() {
        let config = mapping(
            r#"{"version": 1, "tables": [{"name": "t", "fields": [{"index": 0, "name": "dt", "type": "int"}]}]}"#,
        );
        assert_eq!(config.tables[0].table.to_string(), "public.t");
        assert_eq!(config.tables[0].fields[0].field_type, FieldType::Int);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_indexes_are_rejected() {
        let config = mapping(
            r#"{"version": 1, "tables": [{"name": "t", "fields": [
                {"index": 0, "name": "a", "type": "int"},
                {"index": 0, "name": "b", "type": "float"}
            ]}]}"#,
        );
        assert!(matches!(
            config.validate(),
            Err(ValidationError::DuplicateMapping { what: "index", .. })
        ));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let config = mapping(r#"{"version": 2, "tables": []}"#);
        assert!(matches!(
            config.validate(),
            Err(ValidationError::UnsupportedMappingVersion { found: 2, .. })
        ));
    }

    #[test]
    fn empty_tables_are_rejected() {
        let config = mapping(r#"{"version": 1, "tables": []}"#);
        assert!(matches!(config.validate(), Err(ValidationError::NoWatchedTables)));
    }
}
