//! Versioned mapping from replicated column positions to typed event fields.
//!
//! The mapping is checked once against the live table schema before streaming starts, and
//! every row is checked again while decoding so that a table altered at runtime surfaces as
//! a decode error instead of silently shifting values between fields.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use config::shared::{ColumnMappingConfig, FieldMappingConfig, FieldType, TableReference};
use postgres::schema::{ColumnSchema, TableName};

use crate::error::{ErrorKind, EtlResult};
use crate::source::RawRowEvent;
use crate::types::{ChangeEvent, RowValues, TIMESTAMP_FORMAT, Value};
use crate::{bail, etl_error};

#[derive(Debug, Clone)]
struct TableMapping {
    qualified_name: String,
    fields: Vec<FieldMappingConfig>,
}

/// Column mapping of every watched table.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    tables: HashMap<TableName, TableMapping>,
}

impl ColumnMapping {
    pub fn new(config: &ColumnMappingConfig) -> EtlResult<Self> {
        config.validate()?;

        let tables = config
            .tables
            .iter()
            .map(|table| {
                let name = table_name(&table.table);
                let mapping = TableMapping {
                    qualified_name: name.to_string(),
                    fields: table.fields.clone(),
                };
                (name, mapping)
            })
            .collect();

        Ok(Self { tables })
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableName> {
        self.tables.keys()
    }

    pub fn contains(&self, table: &TableName) -> bool {
        self.tables.contains_key(table)
    }

    /// Checks the mapping of `table` against its live columns.
    ///
    /// Every mapped index must exist, carry the mapped name and have a data type
    /// compatible with the mapped field type.
    pub fn validate(&self, table: &TableName, columns: &[ColumnSchema]) -> EtlResult<()> {
        let Some(mapping) = self.tables.get(table) else {
            bail!(
                ErrorKind::SourceSchemaError,
                "Table is not mapped",
                format!("no column mapping exists for table {table}")
            );
        };

        if columns.is_empty() {
            bail!(
                ErrorKind::SourceSchemaError,
                "Watched table not found",
                format!("table {table} does not exist or has no columns")
            );
        }

        let mut ordered: Vec<&ColumnSchema> = columns.iter().collect();
        ordered.sort_by_key(|column| column.ordinal_position);

        for field in &mapping.fields {
            let Some(column) = ordered.get(field.index) else {
                bail!(
                    ErrorKind::SourceSchemaError,
                    "Mapped column index out of range",
                    format!(
                        "field `{}` maps index {} but table {table} has {} columns",
                        field.name,
                        field.index,
                        ordered.len()
                    )
                );
            };

            if column.name != field.name {
                bail!(
                    ErrorKind::SourceSchemaError,
                    "Mapped column name mismatch",
                    format!(
                        "index {} of table {table} is column `{}`, mapping expects `{}`",
                        field.index, column.name, field.name
                    )
                );
            }

            if !is_compatible(field.field_type, &column.data_type) {
                bail!(
                    ErrorKind::SourceSchemaError,
                    "Mapped column type mismatch",
                    format!(
                        "column `{}` of table {table} has type `{}`, which cannot be decoded as {}",
                        column.name, column.data_type, field.field_type
                    )
                );
            }
        }

        Ok(())
    }

    /// Decodes a raw row into a [`ChangeEvent`] with values in mapping order.
    pub fn decode(&self, row: &RawRowEvent) -> EtlResult<ChangeEvent> {
        let Some(mapping) = self.tables.get(&row.table) else {
            bail!(
                ErrorKind::InvalidData,
                "Row belongs to an unmapped table",
                format!("no column mapping exists for table {}", row.table)
            );
        };

        if row.columns.len() != row.values.len() {
            bail!(
                ErrorKind::InvalidData,
                "Row shape does not match its columns",
                format!(
                    "table {} sent {} values for {} columns",
                    row.table,
                    row.values.len(),
                    row.columns.len()
                )
            );
        }

        let mut values = RowValues::with_capacity(mapping.fields.len());
        for field in &mapping.fields {
            match row.columns.get(field.index) {
                Some(column) if *column == field.name => {}
                Some(column) => bail!(
                    ErrorKind::InvalidData,
                    "Row columns drifted from the mapping",
                    format!(
                        "index {} of table {} is now column `{column}`, mapping expects `{}`",
                        field.index, row.table, field.name
                    )
                ),
                None => bail!(
                    ErrorKind::InvalidData,
                    "Row columns drifted from the mapping",
                    format!(
                        "table {} sent {} columns, mapping expects index {}",
                        row.table,
                        row.columns.len(),
                        field.index
                    )
                ),
            }

            let value = match &row.values[field.index] {
                Some(text) => parse_value(field, text)?,
                None => Value::Null,
            };
            values.push(field.name.clone(), value);
        }

        Ok(ChangeEvent::new(
            mapping.qualified_name.clone(),
            values,
            row.change_type,
        ))
    }
}

/// Converts a configured table reference into a [`TableName`].
pub fn table_name(reference: &TableReference) -> TableName {
    TableName::new(reference.schema.clone(), reference.name.clone())
}

fn is_compatible(field_type: FieldType, data_type: &str) -> bool {
    match field_type {
        FieldType::Int => matches!(data_type, "smallint" | "integer" | "bigint"),
        FieldType::Float => matches!(data_type, "real" | "double precision" | "numeric"),
        FieldType::Text => matches!(data_type, "text" | "character varying" | "character"),
        FieldType::Bool => data_type == "boolean",
        FieldType::Timestamp => data_type == "timestamp without time zone",
    }
}

fn parse_value(field: &FieldMappingConfig, text: &str) -> EtlResult<Value> {
    let value = match field.field_type {
        FieldType::Int => Value::Int(text.parse::<i64>().map_err(|err| {
            etl_error!(
                ErrorKind::ConversionError,
                "Column value is not an integer",
                format!("column `{}` has value `{text}`", field.name),
                source: err
            )
        })?),
        FieldType::Float => Value::Float(text.parse::<f64>().map_err(|err| {
            etl_error!(
                ErrorKind::ConversionError,
                "Column value is not a float",
                format!("column `{}` has value `{text}`", field.name),
                source: err
            )
        })?),
        FieldType::Bool => match text {
            "t" | "true" => Value::Bool(true),
            "f" | "false" => Value::Bool(false),
            _ => bail!(
                ErrorKind::ConversionError,
                "Column value is not a boolean",
                format!("column `{}` has value `{text}`", field.name)
            ),
        },
        FieldType::Timestamp => Value::Timestamp(
            NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).map_err(|err| {
                etl_error!(
                    ErrorKind::ConversionError,
                    "Column value is not a timestamp",
                    format!("column `{}` has value `{text}`", field.name),
                    source: err
                )
            })?,
        ),
        FieldType::Text => Value::Text(text.to_string()),
    };

    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use config::shared::TableMappingConfig;

    use super::*;
    use crate::types::ChangeType;

    fn field(index: usize, name: &str, field_type: FieldType) -> FieldMappingConfig {
        FieldMappingConfig {
            index,
            name: name.to_string(),
            field_type,
        }
    }

    fn mapping() -> ColumnMapping {
        let config = ColumnMappingConfig {
            version: 1,
            tables: vec![TableMappingConfig {
                table: TableReference {
                    schema: "public".to_string(),
                    name: "readings".to_string(),
                },
                fields: vec![
                    field(0, "dt", FieldType::Int),
                    field(1, "temp", FieldType::Float),
                    field(2, "station", FieldType::Text),
                    field(3, "valid", FieldType::Bool),
                    field(4, "observed_at", FieldType::Timestamp),
                ],
            }],
        };

        ColumnMapping::new(&config).unwrap()
    }

    fn live_columns() -> Vec<ColumnSchema> {
        vec![
            ColumnSchema::new("temp", "double precision", 2, true),
            ColumnSchema::new("dt", "bigint", 1, false),
            ColumnSchema::new("station", "character varying", 3, true),
            ColumnSchema::new("valid", "boolean", 4, true),
            ColumnSchema::new("observed_at", "timestamp without time zone", 5, true),
        ]
    }

    fn raw(columns: &[&str], values: Vec<Option<&str>>) -> RawRowEvent {
        RawRowEvent {
            table: TableName::new("public", "readings"),
            change_type: ChangeType::Update,
            columns: columns.iter().map(|c| c.to_string()).collect::<Arc<[String]>>(),
            values: values.into_iter().map(|v| v.map(str::to_string)).collect(),
        }
    }

    const COLUMNS: [&str; 5] = ["dt", "temp", "station", "valid", "observed_at"];

    #[test]
    fn validate_accepts_matching_schema_in_any_order() {
        let table = TableName::new("public", "readings");
        mapping().validate(&table, &live_columns()).unwrap();
    }

    #[test]
    fn validate_rejects_renamed_column() {
        let table = TableName::new("public", "readings");
        let mut columns = live_columns();
        columns[0].name = "temperature".to_string();

        let err = mapping().validate(&table, &columns).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceSchemaError);
    }

    #[test]
    fn validate_rejects_incompatible_type() {
        let table = TableName::new("public", "readings");
        let mut columns = live_columns();
        columns[1].data_type = "text".to_string();

        let err = mapping().validate(&table, &columns).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceSchemaError);
    }

    #[test]
    fn validate_rejects_missing_table() {
        let table = TableName::new("public", "readings");
        let err = mapping().validate(&table, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceSchemaError);
    }

    #[test]
    fn decode_parses_every_declared_type() {
        let row = raw(
            &COLUMNS,
            vec![
                Some("1700000000"),
                Some("12.75"),
                Some("north"),
                Some("t"),
                Some("2024-03-01 12:30:00.5"),
            ],
        );

        let event = mapping().decode(&row).unwrap();
        assert_eq!(event.table, "public.readings");
        assert_eq!(event.change_type, ChangeType::Update);
        assert_eq!(event.values.get("dt"), Some(&Value::Int(1_700_000_000)));
        assert_eq!(event.values.get("temp"), Some(&Value::Float(12.75)));
        assert_eq!(event.values.get("station").and_then(Value::as_str), Some("north"));
        assert_eq!(event.values.get("valid"), Some(&Value::Bool(true)));
        assert!(matches!(
            event.values.get("observed_at"),
            Some(Value::Timestamp(_))
        ));
    }

    #[test]
    fn decode_maps_nulls() {
        let row = raw(&COLUMNS, vec![Some("1"), None, None, None, None]);

        let event = mapping().decode(&row).unwrap();
        assert!(event.values.get("temp").unwrap().is_null());
        assert_eq!(event.values.len(), 5);
    }

    #[test]
    fn decode_fails_on_unparsable_cell() {
        let row = raw(&COLUMNS, vec![Some("soon"), None, None, None, None]);

        let err = mapping().decode(&row).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConversionError);
        assert!(err.kind().is_decode_error());
    }

    #[test]
    fn decode_fails_when_columns_drift() {
        let row = raw(
            &["dt", "temperature", "station", "valid", "observed_at"],
            vec![Some("1"), Some("2.0"), None, None, None],
        );

        let err = mapping().decode(&row).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.kind().is_decode_error());
    }
}
