use std::fmt;

use pg_escape::quote_literal;

/// A fully qualified Postgres table name.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> TableName {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Returns the schema and table name escaped as string literals, for catalog lookups.
    pub fn as_quoted_literals(&self) -> (String, String) {
        (
            quote_literal(&self.schema),
            quote_literal(&self.name),
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A column as described by `information_schema.columns`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    /// The `data_type` column, e.g. `integer` or `double precision`.
    pub data_type: String,
    /// 1-based position of the column in the table.
    pub ordinal_position: i32,
    pub nullable: bool,
}

impl ColumnSchema {
    pub fn new(
        name: impl Into<String>,
        data_type: impl Into<String>,
        ordinal_position: i32,
        nullable: bool,
    ) -> ColumnSchema {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            ordinal_position,
            nullable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_schema_and_name_unquoted() {
        let table = TableName::new("public", "Weather Data");
        assert_eq!(table.to_string(), "public.Weather Data");
    }

    #[test]
    fn quoted_literals_escape_quotes() {
        let table = TableName::new("public", "o'brien");
        let (schema, name) = table.as_quoted_literals();
        assert_eq!(schema, "'public'");
        assert_eq!(name, "'o''brien'");
    }
}
