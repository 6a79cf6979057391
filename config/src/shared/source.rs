use serde::Deserialize;

use crate::shared::{PgConnectionConfig, ValidationError};

/// Where the replication log is read from.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub connection: PgConnectionConfig,
    /// Publication covering the watched tables. Must exist beforehand.
    pub publication_name: String,
    /// Logical replication slot, created on first start when missing.
    pub slot_name: String,
}

impl SourceConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.connection.validate()?;

        if self.publication_name.is_empty() {
            return Err(ValidationError::invalid_field(
                "source.publication_name",
                "must not be empty",
            ));
        }
        if self.slot_name.is_empty() {
            return Err(ValidationError::invalid_field(
                "source.slot_name",
                "must not be empty",
            ));
        }

        Ok(())
    }
}
