use crate::shared::{
    BackfillConfig, ChannelsConfig, ColumnMappingConfig, RetryConfig, ValidationError,
};

/// Settings of a reader and dispatcher pair, independent of the source and bus they use.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mapping: ColumnMappingConfig,
    pub channels: ChannelsConfig,
    pub backfill: BackfillConfig,
    pub retry: RetryConfig,
}

impl PipelineConfig {
    pub fn new(mapping: ColumnMappingConfig) -> Self {
        Self {
            mapping,
            channels: ChannelsConfig::default(),
            backfill: BackfillConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.channels.validate()?;
        self.backfill.validate()?;
        self.retry.validate()?;
        self.mapping.validate()?;

        if let Some(marker) = &self.backfill.marker_table
            && self.mapping.tables.iter().any(|table| &table.table == marker)
        {
            return Err(ValidationError::invalid_field(
                "backfill.marker_table",
                "must not be one of the mapped tables",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::TableReference;

    #[test]
    fn marker_table_must_not_be_mapped() {
        let mapping: ColumnMappingConfig = serde_json::from_str(
            r#"{"version": 1, "tables": [{"name": "t", "fields": [{"index": 0, "name": "dt", "type": "int"}]}]}"#,
        )
        .unwrap();
        let mut config = PipelineConfig::new(mapping);
        assert!(config.validate().is_ok());

        config.backfill.marker_table = Some(TableReference {
            schema: "public".to_string(),
            name: "t".to_string(),
        });
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidFieldValue { ref field, .. }) if field == "backfill.marker_table"
        ));
    }
}
