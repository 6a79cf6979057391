use serde::Deserialize;

use crate::Config;
use crate::shared::{
    BackfillConfig, BusConfig, ChannelsConfig, ColumnMappingConfig, PipelineConfig, RetryConfig,
    SourceConfig, ValidationError,
};

/// Complete configuration of the publisher service.
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    pub source: SourceConfig,
    pub bus: BusConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub mapping: ColumnMappingConfig,
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.source.validate()?;
        self.bus.validate()?;
        self.pipeline_config().validate()
    }

    /// Returns the settings of the pipeline run by the publisher.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            mapping: self.mapping.clone(),
            channels: self.channels.clone(),
            backfill: self.backfill.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl Config for PublisherConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}
