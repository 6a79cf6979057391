//! Configuration types shared by the publisher and by consumer listeners.

mod backfill;
mod base;
mod bus;
mod channels;
mod connection;
mod listener;
mod mapping;
mod pipeline;
mod publisher;
mod retry;
mod source;

pub use backfill::BackfillConfig;
pub use base::ValidationError;
pub use bus::{BusConfig, RedisConfig};
pub use channels::ChannelsConfig;
pub use connection::{
    CDC_REPLICATION_OPTIONS, CDC_SCHEMA_OPTIONS, IntoConnectOptions, PgConnectionConfig,
    PgConnectionOptions, TlsConfig,
};
pub use listener::ListenerConfig;
pub use mapping::{
    ColumnMappingConfig, FieldMappingConfig, FieldType, TableMappingConfig, TableReference,
};
pub use pipeline::PipelineConfig;
pub use publisher::PublisherConfig;
pub use retry::RetryConfig;
pub use source::SourceConfig;
