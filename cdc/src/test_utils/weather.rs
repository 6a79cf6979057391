use std::sync::Arc;

use config::shared::{
    ColumnMappingConfig, FieldMappingConfig, FieldType, PipelineConfig, RetryConfig,
    TableMappingConfig, TableReference,
};
use postgres::schema::{ColumnSchema, TableName};

use crate::source::memory::MemoryLog;
use crate::types::{ChangeType, ReplicationPosition};

pub const WEATHER_SCHEMA: &str = "public";
pub const WEATHER_TABLE: &str = "processed_weather_data";
pub const MARKER_TABLE: &str = "initial_load_marker";

/// Columns of the weather table with their mapped and live types.
const WEATHER_COLUMNS: [(&str, FieldType, &str); 8] = [
    ("dt", FieldType::Int, "bigint"),
    ("temp", FieldType::Float, "double precision"),
    ("pressure", FieldType::Int, "integer"),
    ("humidity", FieldType::Int, "integer"),
    ("clouds", FieldType::Int, "integer"),
    ("visibility", FieldType::Int, "integer"),
    ("wind_speed", FieldType::Float, "double precision"),
    ("wind_deg", FieldType::Int, "integer"),
];

pub fn weather_table() -> TableName {
    TableName::new(WEATHER_SCHEMA, WEATHER_TABLE)
}

pub fn marker_table() -> TableName {
    TableName::new(WEATHER_SCHEMA, MARKER_TABLE)
}

pub fn weather_mapping_config() -> ColumnMappingConfig {
    ColumnMappingConfig {
        version: ColumnMappingConfig::SUPPORTED_VERSION,
        tables: vec![TableMappingConfig {
            table: TableReference {
                schema: WEATHER_SCHEMA.to_string(),
                name: WEATHER_TABLE.to_string(),
            },
            fields: WEATHER_COLUMNS
                .iter()
                .enumerate()
                .map(|(index, (name, field_type, _))| FieldMappingConfig {
                    index,
                    name: name.to_string(),
                    field_type: *field_type,
                })
                .collect(),
        }],
    }
}

/// Live schema of the weather table.
pub fn weather_schema() -> Vec<ColumnSchema> {
    WEATHER_COLUMNS
        .iter()
        .enumerate()
        .map(|(index, (name, _, data_type))| {
            ColumnSchema::new(*name, *data_type, index as i32 + 1, index != 0)
        })
        .collect()
}

pub fn weather_columns() -> Arc<[String]> {
    WEATHER_COLUMNS
        .iter()
        .map(|(name, _, _)| name.to_string())
        .collect()
}

/// Text cells of a weather row measured at `dt`. Float cells are never integral.
pub fn weather_row(dt: i64) -> Vec<Option<String>> {
    let step = dt % 100;
    vec![
        Some(dt.to_string()),
        Some(format!("{}.5", 10 + step % 20)),
        Some((1000 + step).to_string()),
        Some((40 + step % 50).to_string()),
        None,
        Some("10000".to_string()),
        Some(format!("{}.25", step % 15)),
        Some((step * 3 % 360).to_string()),
    ]
}

/// A memory log describing the weather and marker tables.
pub fn weather_log() -> MemoryLog {
    let log = MemoryLog::new();
    log.define_table(weather_table(), weather_schema());
    log.define_table(
        marker_table(),
        vec![ColumnSchema::new("id", "integer", 1, false)],
    );

    log
}

/// Appends weather inserts for every `dt` in `dts`, returning their positions.
pub fn append_weather_rows(
    log: &MemoryLog,
    dts: impl IntoIterator<Item = i64>,
) -> Vec<ReplicationPosition> {
    let columns = weather_columns();
    dts.into_iter()
        .map(|dt| {
            log.append(
                weather_table(),
                ChangeType::Insert,
                columns.clone(),
                weather_row(dt),
            )
        })
        .collect()
}

pub fn append_marker_row(log: &MemoryLog) -> ReplicationPosition {
    log.append(
        marker_table(),
        ChangeType::Insert,
        Arc::from(vec!["id".to_string()]),
        vec![Some("1".to_string())],
    )
}

/// Fast retry delays for tests.
pub fn test_retry_config() -> RetryConfig {
    RetryConfig {
        reader_reconnect_delay_ms: 50,
        reader_poll_timeout_ms: 50,
        bus_retry_delay_ms: 50,
        readiness_poll_interval_ms: 100,
    }
}

/// Pipeline settings for the weather table with the given row threshold.
pub fn test_pipeline_config(row_threshold: u64) -> PipelineConfig {
    let mut config = PipelineConfig::new(weather_mapping_config());
    config.backfill.row_threshold = row_threshold;
    config.retry = test_retry_config();

    config
}

/// `dt` values of the events in `payloads`, in order.
pub fn payload_dts(payloads: &[String]) -> Vec<i64> {
    payloads
        .iter()
        .filter_map(|payload| {
            crate::types::ChangeEvent::from_payload(payload)
                .ok()
                .and_then(|event| event.values.get("dt").and_then(|value| value.as_i64()))
        })
        .collect()
}
