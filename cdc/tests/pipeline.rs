#![cfg(feature = "test-utils")]

use std::time::Duration;

use cdc::bus::Broker;
use cdc::bus::memory::MemoryBroker;
use cdc::error::ErrorKind;
use cdc::pipeline::{Pipeline, watched_tables};
use cdc::readiness::ReadinessGate;
use cdc::source::memory::MemoryLog;
use cdc::test_utils::broker::{BrokerOp, TestBrokerWrapper};
use cdc::test_utils::notify::wait_for;
use cdc::test_utils::weather::{
    MARKER_TABLE, WEATHER_SCHEMA, append_marker_row, append_weather_rows, marker_table,
    payload_dts, test_pipeline_config, weather_columns, weather_log, weather_row, weather_table,
};
use cdc::types::{ChangeEvent, ChangeType};
use cdc::workers::dispatcher::READINESS_FLAG_SET;
use cdc::workers::reader::ReaderStatus;
use config::shared::{ChannelsConfig, PipelineConfig, TableReference};
use postgres::schema::ColumnSchema;
use telemetry::tracing::init_test_tracing;
use tokio::time::timeout;

type TestBroker = TestBrokerWrapper<MemoryBroker>;

async fn start_pipeline(
    config: PipelineConfig,
    log: &MemoryLog,
    broker: &TestBroker,
) -> Pipeline<cdc::source::memory::MemoryLogSource, TestBroker> {
    let mut pipeline = Pipeline::new(config, log.source(), broker.clone());
    pipeline.start().await.unwrap();

    pipeline
}

async fn wait_for_confirmed(log: &MemoryLog, count: usize) {
    wait_for(|| {
        let log = log.clone();
        async move { log.confirmed_positions().len() >= count }
    })
    .await;
}

fn is_flag_set(op: &BrokerOp) -> bool {
    matches!(op, BrokerOp::Set { key, value }
        if key == ChannelsConfig::DEFAULT_READINESS_KEY && value == READINESS_FLAG_SET)
}

fn is_status_publish(op: &BrokerOp) -> bool {
    matches!(op, BrokerOp::Publish { topic, .. } if topic == ChannelsConfig::DEFAULT_STATUS_TOPIC)
}

fn is_change_publish(op: &BrokerOp) -> bool {
    matches!(op, BrokerOp::Publish { topic, .. } if topic == ChannelsConfig::DEFAULT_CHANGE_TOPIC)
}

#[tokio::test(flavor = "multi_thread")]
async fn buffered_rows_are_replayed_in_order_at_the_threshold() {
    init_test_tracing();

    let log = weather_log();
    append_weather_rows(&log, [1, 2, 3, 4]);
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());

    let published = broker
        .wait_for_publishes(ChannelsConfig::DEFAULT_CHANGE_TOPIC, 4)
        .await;
    let pipeline = start_pipeline(test_pipeline_config(3), &log, &broker).await;
    published.notified().await;

    let payloads = broker.published(ChannelsConfig::DEFAULT_CHANGE_TOPIC).await;
    assert_eq!(payload_dts(&payloads), vec![1, 2, 3, 4]);

    let event = ChangeEvent::from_payload(&payloads[0]).unwrap();
    assert_eq!(event.table, "public.processed_weather_data");
    assert_eq!(event.change_type, ChangeType::Insert);
    assert_eq!(event.values.len(), 8);
    assert!(event.values.get("clouds").unwrap().is_null());

    assert_eq!(
        broker.published(ChannelsConfig::DEFAULT_STATUS_TOPIC).await,
        vec![ChannelsConfig::DEFAULT_STATUS_MESSAGE.to_string()]
    );
    assert_eq!(
        broker
            .wrapped()
            .get(ChannelsConfig::DEFAULT_READINESS_KEY)
            .await
            .unwrap()
            .as_deref(),
        Some(READINESS_FLAG_SET)
    );

    // The flag is written before the broadcast, and both precede the replay.
    let ops = broker.ops().await;
    let flag = ops.iter().position(is_flag_set).unwrap();
    let status = ops.iter().position(is_status_publish).unwrap();
    let first_change = ops.iter().position(is_change_publish).unwrap();
    assert!(flag < status);
    assert!(status < first_change);

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rows_below_the_threshold_are_never_published() {
    init_test_tracing();

    let log = weather_log();
    append_weather_rows(&log, 1..=5);
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());

    let pipeline = start_pipeline(test_pipeline_config(10), &log, &broker).await;
    wait_for_confirmed(&log, 5).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(
        broker
            .published(ChannelsConfig::DEFAULT_CHANGE_TOPIC)
            .await
            .is_empty()
    );
    assert!(
        broker
            .published(ChannelsConfig::DEFAULT_STATUS_TOPIC)
            .await
            .is_empty()
    );
    assert!(broker.wrapped().values().await.is_empty());

    let state = pipeline.dispatcher_state().unwrap();
    assert_eq!(state.rows_seen, 5);
    assert_eq!(state.published, 0);

    let gate = ReadinessGate::new(
        broker.clone(),
        ChannelsConfig::default(),
        cdc::test_utils::weather::test_retry_config(),
    );
    assert!(
        timeout(Duration::from_millis(300), gate.wait_until_ready())
            .await
            .is_err()
    );

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn the_transition_happens_once() {
    init_test_tracing();

    let log = weather_log();
    append_weather_rows(&log, 1..=10);
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());

    let published = broker
        .wait_for_publishes(ChannelsConfig::DEFAULT_CHANGE_TOPIC, 10)
        .await;
    let pipeline = start_pipeline(test_pipeline_config(2), &log, &broker).await;
    published.notified().await;

    let ops = broker.ops().await;
    assert_eq!(ops.iter().filter(|op| is_flag_set(op)).count(), 1);
    assert_eq!(ops.iter().filter(|op| is_status_publish(op)).count(), 1);
    assert_eq!(
        payload_dts(&broker.published(ChannelsConfig::DEFAULT_CHANGE_TOPIC).await),
        (1..=10).collect::<Vec<_>>()
    );

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn marker_row_completes_the_initial_load_early() {
    init_test_tracing();

    let log = weather_log();
    append_weather_rows(&log, [1, 2]);
    append_marker_row(&log);
    append_weather_rows(&log, [3]);
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());

    let mut config = test_pipeline_config(1000);
    config.backfill.marker_table = Some(TableReference {
        schema: WEATHER_SCHEMA.to_string(),
        name: MARKER_TABLE.to_string(),
    });
    assert!(watched_tables(&config).contains(&marker_table()));
    assert!(watched_tables(&config).contains(&weather_table()));

    let published = broker
        .wait_for_publishes(ChannelsConfig::DEFAULT_CHANGE_TOPIC, 3)
        .await;
    let pipeline = start_pipeline(config, &log, &broker).await;
    published.notified().await;

    let payloads = broker.published(ChannelsConfig::DEFAULT_CHANGE_TOPIC).await;
    assert_eq!(payload_dts(&payloads), vec![1, 2, 3]);
    assert_eq!(
        broker
            .published(ChannelsConfig::DEFAULT_STATUS_TOPIC)
            .await
            .len(),
        1
    );

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_after_completed_load_publishes_right_away() {
    init_test_tracing();

    let log = weather_log();
    append_weather_rows(&log, [1, 2]);
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());
    broker
        .wrapped()
        .set(ChannelsConfig::DEFAULT_READINESS_KEY, READINESS_FLAG_SET)
        .await
        .unwrap();

    let published = broker
        .wait_for_publishes(ChannelsConfig::DEFAULT_CHANGE_TOPIC, 2)
        .await;
    let pipeline = start_pipeline(test_pipeline_config(1000), &log, &broker).await;
    published.notified().await;

    assert_eq!(
        payload_dts(&broker.published(ChannelsConfig::DEFAULT_CHANGE_TOPIC).await),
        vec![1, 2]
    );
    let ops = broker.ops().await;
    assert!(!ops.iter().any(is_status_publish));
    assert!(!ops.iter().any(|op| matches!(op, BrokerOp::Set { .. })));

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn reader_resumes_after_a_disconnect_without_duplicates() {
    init_test_tracing();

    let log = weather_log();
    let positions = append_weather_rows(&log, 1..=5);
    log.disconnect_after(&positions[1]);
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());

    let published = broker
        .wait_for_publishes(ChannelsConfig::DEFAULT_CHANGE_TOPIC, 5)
        .await;
    let pipeline = start_pipeline(test_pipeline_config(1), &log, &broker).await;
    published.notified().await;

    assert_eq!(
        payload_dts(&broker.published(ChannelsConfig::DEFAULT_CHANGE_TOPIC).await),
        vec![1, 2, 3, 4, 5]
    );
    assert_eq!(
        log.opened_positions(),
        vec![None, Some(positions[1].clone())]
    );

    wait_for(|| {
        let reader = pipeline.reader_state().unwrap();
        let expected = Some(positions[4].clone());
        async move { reader.last_position == expected && reader.status == ReaderStatus::Streaming }
    })
    .await;

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_confirm_does_not_republish_the_handed_off_row() {
    init_test_tracing();

    let log = weather_log();
    let positions = append_weather_rows(&log, 1..=3);
    log.fail_confirm_of(&positions[1]);
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());

    let pipeline = start_pipeline(test_pipeline_config(1), &log, &broker).await;
    wait_for(|| {
        let reader = pipeline.reader_state().unwrap();
        let expected = Some(positions[2].clone());
        async move { reader.last_position == expected && reader.status == ReaderStatus::Streaming }
    })
    .await;
    wait_for(|| {
        let state = pipeline.dispatcher_state().unwrap();
        async move { state.published == 3 }
    })
    .await;

    assert_eq!(
        payload_dts(&broker.published(ChannelsConfig::DEFAULT_CHANGE_TOPIC).await),
        vec![1, 2, 3]
    );
    assert_eq!(
        log.opened_positions(),
        vec![None, Some(positions[1].clone())]
    );
    assert_eq!(log.confirmed_positions(), vec![positions[0].clone(), positions[2].clone()]);

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn undecodable_rows_are_skipped() {
    init_test_tracing();

    let log = weather_log();
    append_weather_rows(&log, [1]);
    let mut broken = weather_row(2);
    broken[0] = Some("not a number".to_string());
    log.append(weather_table(), ChangeType::Insert, weather_columns(), broken);
    append_weather_rows(&log, [3]);
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());

    let published = broker
        .wait_for_publishes(ChannelsConfig::DEFAULT_CHANGE_TOPIC, 2)
        .await;
    let pipeline = start_pipeline(test_pipeline_config(1), &log, &broker).await;
    published.notified().await;
    wait_for_confirmed(&log, 3).await;

    assert_eq!(
        payload_dts(&broker.published(ChannelsConfig::DEFAULT_CHANGE_TOPIC).await),
        vec![1, 3]
    );

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_publishes_drop_only_the_affected_event() {
    init_test_tracing();

    let log = weather_log();
    append_weather_rows(&log, 1..=3);
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());
    broker
        .fail_next_publishes(ChannelsConfig::DEFAULT_CHANGE_TOPIC, 1)
        .await;

    let published = broker
        .wait_for_publishes(ChannelsConfig::DEFAULT_CHANGE_TOPIC, 2)
        .await;
    let pipeline = start_pipeline(test_pipeline_config(1), &log, &broker).await;
    published.notified().await;

    assert_eq!(
        payload_dts(&broker.published(ChannelsConfig::DEFAULT_CHANGE_TOPIC).await),
        vec![2, 3]
    );

    wait_for(|| {
        let state = pipeline.dispatcher_state().unwrap();
        async move { state.dropped == 1 && state.published == 2 }
    })
    .await;

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn readiness_flag_write_is_retried() {
    init_test_tracing();

    let log = weather_log();
    append_weather_rows(&log, [1, 2]);
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());
    broker.fail_next_sets(2).await;

    let published = broker
        .wait_for_publishes(ChannelsConfig::DEFAULT_CHANGE_TOPIC, 2)
        .await;
    let pipeline = start_pipeline(test_pipeline_config(2), &log, &broker).await;
    published.notified().await;

    assert_eq!(
        broker
            .wrapped()
            .get(ChannelsConfig::DEFAULT_READINESS_KEY)
            .await
            .unwrap()
            .as_deref(),
        Some(READINESS_FLAG_SET)
    );
    assert_eq!(
        broker
            .published(ChannelsConfig::DEFAULT_STATUS_TOPIC)
            .await
            .len(),
        1
    );

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn live_rows_are_published_as_they_arrive() {
    init_test_tracing();

    let log = weather_log();
    append_weather_rows(&log, [1]);
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());

    let first = broker
        .wait_for_publishes(ChannelsConfig::DEFAULT_CHANGE_TOPIC, 1)
        .await;
    let pipeline = start_pipeline(test_pipeline_config(1), &log, &broker).await;
    first.notified().await;

    let second = broker
        .wait_for_publishes(ChannelsConfig::DEFAULT_CHANGE_TOPIC, 2)
        .await;
    append_weather_rows(&log, [2]);
    second.notified().await;

    assert_eq!(
        payload_dts(&broker.published(ChannelsConfig::DEFAULT_CHANGE_TOPIC).await),
        vec![1, 2]
    );

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_schema_fails_the_start() {
    init_test_tracing();

    let log = MemoryLog::new();
    let mut columns = cdc::test_utils::weather::weather_schema();
    columns[1] = ColumnSchema::new("temperature", "double precision", 2, true);
    log.define_table(weather_table(), columns);
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());

    let mut pipeline = Pipeline::new(test_pipeline_config(3), log.source(), broker.clone());
    let err = pipeline.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceSchemaError);
    assert!(log.opened_positions().is_empty());

    // A pipeline that failed to start has nothing to wait for.
    pipeline.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_table_fails_the_start() {
    init_test_tracing();

    let log = MemoryLog::new();
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());

    let mut pipeline = Pipeline::new(test_pipeline_config(3), log.source(), broker);
    let err = pipeline.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceSchemaError);
}

#[tokio::test(flavor = "multi_thread")]
async fn starting_twice_fails() {
    init_test_tracing();

    let log = weather_log();
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());

    let mut pipeline = Pipeline::new(test_pipeline_config(3), log.source(), broker);
    pipeline.start().await.unwrap();

    let err = pipeline.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_rows_already_queued() {
    init_test_tracing();

    let log = weather_log();
    append_weather_rows(&log, 1..=3);
    let broker = TestBrokerWrapper::wrap(MemoryBroker::new());

    let pipeline = start_pipeline(test_pipeline_config(1), &log, &broker).await;
    wait_for_confirmed(&log, 3).await;

    timeout(Duration::from_secs(5), pipeline.shutdown_and_wait())
        .await
        .unwrap()
        .unwrap();

    // Every row handed to the queue was published before the dispatcher exited.
    assert_eq!(
        payload_dts(&broker.published(ChannelsConfig::DEFAULT_CHANGE_TOPIC).await),
        vec![1, 2, 3]
    );
}
