use cdc::bus::Broker;
use cdc::bus::memory::MemoryBroker;
use cdc::bus::redis::RedisBroker;
use cdc::pipeline::{Pipeline, watched_tables};
use cdc::source::LogSource;
use cdc::source::pg::PgLogSource;
use config::shared::{BusConfig, PublisherConfig};
use tracing::{error, info, warn};

// Pipelines are generic over the broker, so each broker type gets its own instantiation.
macro_rules! start_pipeline_dispatch {
    ($pipeline_config:expr, $source:expr, $broker:expr) => {{
        let pipeline = Pipeline::new($pipeline_config, $source, $broker);
        start_pipeline(pipeline).await
    }};
}

pub async fn start_publisher(publisher_config: PublisherConfig) -> anyhow::Result<()> {
    install_crypto_provider();

    let pipeline_config = publisher_config.pipeline_config();
    let watched = watched_tables(&pipeline_config);
    info!(
        publication = %publisher_config.source.publication_name,
        slot = %publisher_config.source.slot_name,
        tables = watched.len(),
        "starting publisher"
    );

    let source = PgLogSource::new(publisher_config.source.clone(), watched);

    match &publisher_config.bus {
        BusConfig::Memory => {
            warn!("using the in-process bus, changes are only visible inside this process");
            let broker = MemoryBroker::new();

            start_pipeline_dispatch!(pipeline_config, source, broker)?;
        }
        BusConfig::Redis(redis_config) => {
            let broker = RedisBroker::connect(redis_config.clone()).await?;

            start_pipeline_dispatch!(pipeline_config, source, broker)?;
        }
    }

    info!("publisher stopped");

    Ok(())
}

/// Installs the process wide TLS crypto provider used by Postgres connections.
fn install_crypto_provider() {
    // Fails only when a provider is already installed, which is fine.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

async fn start_pipeline<L, B>(mut pipeline: Pipeline<L, B>) -> anyhow::Result<()>
where
    L: LogSource,
    B: Broker + Clone + Send + Sync + 'static,
{
    pipeline.start().await?;

    let shutdown_tx = pipeline.shutdown_tx();
    let shutdown_handle = tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl+c: {err}");
            return;
        }

        info!("ctrl+c received, shutting down publisher");
        shutdown_tx.shutdown();
    });

    let result = pipeline.wait().await;

    // The pipeline can also stop on its own, in which case the signal listener is not needed.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    result?;

    Ok(())
}
