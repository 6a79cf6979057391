use config::load_config;
use config::shared::PublisherConfig;

/// Loads the publisher configuration and validates it.
pub fn load_publisher_config() -> anyhow::Result<PublisherConfig> {
    let config = load_config::<PublisherConfig>()?;
    config.validate()?;

    Ok(config)
}
