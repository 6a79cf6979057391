use std::time::Duration;

use config::shared::RedisConfig;
use fred::prelude::{
    Client, ClientLike, EventInterface, KeysInterface, Pool, PubsubInterface, ReconnectPolicy,
    Server, ServerConfig, TcpConfig,
};
use fred::types::Builder;
use fred::types::config::UnresponsiveConfig;
use futures::future::join_all;
use secrecy::ExposeSecret;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::bus::{Broker, Subscription};
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;

const POOL_SIZE: usize = 5;

/// Broker backed by Redis keys and pub/sub channels.
///
/// Commands go through a pooled client that reconnects on its own. Every subscription uses
/// a dedicated connection that is not reconnected: when it fails the subscription ends and
/// the subscriber is expected to subscribe again.
#[derive(Clone)]
pub struct RedisBroker {
    config: RedisConfig,
    pool: Pool,
}

impl RedisBroker {
    pub async fn connect(config: RedisConfig) -> EtlResult<Self> {
        let pool = builder(&config)
            .set_policy(ReconnectPolicy::new_exponential(0, 1, 2000, 5))
            .build_pool(POOL_SIZE)?;

        for client in pool.clients() {
            spawn_event_logging(client);
        }

        let client_handles = pool.connect_pool();

        debug!("waiting for redis pool to connect");
        pool.wait_for_connect().await?;
        info!(host = %config.host, port = config.port, "connected to redis");

        tokio::spawn(async move {
            let _results = join_all(client_handles).await;
        });

        Ok(Self { config, pool })
    }
}

fn builder(config: &RedisConfig) -> Builder {
    let mut builder = Builder::default_centralized();
    builder
        .with_config(|redis_config| {
            redis_config.password = config
                .password
                .as_ref()
                .map(|password| password.expose_secret().to_string());
            redis_config.username = config.username.clone();
            redis_config.server = ServerConfig::Centralized {
                server: Server::new(config.host.clone(), config.port),
            };
        })
        .with_connection_config(|config| {
            config.internal_command_timeout = Duration::from_secs(5);
            config.reconnect_on_auth_error = true;
            config.tcp = TcpConfig {
                #[cfg(target_os = "linux")]
                user_timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            };
            config.unresponsive = UnresponsiveConfig {
                max_timeout: Some(Duration::from_secs(10)),
                interval: Duration::from_secs(3),
            };
        })
        .with_performance_config(|config| {
            config.default_command_timeout = Duration::from_secs(5);
        });

    builder
}

/// Logs connection events of `client` until it is dropped.
fn spawn_event_logging(client: &Client) {
    let mut error_rx = client.error_rx();
    let mut reconnect_rx = client.reconnect_rx();
    let mut unresponsive_rx = client.unresponsive_rx();

    tokio::spawn(async move {
        loop {
            match error_rx.recv().await {
                Ok((error, Some(server))) => {
                    warn!("redis client ({server:?}) error: {error:?}");
                }
                Ok((error, None)) => {
                    warn!("redis client error: {error:?}");
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match unresponsive_rx.recv().await {
                Ok(server) => {
                    error!("redis client ({server:?}) unresponsive");
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match reconnect_rx.recv().await {
                Ok(server) => {
                    debug!("redis client connected to {server:?}")
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}

impl Broker for RedisBroker {
    fn name() -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> EtlResult<Option<String>> {
        Ok(self.pool.get::<Option<String>, _>(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> EtlResult<()> {
        self.pool
            .set::<(), _, _>(key, value, None, None, false)
            .await?;

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> EtlResult<()> {
        let receivers = self
            .pool
            .next_connected()
            .publish::<i64, _, _>(topic, payload)
            .await
            .map_err(|err| {
                etl_error!(
                    ErrorKind::PublishFailed,
                    "Redis publish failed",
                    format!("publishing to channel '{topic}' failed"),
                    source: err
                )
            })?;
        debug!(topic, receivers, "published message");

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> EtlResult<Subscription> {
        let client = builder(&self.config).build()?;
        let connection = client.init().await?;

        let mut messages_rx = client.message_rx();
        let mut error_rx = client.error_rx();
        client.subscribe(topic).await?;

        info!(topic, "subscribed to redis channel");

        let (feed, subscription) = Subscription::channel();
        let topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = feed.closed() => {
                        debug!(topic = %topic, "redis subscription dropped");
                        break;
                    }
                    message = messages_rx.recv() => match message {
                        Ok(message) => message.value.convert::<String>().map_err(EtlError::from),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "redis subscription lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => Err(etl_error!(
                            ErrorKind::BusSubscriptionClosed,
                            "Redis subscription closed",
                            format!("message channel of '{topic}' closed")
                        )),
                    },
                    error = error_rx.recv() => {
                        let detail = match error {
                            Ok((error, _)) => error.to_string(),
                            Err(_) => "connection events closed".to_string(),
                        };

                        Err(etl_error!(
                            ErrorKind::BusConnectionFailed,
                            "Redis subscription connection failed",
                            format!("subscription to '{topic}' failed: {detail}")
                        ))
                    }
                };

                let failed = item.is_err();
                if !feed.send(item).await || failed {
                    break;
                }
            }

            // The dedicated connection only lives as long as its subscription.
            if let Err(err) = client.quit().await {
                debug!(topic = %topic, error = %err, "failed to quit redis subscription client");
            }
            connection.abort();
        });

        Ok(subscription)
    }
}
