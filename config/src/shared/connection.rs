use std::sync::LazyLock;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_postgres::{Config as TokioPgConnectOptions, config::SslMode as TokioPgSslMode};

use crate::shared::ValidationError;

const COMMON_DATESTYLE: &str = "ISO";
const COMMON_INTERVALSTYLE: &str = "postgres";
const COMMON_EXTRA_FLOAT_DIGITS: i32 = 3;
const COMMON_CLIENT_ENCODING: &str = "UTF8";
const COMMON_TIMEZONE: &str = "UTC";

const APP_NAME_REPLICATION: &str = "cdc_publisher_replication";
const APP_NAME_SCHEMA: &str = "cdc_publisher_schema";

/// Session options of the replication connection.
///
/// Statement and idle timeouts are disabled since the connection stays in
/// streaming mode for the lifetime of the reader.
pub static CDC_REPLICATION_OPTIONS: LazyLock<PgConnectionOptions> =
    LazyLock::new(|| PgConnectionOptions {
        datestyle: COMMON_DATESTYLE.to_string(),
        intervalstyle: COMMON_INTERVALSTYLE.to_string(),
        extra_float_digits: COMMON_EXTRA_FLOAT_DIGITS,
        client_encoding: COMMON_CLIENT_ENCODING.to_string(),
        timezone: COMMON_TIMEZONE.to_string(),
        statement_timeout: 0,
        idle_in_transaction_session_timeout: 0,
        application_name: APP_NAME_REPLICATION.to_string(),
    });

/// Session options of the short-lived connection used to read table schemas.
pub static CDC_SCHEMA_OPTIONS: LazyLock<PgConnectionOptions> =
    LazyLock::new(|| PgConnectionOptions {
        datestyle: COMMON_DATESTYLE.to_string(),
        intervalstyle: COMMON_INTERVALSTYLE.to_string(),
        extra_float_digits: COMMON_EXTRA_FLOAT_DIGITS,
        client_encoding: COMMON_CLIENT_ENCODING.to_string(),
        timezone: COMMON_TIMEZONE.to_string(),
        statement_timeout: 30_000,
        idle_in_transaction_session_timeout: 60_000,
        application_name: APP_NAME_SCHEMA.to_string(),
    });

#[derive(Debug, Clone)]
pub struct PgConnectionOptions {
    pub datestyle: String,
    pub intervalstyle: String,
    pub extra_float_digits: i32,
    pub client_encoding: String,
    pub timezone: String,
    pub statement_timeout: u32,
    pub idle_in_transaction_session_timeout: u32,
    pub application_name: String,
}

impl PgConnectionOptions {
    /// Renders the options as `-c key=value` pairs for the startup packet.
    pub fn to_options_string(&self) -> String {
        format!(
            "-c datestyle={} -c intervalstyle={} -c extra_float_digits={} -c client_encoding={} -c timezone={} -c statement_timeout={} -c idle_in_transaction_session_timeout={}",
            self.datestyle,
            self.intervalstyle,
            self.extra_float_digits,
            self.client_encoding,
            self.timezone,
            self.statement_timeout,
            self.idle_in_transaction_session_timeout,
        )
    }
}

/// Connection parameters of the source database.
#[derive(Debug, Clone, Deserialize)]
pub struct PgConnectionConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    /// Redacted in debug output.
    pub password: Option<SecretString>,
    #[serde(default = "TlsConfig::disabled")]
    pub tls: TlsConfig,
}

impl PgConnectionConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(ValidationError::invalid_field(
                "source.connection.host",
                "must not be empty",
            ));
        }
        if self.name.is_empty() {
            return Err(ValidationError::invalid_field(
                "source.connection.name",
                "must not be empty",
            ));
        }

        self.tls.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub trusted_root_certs: String,
    pub enabled: bool,
}

impl TlsConfig {
    pub fn disabled() -> Self {
        Self {
            trusted_root_certs: String::new(),
            enabled: false,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.trusted_root_certs.trim().is_empty() {
            return Err(ValidationError::MissingTrustedRootCerts);
        }

        Ok(())
    }
}

/// Conversion of a [`PgConnectionConfig`] into driver specific connect options.
pub trait IntoConnectOptions<Output> {
    fn without_db(&self, options: Option<&PgConnectionOptions>) -> Output;
    fn with_db(&self, options: Option<&PgConnectionOptions>) -> Output;
}

impl IntoConnectOptions<TokioPgConnectOptions> for PgConnectionConfig {
    fn without_db(&self, options: Option<&PgConnectionOptions>) -> TokioPgConnectOptions {
        let ssl_mode = if self.tls.enabled {
            TokioPgSslMode::VerifyFull
        } else {
            TokioPgSslMode::Prefer
        };

        let mut config = TokioPgConnectOptions::new();
        config
            .host(self.host.clone())
            .port(self.port)
            .user(self.username.clone())
            .ssl_mode(ssl_mode);

        if let Some(password) = &self.password {
            config.password(password.expose_secret());
        }

        if let Some(options) = options {
            config.options(options.to_options_string());
            config.application_name(options.application_name.clone());
        }

        config
    }

    fn with_db(&self, options: Option<&PgConnectionOptions>) -> TokioPgConnectOptions {
        let mut config: TokioPgConnectOptions = self.without_db(options);
        config.dbname(self.name.clone());
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(tls: TlsConfig) -> PgConnectionConfig {
        PgConnectionConfig {
            host: "localhost".to_string(),
            port: 5432,
            name: "weather".to_string(),
            username: "postgres".to_string(),
            password: None,
            tls,
        }
    }

    #[test]
    fn replication_options_disable_timeouts() {
        assert_eq!(
            CDC_REPLICATION_OPTIONS.to_options_string(),
            "-c datestyle=ISO -c intervalstyle=postgres -c extra_float_digits=3 -c client_encoding=UTF8 -c timezone=UTC -c statement_timeout=0 -c idle_in_transaction_session_timeout=0"
        );
    }

    #[test]
    fn tls_requires_root_certs() {
        let config = connection(TlsConfig {
            trusted_root_certs: " ".to_string(),
            enabled: true,
        });
        assert!(matches!(
            config.validate(),
            Err(ValidationError::MissingTrustedRootCerts)
        ));
        assert!(connection(TlsConfig::disabled()).validate().is_ok());
    }

    #[test]
    fn with_db_sets_database_name() {
        let options: TokioPgConnectOptions =
            connection(TlsConfig::disabled()).with_db(Some(&CDC_SCHEMA_OPTIONS));
        assert_eq!(options.get_dbname(), Some("weather"));
        assert_eq!(options.get_application_name(), Some(APP_NAME_SCHEMA));
    }
}
