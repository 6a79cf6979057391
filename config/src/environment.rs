use std::fmt;
use std::io;

/// Environment variable selecting which configuration overlay gets loaded.
const APP_ENVIRONMENT_ENV_NAME: &str = "APP_ENVIRONMENT";

const DEV_ENV_NAME: &str = "dev";

const PROD_ENV_NAME: &str = "prod";

/// Deployment environment of a CDC service.
///
/// Selects the `configuration/{environment}` overlay and the log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

impl Environment {
    /// Reads `APP_ENVIRONMENT`, falling back to [`Environment::Dev`] when it is unset.
    pub fn load() -> Result<Environment, io::Error> {
        match std::env::var(APP_ENVIRONMENT_ENV_NAME) {
            Ok(value) => Environment::parse(&value),
            Err(_) => Ok(Environment::Dev),
        }
    }

    /// Parses an environment name case-insensitively.
    pub fn parse(value: &str) -> Result<Environment, io::Error> {
        match value.trim().to_lowercase().as_str() {
            DEV_ENV_NAME => Ok(Environment::Dev),
            PROD_ENV_NAME => Ok(Environment::Prod),
            other => Err(io::Error::other(format!(
                "`{other}` is not a supported environment, expected `{DEV_ENV_NAME}` or `{PROD_ENV_NAME}`",
            ))),
        }
    }

    pub fn is_prod(&self) -> bool {
        matches!(self, Environment::Prod)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => DEV_ENV_NAME,
            Environment::Prod => PROD_ENV_NAME,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Environment::parse("PROD").unwrap(), Environment::Prod);
        assert_eq!(Environment::parse(" dev ").unwrap(), Environment::Dev);
    }

    #[test]
    fn parse_rejects_unknown_names() {
        let err = Environment::parse("staging").unwrap_err();
        assert!(err.to_string().contains("staging"));
    }

    #[test]
    fn display_matches_file_stem() {
        assert_eq!(Environment::Prod.to_string(), "prod");
        assert!(Environment::Prod.is_prod());
        assert!(!Environment::Dev.is_prod());
    }
}
