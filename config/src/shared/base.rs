use thiserror::Error;

/// Errors raised when a loaded configuration is internally inconsistent.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
    /// A field holds a value outside of its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// The column mapping declares a version this build does not understand.
    #[error("unsupported column mapping version {found}, expected {expected}")]
    UnsupportedMappingVersion { found: u32, expected: u32 },
    /// The column mapping does not list any table.
    #[error("column mapping must contain at least one table")]
    NoWatchedTables,
    /// Two entries of the mapping collide.
    #[error("duplicate {what} `{value}` in mapping of table `{table}`")]
    DuplicateMapping {
        table: String,
        what: &'static str,
        value: String,
    },
}

impl ValidationError {
    pub(crate) fn invalid_field(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        ValidationError::InvalidFieldValue {
            field: field.into(),
            constraint: constraint.into(),
        }
    }
}
