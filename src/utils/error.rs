//! Error handling for the market data engine.

use thiserror::Error;

/// Main error type for the market data engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Instrument catalog errors (no catalog means no work can proceed)
    #[error("Catalog error: {0}")]
    CatalogError(String),

    /// Data-related errors (e.g. missing or malformed market data)
    #[error("Data error: {0}")]
    DataError(String),

    /// Connection / network errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// External subprocess errors (non-zero exit, timeout, bad output)
    #[error("Subprocess error: {0}")]
    SubprocessError(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Request errors
    #[error("Request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

/// Result type for the market data engine
pub type Result<T> = std::result::Result<T, Error>;

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::Other(err)
    }
}

// Allow automatic conversion from anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let config_error = Error::ConfigError("missing field".to_string());
        assert_eq!(
            config_error.to_string(),
            "Configuration error: missing field"
        );

        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let wrapped_io_error = Error::from(io_error);
        assert!(wrapped_io_error.to_string().contains("I/O error"));

        let catalog_error = Error::CatalogError("exchange info unavailable".to_string());
        assert!(catalog_error.to_string().contains("Catalog error"));

        let string_error = Error::from("custom error");
        assert_eq!(string_error.to_string(), "Error: custom error");
    }

    #[test]
    fn test_result_type() {
        fn might_fail() -> Result<()> {
            if true {
                Ok(())
            } else {
                Err(Error::Other("error".to_string()))
            }
        }

        assert!(might_fail().is_ok());
    }
}
