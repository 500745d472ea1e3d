//! Service-specific error types

use thiserror::Error;

/// Startup errors for the proxy service.
///
/// Per-request failures (token unavailable, upstream timeout, transport
/// errors) are turned into HTTP responses by the forwarder and never
/// propagate as Rust errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display_is_descriptive() {
        assert_eq!(
            Error::Config("timeout_secs must be greater than 0".into()).to_string(),
            "invalid configuration: timeout_secs must be greater than 0"
        );
    }

    #[test]
    fn io_error_converts() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn toml_error_converts() {
        let parse = toml::from_str::<toml::Value>("not valid {{{{ toml").unwrap_err();
        let err: Error = parse.into();
        let debug = format!("{err:?}");
        assert!(debug.contains("Toml"), "got: {debug}");
    }
}
