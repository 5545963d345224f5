//! Crate-wide error type shared by tests and small helpers in this crate.
//!
//! The bridge service's own failure taxonomy lives in
//! `bridge::error::BridgeError`; this type is the lighter-weight error used
//! by the handful of cross-cutting helpers `common` itself exposes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("bufferSize must be a power of two".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: bufferSize must be a power of two"
        );
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let our_err: Error = json_err.into();
        assert!(matches!(our_err, Error::Json(_)));
    }
}
