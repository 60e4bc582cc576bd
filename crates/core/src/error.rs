use serde::de::DeserializeOwned;
use thiserror::Error;

pub type FunnelResult<T> = Result<T, FunnelError>;

#[derive(Error, Debug)]
pub enum FunnelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Malformed data at {key}: {message}")]
    Malformed { key: String, message: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Downstream call failed: {0}")]
    Downstream(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FunnelError {
    /// Only caller-input errors are surfaced to the immediate caller.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, FunnelError::InvalidInput(_))
    }
}

/// Decode a stored JSON value, tagging a failure with the key it was read from.
pub fn decode_stored<T: DeserializeOwned>(key: &str, raw: &str) -> FunnelResult<T> {
    serde_json::from_str(raw).map_err(|e| FunnelError::Malformed {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Truncate a stored payload for log output.
pub fn truncate_payload(payload: &str) -> String {
    const MAX_CHARS: usize = 200;
    if payload.chars().count() <= MAX_CHARS {
        payload.to_string()
    } else {
        let head: String = payload.chars().take(MAX_CHARS).collect();
        format!("{head}...")
    }
}
