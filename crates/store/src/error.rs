use funnel_core::FunnelError;

/// Errors raised by a key-value backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("connection timed out after {0}ms")]
    ConnectTimeout(u64),
}

impl From<StoreError> for FunnelError {
    fn from(err: StoreError) -> Self {
        FunnelError::Store(err.to_string())
    }
}
