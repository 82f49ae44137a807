// src/error.rs
//
// Typed error taxonomy for the engine, matching the propagation rules in
// the error handling design: malformed events and reservoir overflow never
// appear here (they're absorbed with a counter + warn! log at the call
// site); this enum only covers the failures that must actually propagate.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("advisory lock not acquired for key {0}")]
    LockTimeout(i64),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Transient storage errors are retried with backoff; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Repository(_))
    }
}

/// Retry a fallible repository call up to `max_attempts` times, doubling the
/// delay after each retryable failure (100ms, 200ms, 400ms, ...). Stops
/// immediately on a non-retryable error or once attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T>(max_attempts: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts.max(1) => {
                attempt += 1;
                let delay_ms = 100u64.saturating_mul(1u64 << attempt.min(10));
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
