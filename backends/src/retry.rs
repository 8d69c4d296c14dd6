use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use snapvault_core::backend::{Backend, BackendType, FileType, Handle, WriteOutcome};
use snapvault_core::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to every backoff
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_duration = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);

        let duration_ms = base_duration.min(self.max_backoff.as_millis() as f64) as u64;
        let mut duration = Duration::from_millis(duration_ms);

        if self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..=(duration_ms / 4));
            duration += Duration::from_millis(jitter_ms);
        }

        duration
    }
}

/// Trait to determine if an error is retryable
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

fn is_transient(message: &str) -> bool {
    let message = message.to_lowercase();
    [
        "timeout",
        "timed out",
        "temporarily unavailable",
        "try again",
        "interrupted",
        "connection reset",
    ]
    .iter()
    .any(|marker| message.contains(marker))
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Backend(message) | Error::BackendWrite { message, .. } => is_transient(message),
            // content, format and configuration errors repeat on every attempt
            _ => false,
        }
    }
}

/// Retry a future operation with exponential backoff
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation_name: &str, mut operation: F) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let error = match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(operation = operation_name, attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            debug!(operation = operation_name, error = %error, "Error is not retryable, failing immediately");
            return Err(error);
        }

        attempt += 1;
        if attempt >= config.max_attempts {
            warn!(
                operation = operation_name,
                max_attempts = config.max_attempts,
                error = %error,
                "Operation failed after all retry attempts"
            );
            return Err(error);
        }

        let backoff = config.backoff_duration(attempt - 1);
        warn!(
            operation = operation_name,
            attempt,
            max_attempts = config.max_attempts,
            backoff_ms = backoff.as_millis(),
            error = %error,
            "Operation failed, retrying after backoff"
        );
        sleep(backoff).await;
    }
}

/// Wraps a backend and retries transient failures.
///
/// Retrying a write is safe because backend writes are create-only: an
/// attempt that reached storage before failing reports `AlreadyExists` the
/// next time around.
pub struct RetryBackend {
    inner: Arc<dyn Backend>,
    config: RetryConfig,
}

impl RetryBackend {
    pub fn new(inner: Arc<dyn Backend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl Backend for RetryBackend {
    async fn init(&self) -> Result<()> {
        retry_with_backoff(&self.config, "init", || self.inner.init()).await
    }

    async fn exists(&self, handle: &Handle) -> Result<bool> {
        retry_with_backoff(&self.config, "exists", || self.inner.exists(handle)).await
    }

    async fn read(&self, handle: &Handle) -> Result<Bytes> {
        retry_with_backoff(&self.config, "read", || self.inner.read(handle)).await
    }

    async fn write(&self, handle: &Handle, data: Bytes) -> Result<WriteOutcome> {
        retry_with_backoff(&self.config, "write", || self.inner.write(handle, data.clone())).await
    }

    async fn list(&self, file_type: FileType) -> Result<Vec<Handle>> {
        retry_with_backoff(&self.config, "list", || self.inner.list(file_type)).await
    }

    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }
}
