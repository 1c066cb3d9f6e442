use derive_more::derive::Display;
use reqwest::StatusCode;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Display)]
pub enum AppError {
    /// Result store could not be reached; safe to retry, the write may
    /// or may not have landed.
    #[display("store unavailable: {_0}")]
    StoreUnavailable(String),
    /// Queue send/receive failed; safe to retry.
    #[display("queue unavailable: {_0}")]
    QueueUnavailable(String),
    /// Upstream service rejected the call for rate reasons.
    TooManyRequests,
    RequestTimeout,
    #[display("AI service error: {_0}")]
    AiService(String),
    #[display("bad AI response: {_0}")]
    BadResponse(String),
    #[display("config error: {_0}")]
    Config(String),
    Internal(anyhow::Error),
}

impl std::error::Error for AppError {}

impl AppError {
    /// Whether the caller should retry the whole operation later.
    /// Idempotent writes make retries safe for all transient variants.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::StoreUnavailable(_)
                | AppError::QueueUnavailable(_)
                | AppError::TooManyRequests
                | AppError::RequestTimeout
        )
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self, AppError::TooManyRequests)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(error)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        tracing::error!("Reqwest error: {:?}", error);
        match error.status() {
            Some(StatusCode::REQUEST_TIMEOUT) => AppError::RequestTimeout,
            Some(StatusCode::TOO_MANY_REQUESTS) => AppError::TooManyRequests,
            Some(status) => AppError::AiService(format!("status {}: {}", status, error)),
            None if error.is_timeout() => AppError::RequestTimeout,
            None => AppError::Internal(error.into()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::BadResponse(error.to_string())
    }
}
