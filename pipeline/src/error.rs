use reqwest::StatusCode;
use thiserror::Error;

use crate::store::StoreError;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("http error ({status:?}): {message}")]
    Http {
        status: Option<u16>,
        message: String,
    },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("api error: {0}")]
    Api(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("ocr error: {0}")]
    Ocr(String),

    #[error("signal error: {0}")]
    Signal(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Transient failures worth retrying at the smallest unit that failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::RateLimited(_) | PipelineError::Timeout(_) => true,
            PipelineError::Http { status: None, .. } => true,
            PipelineError::Http {
                status: Some(code),
                ..
            } => {
                *code == StatusCode::TOO_MANY_REQUESTS.as_u16()
                    || *code == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || *code >= 500
            }
            PipelineError::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = body.chars().take(500).collect::<String>();
        match status {
            StatusCode::TOO_MANY_REQUESTS => PipelineError::RateLimited(message),
            _ => PipelineError::Http {
                status: Some(status.as_u16()),
                message,
            },
        }
    }

    /// Short reason used in inline `[Error: ...]` markers and quarantine tags.
    pub fn reason(&self) -> String {
        match self {
            PipelineError::Store(_) => "store".to_string(),
            PipelineError::Http {
                status: Some(code), ..
            } => format!("http_{}", code),
            PipelineError::Http { status: None, .. } => "network".to_string(),
            PipelineError::RateLimited(_) => "rate_limited".to_string(),
            PipelineError::Timeout(_) => "timeout".to_string(),
            PipelineError::Api(_) => "api".to_string(),
            PipelineError::InvalidResponse(_) => "invalid_response".to_string(),
            PipelineError::Ocr(_) => "ocr".to_string(),
            PipelineError::Signal(_) => "signal".to_string(),
            PipelineError::Config(_) => "config".to_string(),
            PipelineError::Internal(_) => "internal".to_string(),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(error: reqwest::Error) -> Self {
        tracing::debug!("Reqwest error: {:?}", error);
        match error.status() {
            Some(StatusCode::TOO_MANY_REQUESTS) => PipelineError::RateLimited(error.to_string()),
            Some(status) => PipelineError::Http {
                status: Some(status.as_u16()),
                message: error.to_string(),
            },
            None if error.is_decode() => PipelineError::InvalidResponse(error.to_string()),
            None => PipelineError::Http {
                status: None,
                message: error.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(error: serde_json::Error) -> Self {
        PipelineError::InvalidResponse(error.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for PipelineError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        PipelineError::Timeout(std::time::Duration::ZERO)
    }
}
