use novel_core::config::ConfigError;
use novel_core::embedding::EmbeddingModelError;
use novel_core::llm::{is_rate_limit_text, ErrorKind, LanguageModelError};
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<AdapterError>,
    },
    #[error("API returned an empty response")]
    EmptyResponse,
}

impl AdapterError {
    pub fn retry_exhausted(attempts: usize, source: AdapterError) -> Self {
        AdapterError::RetryExhausted {
            attempts,
            source: Box::new(source),
        }
    }

    /// Maps transport and HTTP failures onto the core's error kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Http(err) if err.is_timeout() => ErrorKind::Timeout,
            AdapterError::Http(err) if err.is_connect() || err.is_request() => ErrorKind::Network,
            AdapterError::Http(err) => err.status().map(status_kind).unwrap_or(ErrorKind::Network),
            AdapterError::HttpStatus { status, body } => {
                let kind = status_kind(*status);
                if kind == ErrorKind::Other && is_rate_limit_text(body) {
                    ErrorKind::RateLimited
                } else {
                    kind
                }
            }
            AdapterError::RetryExhausted { source, .. } => source.kind(),
            AdapterError::Json(_)
            | AdapterError::InvalidConfig(_)
            | AdapterError::Config(_)
            | AdapterError::EmptyResponse => ErrorKind::Other,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            AdapterError::HttpStatus { status, .. } => Some(status.as_u16()),
            AdapterError::Http(err) => err.status().map(|status| status.as_u16()),
            AdapterError::RetryExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind() == ErrorKind::RateLimited
    }

    pub fn into_model_error(self) -> LanguageModelError {
        let status = self.status();
        let error = LanguageModelError::with_kind(self.kind(), self);
        match status {
            Some(code) => error.with_status(code),
            None => error,
        }
    }

    pub fn into_embedding_error(self) -> EmbeddingModelError {
        EmbeddingModelError::with_kind(self.kind(), self)
    }
}

fn status_kind(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        429 => ErrorKind::RateLimited,
        401 | 403 => ErrorKind::Authentication,
        404 => ErrorKind::ModelUnavailable,
        408 | 504 => ErrorKind::Timeout,
        502 | 503 => ErrorKind::Network,
        _ => ErrorKind::Other,
    }
}
