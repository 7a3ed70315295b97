//! Language-model seam: the provider trait, its error type, response
//! cleaning and the retrying wrapper every stage calls through.

mod cleaning;
mod retry;

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub use cleaning::{
    classify_response, clean_response, is_rate_limit_error, is_rate_limit_text, ResponseClass,
};
pub use retry::{Backoff, RetryPolicy, RetryingModel, Sleeper, ThreadSleeper, DEFAULT_MAX_RETRIES};

/// Coarse classification of provider failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    RateLimited,
    Authentication,
    Network,
    ModelUnavailable,
    Timeout,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::RateLimited => "限流",
            ErrorKind::Authentication => "认证失败",
            ErrorKind::Network => "网络错误",
            ErrorKind::ModelUnavailable => "模型不可用",
            ErrorKind::Timeout => "请求超时",
            ErrorKind::Other => "其他错误",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct MessageError(String);

#[derive(Debug)]
pub struct LanguageModelError {
    kind: ErrorKind,
    status_code: Option<u16>,
    inner: Box<dyn StdError + Send + Sync>,
}

impl LanguageModelError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::with_kind(ErrorKind::Other, error)
    }

    pub fn with_kind<E>(kind: ErrorKind, error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            kind,
            status_code: None,
            inner: Box::new(error),
        }
    }

    pub fn message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::with_kind(kind, MessageError(message.into()))
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn is_rate_limited(&self) -> bool {
        is_rate_limit_error(self)
    }

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.inner
    }

    pub fn as_inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }
}

impl fmt::Display for LanguageModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "[{}/HTTP {code}] {}", self.kind, self.inner),
            None => write!(f, "[{}] {}", self.kind, self.inner),
        }
    }
}

impl StdError for LanguageModelError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}

pub trait LanguageModel: Send + Sync {
    fn invoke(&self, prompt: &str, system_prompt: Option<&str>)
        -> Result<String, LanguageModelError>;
}

impl<T: LanguageModel + ?Sized> LanguageModel for &T {
    fn invoke(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, LanguageModelError> {
        (**self).invoke(prompt, system_prompt)
    }
}

impl<T: LanguageModel + ?Sized> LanguageModel for Box<T> {
    fn invoke(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, LanguageModelError> {
        (**self).invoke(prompt, system_prompt)
    }
}

impl<T: LanguageModel + ?Sized> LanguageModel for Arc<T> {
    fn invoke(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, LanguageModelError> {
        (**self).invoke(prompt, system_prompt)
    }
}
