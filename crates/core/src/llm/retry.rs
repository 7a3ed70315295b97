use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::cleaning::{classify_response, clean_response, is_rate_limit_error, ResponseClass};
use super::{LanguageModel, LanguageModelError};
use crate::logging::{LogLevel, LogRecord, LogSink};

pub const DEFAULT_MAX_RETRIES: usize = 10;

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Wait schedule between attempts; `attempt` is 1-based.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backoff {
    /// `min(cap, step * attempt)` seconds.
    Linear { step_secs: u64, cap_secs: u64 },
    /// `min(cap, 2^attempt * 2)` seconds.
    Exponential { cap_secs: u64 },
}

impl Backoff {
    pub const SEMANTIC: Backoff = Backoff::Linear {
        step_secs: 2,
        cap_secs: 4,
    };
    pub const RATE_LIMIT: Backoff = Backoff::Exponential { cap_secs: 60 };
    pub const TRANSIENT: Backoff = Backoff::Linear {
        step_secs: 2,
        cap_secs: 10,
    };

    pub fn delay(self, attempt: usize) -> Duration {
        let attempt = attempt.max(1) as u64;
        let secs = match self {
            Backoff::Linear { step_secs, cap_secs } => step_secs.saturating_mul(attempt).min(cap_secs),
            Backoff::Exponential { cap_secs } => {
                let exponent = attempt.min(16) as u32;
                2u64.saturating_pow(exponent).saturating_mul(2).min(cap_secs)
            }
        };
        Duration::from_secs(secs)
    }

    fn for_response(class: ResponseClass) -> Backoff {
        if class.is_rate_limit() {
            Backoff::RATE_LIMIT
        } else {
            Backoff::SEMANTIC
        }
    }

    fn for_error(error: &LanguageModelError) -> Backoff {
        if is_rate_limit_error(error) {
            Backoff::RATE_LIMIT
        } else {
            Backoff::TRANSIENT
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Cleans, classifies and retries every call to the wrapped model.
///
/// Semantically empty responses (blank, refusals, provider error text) are
/// retried and, once attempts run out, yield `Ok("")`. A provider error on the
/// final attempt is returned as is.
pub struct RetryingModel<'a> {
    model: &'a dyn LanguageModel,
    sink: &'a dyn LogSink,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl<'a> RetryingModel<'a> {
    pub fn new(model: &'a dyn LanguageModel, sink: &'a dyn LogSink) -> Self {
        Self {
            model,
            sink,
            policy: RetryPolicy::default(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = RetryPolicy {
            max_retries: policy.max_retries.max(1),
        };
        self
    }

    pub fn with_max_retries(self, max_retries: usize) -> Self {
        self.with_policy(RetryPolicy { max_retries })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message));
    }
}

impl LanguageModel for RetryingModel<'_> {
    fn invoke(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, LanguageModelError> {
        let max = self.policy.max_retries.max(1);
        for attempt in 1..=max {
            self.log(
                LogLevel::Debug,
                format!("发送到 LLM 的提示词（第{attempt}/{max}次尝试）：\n{prompt}"),
            );

            let delay = match self.model.invoke(prompt, system_prompt) {
                Ok(raw) => {
                    let cleaned = clean_response(&raw);
                    let class = classify_response(&cleaned);
                    if class.is_valid() {
                        self.log(
                            LogLevel::Debug,
                            format!("LLM 返回内容（第{attempt}次尝试，{}字）", cleaned.chars().count()),
                        );
                        return Ok(cleaned);
                    }
                    self.log(
                        LogLevel::Warn,
                        format!("LLM 返回无效响应（{}），第{attempt}/{max}次尝试", class.label()),
                    );
                    Backoff::for_response(class).delay(attempt)
                }
                Err(err) => {
                    if attempt == max {
                        self.log(
                            LogLevel::Error,
                            format!("LLM 调用失败且已达最大重试次数（{max}）：{err}"),
                        );
                        return Err(err);
                    }
                    let rate_limited = is_rate_limit_error(&err);
                    self.log(
                        LogLevel::Warn,
                        format!(
                            "LLM 调用异常{}，第{attempt}/{max}次尝试：{err}",
                            if rate_limited { "（限流）" } else { "" }
                        ),
                    );
                    Backoff::for_error(&err).delay(attempt)
                }
            };

            if attempt < max {
                self.sleeper.sleep(delay);
            }
        }

        self.log(
            LogLevel::Error,
            format!("LLM 连续{max}次返回无效响应，放弃并返回空结果"),
        );
        Ok(String::new())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::ErrorKind;
    use crate::logging::VecLogSink;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub(crate) waits: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub(crate) fn waits(&self) -> Vec<u64> {
            self.waits
                .lock()
                .unwrap()
                .iter()
                .map(|d| d.as_secs())
                .collect()
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.waits.lock().unwrap().push(duration);
        }
    }

    enum Step {
        Reply(&'static str),
        Fail(ErrorKind, &'static str),
    }

    struct ScriptedModel {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<usize>,
    }

    impl ScriptedModel {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl LanguageModel for ScriptedModel {
        fn invoke(&self, _prompt: &str, _system: Option<&str>) -> Result<String, LanguageModelError> {
            *self.calls.lock().unwrap() += 1;
            match self.steps.lock().unwrap().pop_front() {
                Some(Step::Reply(text)) => Ok(text.to_string()),
                Some(Step::Fail(kind, message)) => Err(LanguageModelError::message(kind, message)),
                None => Ok(String::new()),
            }
        }
    }

    #[test]
    fn rate_limit_text_backs_off_exponentially() {
        let model = ScriptedModel::new(vec![
            Step::Reply("Error code: 429 - Resource exhausted"),
            Step::Reply("Error code: 429 - Resource exhausted"),
            Step::Reply("ok"),
        ]);
        let sink = VecLogSink::new();
        let sleeper = Arc::new(RecordingSleeper::default());
        let retrying = RetryingModel::new(&model, &sink).with_sleeper(sleeper.clone());

        let output = retrying.invoke("prompt", None).unwrap();

        assert_eq!(output, "ok");
        assert_eq!(model.calls(), 3);
        assert_eq!(sleeper.waits(), vec![4, 8]);
    }

    #[test]
    fn semantic_exhaustion_returns_empty() {
        let model = ScriptedModel::new(vec![
            Step::Reply(""),
            Step::Reply("我无法完成该请求"),
            Step::Reply("{}"),
        ]);
        let sink = VecLogSink::new();
        let sleeper = Arc::new(RecordingSleeper::default());
        let retrying = RetryingModel::new(&model, &sink)
            .with_max_retries(3)
            .with_sleeper(sleeper.clone());

        assert_eq!(retrying.invoke("prompt", None).unwrap(), "");
        assert_eq!(sleeper.waits(), vec![2, 4]);
        assert_eq!(sink.messages_at(LogLevel::Error).len(), 1);
    }

    #[test]
    fn final_exception_is_reraised() {
        let model = ScriptedModel::new(vec![
            Step::Reply(""),
            Step::Fail(ErrorKind::Network, "connection reset"),
            Step::Fail(ErrorKind::Network, "connection reset"),
        ]);
        let sink = VecLogSink::new();
        let sleeper = Arc::new(RecordingSleeper::default());
        let retrying = RetryingModel::new(&model, &sink)
            .with_max_retries(3)
            .with_sleeper(sleeper.clone());

        let err = retrying.invoke("prompt", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(sleeper.waits(), vec![2, 4]);
    }

    #[test]
    fn mixed_failures_ending_empty_yield_empty() {
        let model = ScriptedModel::new(vec![
            Step::Fail(ErrorKind::RateLimited, "429"),
            Step::Reply("   "),
        ]);
        let sink = VecLogSink::new();
        let sleeper = Arc::new(RecordingSleeper::default());
        let retrying = RetryingModel::new(&model, &sink)
            .with_max_retries(2)
            .with_sleeper(sleeper.clone());

        assert_eq!(retrying.invoke("prompt", None).unwrap(), "");
        assert_eq!(sleeper.waits(), vec![4]);
    }

    #[test]
    fn backoff_schedules() {
        let exp: Vec<_> = (1..=6).map(|a| Backoff::RATE_LIMIT.delay(a).as_secs()).collect();
        assert_eq!(exp, vec![4, 8, 16, 32, 60, 60]);
        let linear: Vec<_> = (1..=3).map(|a| Backoff::SEMANTIC.delay(a).as_secs()).collect();
        assert_eq!(linear, vec![2, 4, 4]);
        let transient: Vec<_> = (1..=6).map(|a| Backoff::TRANSIENT.delay(a).as_secs()).collect();
        assert_eq!(transient, vec![2, 4, 6, 8, 10, 10]);
    }
}
