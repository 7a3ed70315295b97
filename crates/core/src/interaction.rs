use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::logging::{LogLevel, LogRecord, LogSink};

pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

/// Situations in which the pipeline asks the operator before continuing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmKind {
    /// Earlier chapters are missing on disk.
    ContinuityGap { chapter: u32, missing: Vec<u32> },
    /// A chapter file already exists and would be replaced by a new draft.
    Overwrite { chapter: u32 },
    /// The chapter has already been written into the vector index.
    Refinalize { chapter: u32 },
}

impl ConfirmKind {
    /// Answer used when nobody responds in time. Always the non-destructive one.
    pub fn default_answer(&self) -> bool {
        false
    }

    pub fn chapter(&self) -> u32 {
        match self {
            ConfirmKind::ContinuityGap { chapter, .. }
            | ConfirmKind::Overwrite { chapter }
            | ConfirmKind::Refinalize { chapter } => *chapter,
        }
    }
}

impl fmt::Display for ConfirmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmKind::ContinuityGap { chapter, missing } => {
                let list = missing
                    .iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join("、");
                write!(f, "生成第{chapter}章前发现缺失章节：{list}，是否继续？")
            }
            ConfirmKind::Overwrite { chapter } => {
                write!(f, "第{chapter}章已存在，是否覆盖重新生成？")
            }
            ConfirmKind::Refinalize { chapter } => {
                write!(f, "第{chapter}章已写入向量库，是否重新定稿？")
            }
        }
    }
}

pub trait ConfirmationHandler: Send + Sync {
    fn confirm(&self, kind: &ConfirmKind) -> bool;
}

/// Answers every question with a fixed value; useful for unattended runs and tests.
#[derive(Clone, Copy, Debug)]
pub struct FixedAnswer(pub bool);

impl ConfirmationHandler for FixedAnswer {
    fn confirm(&self, _kind: &ConfirmKind) -> bool {
        self.0
    }
}

/// Returns each question's non-destructive default without asking.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultAnswers;

impl ConfirmationHandler for DefaultAnswers {
    fn confirm(&self, kind: &ConfirmKind) -> bool {
        kind.default_answer()
    }
}

/// Runs a handler on a worker thread and falls back to the default answer
/// when it does not reply within the timeout.
#[derive(Clone)]
pub struct ConfirmationGate {
    handler: Arc<dyn ConfirmationHandler>,
    timeout: Duration,
}

impl ConfirmationGate {
    pub fn new(handler: Arc<dyn ConfirmationHandler>) -> Self {
        Self {
            handler,
            timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn ask(&self, kind: &ConfirmKind, sink: &dyn LogSink) -> bool {
        let (tx, rx) = mpsc::channel();
        let handler = Arc::clone(&self.handler);
        let request = kind.clone();
        thread::spawn(move || {
            let answer = handler.confirm(&request);
            let _ = tx.send(answer);
        });

        match rx.recv_timeout(self.timeout) {
            Ok(answer) => answer,
            Err(_) => {
                let answer = kind.default_answer();
                sink.log(LogRecord::new(
                    LogLevel::Warn,
                    format!(
                        "确认请求超时（{}秒），采用默认选择：{}。问题：{kind}",
                        self.timeout.as_secs(),
                        if answer { "是" } else { "否" }
                    ),
                ));
                answer
            }
        }
    }
}

impl Default for ConfirmationGate {
    fn default() -> Self {
        Self::new(Arc::new(DefaultAnswers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::VecLogSink;

    struct SlowHandler;

    impl ConfirmationHandler for SlowHandler {
        fn confirm(&self, _kind: &ConfirmKind) -> bool {
            thread::sleep(Duration::from_millis(500));
            true
        }
    }

    #[test]
    fn returns_handler_answer() {
        let gate = ConfirmationGate::new(Arc::new(FixedAnswer(true)));
        let sink = VecLogSink::new();
        assert!(gate.ask(&ConfirmKind::Overwrite { chapter: 3 }, &sink));
        assert!(sink.records().is_empty());
    }

    #[test]
    fn timeout_falls_back_to_default() {
        let gate = ConfirmationGate::new(Arc::new(SlowHandler))
            .with_timeout(Duration::from_millis(20));
        let sink = VecLogSink::new();
        let answer = gate.ask(&ConfirmKind::Refinalize { chapter: 2 }, &sink);
        assert!(!answer);
        assert_eq!(sink.messages_at(LogLevel::Warn).len(), 1);
    }

    #[test]
    fn continuity_message_lists_missing_chapters() {
        let kind = ConfirmKind::ContinuityGap {
            chapter: 5,
            missing: vec![2, 3],
        };
        assert!(kind.to_string().contains("2、3"));
        assert_eq!(kind.chapter(), 5);
    }
}
