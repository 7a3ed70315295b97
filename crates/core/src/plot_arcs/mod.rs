//! Graded ledger of open and resolved plot threads kept in `plot_arcs.txt`.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::llm::{LanguageModel, LanguageModelError};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::project::{ArtifactError, Project};
use crate::prompts::{keys, PromptError, PromptRegistry};

pub const COMPRESSION_INTERVAL: u32 = 10;
pub const UNRESOLVED_THRESHOLD: usize = 50;
pub const RESOLVED_THRESHOLD: usize = 20;
pub const DISTILL_MAX_CHARS: usize = 200;
pub const DISTILL_COMPRESS_THRESHOLD: usize = 250;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ArcGrade {
    A,
    B,
    C,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArcLine {
    Unresolved(ArcGrade),
    Resolved,
    Freeform,
}

pub fn classify_line(line: &str) -> ArcLine {
    if let Some(caps) = unresolved_regex().captures(line) {
        return match &caps[1] {
            "A" => ArcLine::Unresolved(ArcGrade::A),
            "B" => ArcLine::Unresolved(ArcGrade::B),
            _ => ArcLine::Unresolved(ArcGrade::C),
        };
    }
    if resolved_regex().is_match(line) {
        return ArcLine::Resolved;
    }
    ArcLine::Freeform
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ArcCounts {
    pub a: usize,
    pub b: usize,
    pub c: usize,
    pub resolved: usize,
}

impl ArcCounts {
    pub fn of(text: &str) -> Self {
        let mut counts = Self::default();
        for line in text.lines() {
            match classify_line(line) {
                ArcLine::Unresolved(ArcGrade::A) => counts.a += 1,
                ArcLine::Unresolved(ArcGrade::B) => counts.b += 1,
                ArcLine::Unresolved(ArcGrade::C) => counts.c += 1,
                ArcLine::Resolved => counts.resolved += 1,
                ArcLine::Freeform => {}
            }
        }
        counts
    }

    pub fn unresolved(&self) -> usize {
        self.a + self.b + self.c
    }
}

/// Every tenth chapter, once the ledger has grown past either threshold.
pub fn needs_compression(chapter_number: u32, counts: &ArcCounts) -> bool {
    chapter_number > 0
        && chapter_number % COMPRESSION_INTERVAL == 0
        && (counts.unresolved() > UNRESOLVED_THRESHOLD || counts.resolved > RESOLVED_THRESHOLD)
}

/// Unresolved lines, A grade first, each trimmed.
pub fn unresolved_lines(text: &str) -> Vec<&str> {
    let mut graded: Vec<(ArcGrade, &str)> = text
        .lines()
        .filter_map(|line| match classify_line(line) {
            ArcLine::Unresolved(grade) => Some((grade, line.trim())),
            _ => None,
        })
        .collect();
    graded.sort_by_key(|(grade, _)| *grade);
    graded.into_iter().map(|(_, line)| line).collect()
}

/// Keeps whole lines while they fit in `max_chars`; a single oversized first
/// line is cut.
pub fn truncate_at_line_boundary(text: &str, max_chars: usize) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let len = line.chars().count();
        let needed = if kept.is_empty() { len } else { used + 1 + len };
        if needed > max_chars {
            if kept.is_empty() {
                return line.chars().take(max_chars).collect();
            }
            break;
        }
        used = needed;
        kept.push(line);
    }
    kept.join("\n")
}

pub fn foreshadow_header(chapter_number: u32) -> String {
    format!("━━━ 未解决伏笔（截至第{chapter_number}章）━━━")
}

pub fn volume_carry_header(volume: u32) -> String {
    format!("━━━ 第{volume}卷未解决伏笔 ━━━")
}

/// Drops any earlier foreshadowing block and appends the new one.
pub fn replace_foreshadow_block(summary: &str, chapter_number: u32, block: &str) -> String {
    let mut text = strip_foreshadow_blocks(summary);
    let block = block.trim();
    if block.is_empty() {
        return text;
    }
    if !text.is_empty() {
        text.push_str("\n\n");
    }
    text.push_str(&foreshadow_header(chapter_number));
    text.push('\n');
    text.push_str(block);
    text
}

pub fn strip_foreshadow_blocks(summary: &str) -> String {
    let mut text = summary.to_string();
    while let Some(found) = foreshadow_header_regex().find(&text) {
        let start = found.start();
        let end = text[found.end()..]
            .find("\n\n")
            .map(|offset| found.end() + offset)
            .unwrap_or(text.len());
        text.replace_range(start..end, "");
    }
    let collapsed = blank_run_regex().replace_all(text.trim(), "\n\n");
    collapsed.into_owned()
}

/// A- and B-grade lines of `distilled` under the volume header.
pub fn volume_carry_block(volume: u32, distilled: &str) -> String {
    let carried: Vec<&str> = distilled
        .lines()
        .map(str::trim)
        .filter(|line| {
            matches!(
                classify_line(line),
                ArcLine::Unresolved(ArcGrade::A) | ArcLine::Unresolved(ArcGrade::B)
            )
        })
        .collect();
    let mut block = volume_carry_header(volume);
    for line in carried {
        block.push('\n');
        block.push_str(line);
    }
    block
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlotArcStage {
    Update,
    Compress,
    Distill,
}

impl fmt::Display for PlotArcStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Update => "伏笔台账更新",
            Self::Compress => "伏笔台账整理",
            Self::Distill => "伏笔精简",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum PlotArcError {
    #[error("渲染{stage}提示词失败: {source}")]
    Prompt {
        stage: PlotArcStage,
        #[source]
        source: PromptError,
    },
    #[error("调用模型执行{stage}失败: {source}")]
    Model {
        stage: PlotArcStage,
        #[source]
        source: LanguageModelError,
    },
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

pub struct PlotArcLedger<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
}

impl<'a> PlotArcLedger<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self { prompts, sink }
    }

    /// Folds the new chapter into the ledger. Returns whether it changed.
    pub fn update(
        &self,
        model: &dyn LanguageModel,
        project: &Project,
        chapter_number: u32,
        chapter_text: &str,
    ) -> Result<bool, PlotArcError> {
        let stage = PlotArcStage::Update;
        let current = project.plot_arcs()?;
        let prompt = self
            .prompts
            .format_with(
                keys::PLOT_ARCS_UPDATE,
                [
                    ("novel_number", chapter_number.to_string()),
                    ("chapter_text", chapter_text.to_string()),
                    ("plot_arcs", current.trim().to_string()),
                ],
            )
            .map_err(|source| PlotArcError::Prompt { stage, source })?;
        let response = model
            .invoke(&prompt, None)
            .map_err(|source| PlotArcError::Model { stage, source })?;
        if response.trim().is_empty() {
            self.log(LogLevel::Warn, "伏笔台账更新返回空结果，保留原台账。");
            return Ok(false);
        }
        project.write_plot_arcs(response.trim())?;
        let counts = ArcCounts::of(&response);
        self.log(
            LogLevel::Info,
            format!(
                "伏笔台账已更新：未解决 {}（A{} B{} C{}），已解决 {}。",
                counts.unresolved(),
                counts.a,
                counts.b,
                counts.c,
                counts.resolved
            ),
        );
        Ok(true)
    }

    /// Periodic compression; a no-op unless [`needs_compression`] holds.
    pub fn compress_if_needed(
        &self,
        model: &dyn LanguageModel,
        project: &Project,
        chapter_number: u32,
    ) -> Result<bool, PlotArcError> {
        let current = project.plot_arcs()?;
        let counts = ArcCounts::of(&current);
        if !needs_compression(chapter_number, &counts) {
            return Ok(false);
        }

        let stage = PlotArcStage::Compress;
        self.log(
            LogLevel::Info,
            format!(
                "第{chapter_number}章触发伏笔台账整理：未解决 {}，已解决 {}。",
                counts.unresolved(),
                counts.resolved
            ),
        );
        let prompt = self
            .prompts
            .format_with(
                keys::PLOT_ARCS_COMPRESS_AUTO,
                [
                    ("novel_number", chapter_number.to_string()),
                    ("unresolved_count", counts.unresolved().to_string()),
                    ("resolved_count", counts.resolved.to_string()),
                    ("plot_arcs", current.trim().to_string()),
                ],
            )
            .map_err(|source| PlotArcError::Prompt { stage, source })?;
        let response = model
            .invoke(&prompt, None)
            .map_err(|source| PlotArcError::Model { stage, source })?;
        if response.trim().is_empty() {
            self.log(LogLevel::Warn, "伏笔台账整理返回空结果，保留原台账。");
            return Ok(false);
        }
        project.write_plot_arcs(response.trim())?;
        Ok(true)
    }

    /// Unresolved arcs condensed to at most [`DISTILL_MAX_CHARS`] characters.
    pub fn distill(&self, model: &dyn LanguageModel, ledger: &str) -> Result<String, PlotArcError> {
        let joined = unresolved_lines(ledger).join("\n");
        if joined.is_empty() {
            return Ok(String::new());
        }
        if joined.chars().count() <= DISTILL_COMPRESS_THRESHOLD
            || !self.prompts.is_enabled(keys::PLOT_ARCS_COMPRESS)
        {
            return Ok(truncate_at_line_boundary(&joined, DISTILL_MAX_CHARS));
        }

        let stage = PlotArcStage::Distill;
        let prompt = self
            .prompts
            .format_with(
                keys::PLOT_ARCS_COMPRESS,
                [
                    ("plot_arcs", joined.clone()),
                    ("max_chars", DISTILL_MAX_CHARS.to_string()),
                ],
            )
            .map_err(|source| PlotArcError::Prompt { stage, source })?;
        let response = model
            .invoke(&prompt, None)
            .map_err(|source| PlotArcError::Model { stage, source })?;
        let source = if response.trim().is_empty() {
            self.log(LogLevel::Warn, "伏笔精简返回空结果，直接截断。");
            joined
        } else {
            response
        };
        Ok(truncate_at_line_boundary(&source, DISTILL_MAX_CHARS))
    }

    /// Rewrites the foreshadowing block of `global_summary.txt`. Returns the
    /// distilled block.
    pub fn distill_into_summary(
        &self,
        model: &dyn LanguageModel,
        project: &Project,
        chapter_number: u32,
    ) -> Result<String, PlotArcError> {
        let ledger = project.plot_arcs()?;
        if ledger.trim().is_empty() {
            return Ok(String::new());
        }
        let distilled = self.distill(model, &ledger)?;
        let summary = project.global_summary()?;
        let updated = replace_foreshadow_block(&summary, chapter_number, &distilled);
        if !updated.trim().is_empty() {
            project.write_global_summary(&updated)?;
        }
        Ok(distilled)
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

fn unresolved_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^[\s*·•\-]*\[([ABC])级-[^\]]+\]").expect("invalid unresolved arc regex")
    })
}

fn resolved_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^[\s*·•\-]*(?:[✓✅☑]\s*已解决[:：]?|\[已解决\])")
            .expect("invalid resolved arc regex")
    })
}

fn foreshadow_header_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"━━━ 未解决伏笔[^\n]*?━━━").expect("invalid foreshadow header regex")
    })
}

fn blank_run_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\n{3,}").expect("invalid blank run regex"))
}
