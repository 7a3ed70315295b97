use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::{CancellationToken, Cancelled};
use crate::llm::{LanguageModel, LanguageModelError};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::project::{self, ArtifactError, Project};
use crate::prompts::{keys, BlueprintLabels, PromptError, PromptRegistry};

/// Only the most recent records are fed back into chunk prompts.
pub const BLUEPRINT_CONTEXT_LIMIT: usize = 100;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChapterBlueprintEntry {
    pub chapter_number: u32,
    pub chapter_title: String,
    pub chapter_role: String,
    pub chapter_purpose: String,
    pub suspense_level: String,
    pub foreshadowing: String,
    pub plot_twist_level: String,
    pub chapter_summary: String,
}

impl ChapterBlueprintEntry {
    /// Record with only number and title, used when the blueprint has no entry.
    pub fn synthesized(chapter_number: u32) -> Self {
        Self {
            chapter_number,
            chapter_title: format!("第{chapter_number}章"),
            chapter_role: String::new(),
            chapter_purpose: String::new(),
            suspense_level: String::new(),
            foreshadowing: String::new(),
            plot_twist_level: String::new(),
            chapter_summary: String::new(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "第{}章 - [{}]\n本章定位：[{}]\n核心作用：[{}]\n悬念密度：[{}]\n伏笔操作：[{}]\n认知颠覆：{}\n本章简述：[{}]",
            self.chapter_number,
            self.chapter_title,
            self.chapter_role,
            self.chapter_purpose,
            self.suspense_level,
            self.foreshadowing,
            self.plot_twist_level,
            self.chapter_summary
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LookupSource {
    Number,
    Position,
    Synthesized,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChapterLookup {
    pub entry: ChapterBlueprintEntry,
    pub source: LookupSource,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChapterBlueprint {
    raw_text: String,
    chapters: Vec<ChapterBlueprintEntry>,
    warnings: Vec<String>,
}

impl ChapterBlueprint {
    pub fn from_text(raw_text: impl Into<String>) -> Self {
        Self::parse(raw_text, &BlueprintLabels::default())
    }

    pub fn parse(raw_text: impl Into<String>, labels: &BlueprintLabels) -> Self {
        let trimmed = raw_text.into().trim().to_string();
        let (chapters, warnings) = parse_chapter_blueprint(&trimmed, labels);
        Self {
            raw_text: trimmed,
            chapters,
            warnings,
        }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    /// Records in document order.
    pub fn chapters(&self) -> &[ChapterBlueprintEntry] {
        &self.chapters
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn chapter(&self, number: u32) -> Option<&ChapterBlueprintEntry> {
        self.chapters
            .iter()
            .find(|entry| entry.chapter_number == number)
    }

    /// By number, else the `number`-th record by position, else synthesized.
    pub fn lookup(&self, number: u32) -> ChapterLookup {
        if let Some(entry) = self.chapter(number) {
            return ChapterLookup {
                entry: entry.clone(),
                source: LookupSource::Number,
            };
        }
        if let Some(entry) = number
            .checked_sub(1)
            .and_then(|index| self.chapters.get(index as usize))
        {
            return ChapterLookup {
                entry: entry.clone(),
                source: LookupSource::Position,
            };
        }
        ChapterLookup {
            entry: ChapterBlueprintEntry::synthesized(number),
            source: LookupSource::Synthesized,
        }
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    pub fn max_chapter_number(&self) -> Option<u32> {
        self.chapters.iter().map(|entry| entry.chapter_number).max()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChapterBlueprintRequest {
    pub number_of_chapters: u32,
    pub user_guidance: String,
    pub max_tokens: u32,
    /// Rendered volume plan, or a marker for unpartitioned novels.
    pub volume_plan: String,
}

impl ChapterBlueprintRequest {
    pub fn new(number_of_chapters: u32, user_guidance: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            number_of_chapters,
            user_guidance: user_guidance.into(),
            max_tokens,
            volume_plan: "（未分卷）".to_string(),
        }
    }

    pub fn with_volume_plan(mut self, plan: impl Into<String>) -> Self {
        self.volume_plan = plan.into();
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlueprintPromptKind {
    Initial,
    Chunk { start: u32, end: u32 },
}

impl BlueprintPromptKind {
    fn prompt_key(&self) -> &'static str {
        match self {
            Self::Initial => keys::CHAPTER_BLUEPRINT,
            Self::Chunk { .. } => keys::CHUNKED_BLUEPRINT,
        }
    }
}

impl fmt::Display for BlueprintPromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "章节蓝图-单次生成"),
            Self::Chunk { start, end } => write!(f, "章节蓝图-分块({start}-{end})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlueprintOutcome {
    Complete(ChapterBlueprint),
    /// The model returned nothing usable; everything before `next_chapter`
    /// is persisted and a rerun resumes there.
    Paused {
        next_chapter: u32,
        blueprint: ChapterBlueprint,
    },
}

impl BlueprintOutcome {
    pub fn blueprint(&self) -> &ChapterBlueprint {
        match self {
            Self::Complete(blueprint) | Self::Paused { blueprint, .. } => blueprint,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("architecture file `{path}` is empty")]
    EmptyArchitecture { path: PathBuf },
    #[error("failed to render {kind} prompt: {source}")]
    Prompt {
        kind: BlueprintPromptKind,
        #[source]
        source: PromptError,
    },
    #[error("language model invocation failed for {kind}: {source}")]
    Model {
        kind: BlueprintPromptKind,
        #[source]
        source: LanguageModelError,
    },
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

pub struct ChapterBlueprintService<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
}

impl<'a> ChapterBlueprintService<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self { prompts, sink }
    }

    /// Generates or resumes `Novel_directory.txt`, persisting after every chunk.
    pub fn generate(
        &self,
        model: &dyn LanguageModel,
        project: &Project,
        request: &ChapterBlueprintRequest,
        cancel: &CancellationToken,
    ) -> Result<BlueprintOutcome, BlueprintError> {
        let architecture_path = project.architecture_path();
        let architecture = project::read_required(&architecture_path)?;
        let architecture = architecture.trim().to_string();
        if architecture.is_empty() {
            return Err(BlueprintError::EmptyArchitecture {
                path: architecture_path,
            });
        }

        let labels = self.prompts.blueprint_labels();
        let mut final_text = project.blueprint_text()?.trim().to_string();
        let max_existing = ChapterBlueprint::parse(final_text.as_str(), labels)
            .max_chapter_number()
            .unwrap_or(0);
        let target = request.number_of_chapters;
        let chunk_size = compute_chunk_size(target, request.max_tokens);

        self.log(
            LogLevel::Info,
            format!("章节总数 = {target}，计算出的 chunk_size = {chunk_size}，已有蓝图至第{max_existing}章。"),
        );

        if max_existing >= target {
            self.log(LogLevel::Info, "章节蓝图已完整，无需生成。");
            return Ok(BlueprintOutcome::Complete(self.parse(&final_text)));
        }

        if max_existing == 0 && chunk_size >= target {
            cancel.check()?;
            let kind = BlueprintPromptKind::Initial;
            let prompt = self.render(
                kind,
                &architecture,
                request,
                [("number_of_chapters", target.to_string())],
            )?;
            let response = model
                .invoke(&prompt, None)
                .map_err(|source| BlueprintError::Model { kind, source })?;
            let records = strip_duplicate_records(response.trim(), 0);
            if records.is_empty() {
                self.log(LogLevel::Warn, format!("{kind} 返回空结果，保持现有蓝图不变。"));
                return Ok(BlueprintOutcome::Paused {
                    next_chapter: 1,
                    blueprint: self.parse(&final_text),
                });
            }
            project::write_atomic(&project.blueprint_path(), &records)?;
            self.log(LogLevel::Info, "章节蓝图已生成（单次模式）。");
            return Ok(BlueprintOutcome::Complete(self.parse(&records)));
        }

        let mut current_max = max_existing;
        let mut start = max_existing + 1;
        while start <= target {
            cancel.check()?;
            let end = (start + chunk_size - 1).min(target);
            let kind = BlueprintPromptKind::Chunk { start, end };
            let prompt = self.render(
                kind,
                &architecture,
                request,
                [
                    ("chapter_list", limit_chapter_blueprint(&final_text, BLUEPRINT_CONTEXT_LIMIT)),
                    ("number_of_chapters", target.to_string()),
                    ("n", start.to_string()),
                    ("m", end.to_string()),
                ],
            )?;

            self.log(LogLevel::Info, format!("正在生成第{start}-{end}章的目录..."));
            let response = model
                .invoke(&prompt, None)
                .map_err(|source| BlueprintError::Model { kind, source })?;

            let records = strip_duplicate_records(response.trim(), current_max);
            if records.is_empty() {
                self.log(
                    LogLevel::Warn,
                    format!("{kind} 返回空结果，已保存前{current_max}章蓝图，可稍后续写。"),
                );
                return Ok(BlueprintOutcome::Paused {
                    next_chapter: start,
                    blueprint: self.parse(&final_text),
                });
            }

            if !final_text.is_empty() {
                final_text.push_str("\n\n");
            }
            final_text.push_str(&records);
            project::write_atomic(&project.blueprint_path(), &final_text)?;

            let parsed_max = self.parse(&records).max_chapter_number().unwrap_or(end);
            if parsed_max < end {
                self.log(
                    LogLevel::Warn,
                    format!("{kind} 只返回到第{parsed_max}章，缺失的章节将在查询时按位置补齐。"),
                );
            }
            current_max = current_max.max(parsed_max).max(end);
            start = current_max + 1;
        }

        self.log(LogLevel::Info, "章节蓝图已全部生成（分块模式）。");
        Ok(BlueprintOutcome::Complete(self.parse(&final_text)))
    }

    pub fn load(&self, project: &Project) -> Result<Option<ChapterBlueprint>, BlueprintError> {
        let content = project.blueprint_text()?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let blueprint = self.parse(trimmed);
        for warning in blueprint.warnings() {
            self.log(LogLevel::Warn, warning.clone());
        }
        Ok(Some(blueprint))
    }

    fn parse(&self, text: &str) -> ChapterBlueprint {
        ChapterBlueprint::parse(text, self.prompts.blueprint_labels())
    }

    fn render<const N: usize>(
        &self,
        kind: BlueprintPromptKind,
        architecture: &str,
        request: &ChapterBlueprintRequest,
        extra: [(&str, String); N],
    ) -> Result<String, BlueprintError> {
        let mut arguments = crate::prompts::PromptArguments::new();
        arguments.insert("novel_architecture".into(), architecture.to_string());
        arguments.insert("volume_plan".into(), request.volume_plan.clone());
        arguments.insert("user_guidance".into(), request.user_guidance.trim().to_string());
        for (key, value) in extra {
            arguments.insert(key.to_string(), value);
        }
        self.prompts
            .format(kind.prompt_key(), &arguments)
            .map_err(|source| BlueprintError::Prompt { kind, source })
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

/// `max(1, min(target, floor(max_tokens / 200 / 10) * 10 - 10))`.
pub fn compute_chunk_size(number_of_chapters: u32, max_tokens: u32) -> u32 {
    if number_of_chapters == 0 {
        return 1;
    }
    let tens = (max_tokens / 200 / 10) as i64 * 10 - 10;
    tens.min(number_of_chapters as i64).max(1) as u32
}

/// Keeps the last `limit` chapter records of `text`.
pub fn limit_chapter_blueprint(text: &str, limit: usize) -> String {
    if limit == 0 {
        return String::new();
    }
    let trimmed = text.trim();
    let records = split_records(trimmed);
    if records.len() <= limit {
        return trimmed.to_string();
    }
    records[records.len() - limit..]
        .iter()
        .map(|record| trimmed[record.span.clone()].trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Drops leading chatter and records numbered at or below `current_max`.
fn strip_duplicate_records(text: &str, current_max: u32) -> String {
    split_records(text)
        .into_iter()
        .filter(|record| record.number.map_or(true, |number| number > current_max))
        .map(|record| text[record.span].trim().to_string())
        .filter(|record| !record.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

struct RawRecord {
    number: Option<u32>,
    span: Range<usize>,
}

/// Byte spans of chapter records, each starting at a header line.
fn split_records(text: &str) -> Vec<RawRecord> {
    let mut starts = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if let Some(caps) = header_regex().captures(line.trim_end()) {
            let number = caps.get(1).and_then(|m| parse_chapter_number(m.as_str()));
            starts.push((offset, number));
        }
        offset += line.len();
    }

    let mut records = Vec::with_capacity(starts.len());
    for (index, (start, number)) in starts.iter().enumerate() {
        let end = starts
            .get(index + 1)
            .map(|(next, _)| *next)
            .unwrap_or(text.len());
        records.push(RawRecord {
            number: *number,
            span: *start..end,
        });
    }
    records
}

/// Parses records in document order. Returns the entries and warnings for
/// headers whose number had to be inferred.
pub fn parse_chapter_blueprint(
    text: &str,
    labels: &BlueprintLabels,
) -> (Vec<ChapterBlueprintEntry>, Vec<String>) {
    let mut entries: Vec<ChapterBlueprintEntry> = Vec::new();
    let mut warnings = Vec::new();

    for record in split_records(text) {
        let block = &text[record.span];
        let mut lines = block.lines().map(str::trim).filter(|line| !line.is_empty());
        let Some(header) = lines.next() else {
            continue;
        };
        let Some(caps) = header_regex().captures(header) else {
            continue;
        };

        let chapter_number = match record.number {
            Some(number) => number,
            None => {
                let inferred = entries.last().map(|e| e.chapter_number).unwrap_or(0) + 1;
                warnings.push(format!(
                    "章节标题「{header}」缺少章节号，按上一章推断为第{inferred}章"
                ));
                inferred
            }
        };

        let mut entry = ChapterBlueprintEntry {
            chapter_title: clean_title(caps.get(2).map(|m| m.as_str()).unwrap_or_default()),
            ..ChapterBlueprintEntry::synthesized(chapter_number)
        };
        if entry.chapter_title.is_empty() {
            entry.chapter_title = format!("第{chapter_number}章");
        }

        for line in lines {
            let Some((label, value)) = split_field(line) else {
                continue;
            };
            let slot = if matches_label(&labels.chapter_role, label) {
                &mut entry.chapter_role
            } else if matches_label(&labels.chapter_purpose, label) {
                &mut entry.chapter_purpose
            } else if matches_label(&labels.suspense_level, label) {
                &mut entry.suspense_level
            } else if matches_label(&labels.foreshadowing, label) {
                &mut entry.foreshadowing
            } else if matches_label(&labels.plot_twist_level, label) {
                &mut entry.plot_twist_level
            } else if matches_label(&labels.chapter_summary, label) {
                &mut entry.chapter_summary
            } else {
                continue;
            };
            if slot.is_empty() {
                *slot = value;
            }
        }

        entries.push(entry);
    }

    (entries, warnings)
}

fn matches_label(synonyms: &[String], label: &str) -> bool {
    synonyms.iter().any(|synonym| synonym == label)
}

fn split_field(line: &str) -> Option<(&str, String)> {
    let line = line
        .trim_start_matches(|c: char| matches!(c, '-' | '*' | '•' | '·' | '├' | '└' | '─' | '│'))
        .trim();
    let index = line.find([':', '：'])?;
    let label = line[..index].trim().trim_matches('*').trim();
    let separator_len = line[index..].chars().next().map(char::len_utf8).unwrap_or(1);
    let value = line[index + separator_len..].trim().trim_matches('*').trim();
    if label.is_empty() || label.chars().count() > 12 {
        return None;
    }
    Some((label, strip_brackets(value).to_string()))
}

fn strip_brackets(value: &str) -> &str {
    let value = value.trim();
    for (open, close) in [('[', ']'), ('【', '】'), ('《', '》')] {
        if let Some(inner) = value
            .strip_prefix(open)
            .and_then(|rest| rest.strip_suffix(close))
        {
            if !inner.contains(open) {
                return inner.trim();
            }
        }
    }
    value
}

fn clean_title(raw: &str) -> String {
    let title = raw
        .trim()
        .trim_start_matches(|c: char| {
            c.is_whitespace() || matches!(c, '-' | '—' | '–' | ':' | '：' | '、' | '.' | '*')
        })
        .trim_end_matches(|c: char| c.is_whitespace() || c == '*');
    strip_brackets(title).to_string()
}

/// Arabic digits or Chinese numerals up to the thousands.
pub fn parse_chapter_number(text: &str) -> Option<u32> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text.chars().all(|c| c.is_ascii_digit()) {
        return text.parse().ok();
    }

    let mut total = 0u32;
    let mut current = 0u32;
    for ch in text.chars() {
        let digit = match ch {
            '零' | '〇' => Some(0),
            '一' => Some(1),
            '二' | '两' => Some(2),
            '三' => Some(3),
            '四' => Some(4),
            '五' => Some(5),
            '六' => Some(6),
            '七' => Some(7),
            '八' => Some(8),
            '九' => Some(9),
            _ => None,
        };
        if let Some(digit) = digit {
            current = digit;
            continue;
        }
        let unit = match ch {
            '十' => 10,
            '百' => 100,
            '千' => 1000,
            _ => return None,
        };
        let multiplier = if current == 0 { 1 } else { current };
        total += multiplier * unit;
        current = 0;
    }
    let value = total + current;
    (value > 0).then_some(value)
}

fn header_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^\s*(?:\*{1,3}\s*)?第\s*([0-9]+|[零〇一二两三四五六七八九十百千]+)?\s*章(.*)$")
            .expect("invalid chapter header regex")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::VecLogSink;
    use crate::testing::{blueprint_range, MockLanguageModel};
    use std::fs;
    use tempfile::TempDir;

    fn project_with_architecture() -> (TempDir, Project) {
        let temp = TempDir::new().expect("temp dir");
        let project = Project::open(temp.path()).unwrap();
        fs::write(project.architecture_path(), "核心设定").unwrap();
        (temp, project)
    }

    #[test]
    fn parse_multiple_chapters() {
        let text = r#"
第1章 - [紫极光下的预兆]
本章定位：[角色线]
核心作用：[铺垫世界观]
悬念密度：[渐进]
伏笔操作：[埋设-遗迹闪光]
认知颠覆：[★☆☆☆☆]
本章简述：[主人公第一次见到紫极光，内心充满未知]

第2章 - [风暴前的协议]
本章定位：政治冲突
核心作用：推进矛盾
悬念密度：[紧凑]
伏笔操作：[强化-盟约]
认知颠覆：★★☆☆☆
本章简述：主人公与反抗军签订协议，暗藏危机
"#;

        let blueprint = ChapterBlueprint::from_text(text);
        let chapters = blueprint.chapters();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].chapter_number, 1);
        assert_eq!(chapters[0].chapter_title, "紫极光下的预兆");
        assert_eq!(chapters[0].chapter_role, "角色线");
        assert_eq!(chapters[1].chapter_number, 2);
        assert_eq!(chapters[1].chapter_title, "风暴前的协议");
        assert_eq!(chapters[1].chapter_purpose, "推进矛盾");
        assert_eq!(chapters[1].plot_twist_level, "★★☆☆☆");
    }

    #[test]
    fn accepts_numerals_markdown_and_synonyms() {
        let text = "**第十二章：雾中城**\n- **定位**：过渡\n作用: 收束\n概要：雾散了\n\n第 章 无名之章\n简述：补记";
        let blueprint = ChapterBlueprint::from_text(text);
        let chapters = blueprint.chapters();
        assert_eq!(chapters[0].chapter_number, 12);
        assert_eq!(chapters[0].chapter_title, "雾中城");
        assert_eq!(chapters[0].chapter_role, "过渡");
        assert_eq!(chapters[0].chapter_purpose, "收束");
        assert_eq!(chapters[0].chapter_summary, "雾散了");
        assert_eq!(chapters[1].chapter_number, 13);
        assert_eq!(chapters[1].chapter_summary, "补记");
        assert_eq!(blueprint.warnings().len(), 1);
    }

    #[test]
    fn parses_chinese_numerals() {
        assert_eq!(parse_chapter_number("十"), Some(10));
        assert_eq!(parse_chapter_number("十二"), Some(12));
        assert_eq!(parse_chapter_number("二十五"), Some(25));
        assert_eq!(parse_chapter_number("一百零三"), Some(103));
        assert_eq!(parse_chapter_number("两千"), Some(2000));
        assert_eq!(parse_chapter_number("42"), Some(42));
        assert_eq!(parse_chapter_number("甲"), None);
    }

    #[test]
    fn lookup_falls_back_to_position_then_synthesized() {
        let mut text = blueprint_range(1, 6);
        text = text.replace("第5章 - [标题5]\n", "");
        let blueprint = ChapterBlueprint::from_text(text);

        let lookup = blueprint.lookup(5);
        assert_eq!(lookup.source, LookupSource::Position);
        assert_eq!(lookup.entry.chapter_number, 6);
        assert_eq!(blueprint.chapter(4).unwrap().chapter_role, "定位4");

        let missing = blueprint.lookup(40);
        assert_eq!(missing.source, LookupSource::Synthesized);
        assert_eq!(missing.entry.chapter_title, "第40章");
    }

    #[test]
    fn rendered_entries_parse_back_in_order() {
        let entries: Vec<_> = (1..=5)
            .map(|n| ChapterBlueprintEntry {
                chapter_summary: format!("概要{n}"),
                ..ChapterBlueprintEntry::synthesized(n)
            })
            .collect();
        let text = entries
            .iter()
            .map(ChapterBlueprintEntry::render)
            .collect::<Vec<_>>()
            .join("\n\n");
        let parsed = ChapterBlueprint::from_text(text);
        let numbers: Vec<_> = parsed.chapters().iter().map(|e| e.chapter_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(parsed.chapter(3).unwrap().chapter_summary, "概要3");
    }

    #[test]
    fn chunk_size_formula() {
        assert_eq!(compute_chunk_size(25, 4096), 10);
        assert_eq!(compute_chunk_size(25, 8000), 25);
        assert_eq!(compute_chunk_size(5, 8000), 5);
        assert_eq!(compute_chunk_size(25, 1000), 1);
    }

    #[test]
    fn limit_keeps_last_records() {
        let text = blueprint_range(1, 5);
        let limited = limit_chapter_blueprint(&text, 2);
        assert!(limited.starts_with("第4章"));
        assert!(!limited.contains("第3章 -"));
    }

    #[test]
    fn chunked_generation_resumes_without_duplicates() {
        let (_temp, project) = project_with_architecture();
        let prompts = PromptRegistry::new().expect("registry");
        let sink = VecLogSink::new();
        let service = ChapterBlueprintService::new(&prompts, &sink);
        let request = ChapterBlueprintRequest::new(25, "测试", 4096);

        let first = blueprint_range(1, 10);
        let second = blueprint_range(11, 20);
        let mock = MockLanguageModel::new(vec![first.as_str(), second.as_str(), ""]);
        let outcome = service
            .generate(&mock, &project, &request, &CancellationToken::new())
            .unwrap();
        assert_eq!(
            outcome,
            BlueprintOutcome::Paused {
                next_chapter: 21,
                blueprint: ChapterBlueprint::from_text(format!("{first}\n\n{second}")),
            }
        );

        let overlapping = format!("好的，以下是目录：\n{}\n\n{}", blueprint_range(20, 20), blueprint_range(21, 25));
        let mock = MockLanguageModel::new(vec![overlapping.as_str()]);
        let outcome = service
            .generate(&mock, &project, &request, &CancellationToken::new())
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(mock.calls(), 1);
        assert!(mock.prompts()[0].contains("第21章到第25章"));

        let stored = project.blueprint_text().unwrap();
        let headers = stored.matches("第20章 - ").count();
        assert_eq!(headers, 1);
        let numbers: Vec<_> = outcome
            .blueprint()
            .chapters()
            .iter()
            .map(|e| e.chapter_number)
            .collect();
        assert_eq!(numbers, (1..=25).collect::<Vec<_>>());
    }

    #[test]
    fn overshooting_chunk_moves_the_next_range_forward() {
        let (_temp, project) = project_with_architecture();
        let prompts = PromptRegistry::new().expect("registry");
        let sink = VecLogSink::new();
        let service = ChapterBlueprintService::new(&prompts, &sink);
        let request = ChapterBlueprintRequest::new(25, "测试", 4096);

        let first = blueprint_range(1, 15);
        let second = blueprint_range(16, 25);
        let mock = MockLanguageModel::new(vec![first.as_str(), second.as_str()]);
        let outcome = service
            .generate(&mock, &project, &request, &CancellationToken::new())
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(mock.calls(), 2);
        assert!(mock.prompts()[1].contains("第16章到第25章"));
        let numbers: Vec<_> = outcome
            .blueprint()
            .chapters()
            .iter()
            .map(|e| e.chapter_number)
            .collect();
        assert_eq!(numbers, (1..=25).collect::<Vec<_>>());
    }

    #[test]
    fn single_shot_when_chunk_covers_target() {
        let (_temp, project) = project_with_architecture();
        let prompts = PromptRegistry::new().expect("registry");
        let sink = VecLogSink::new();
        let service = ChapterBlueprintService::new(&prompts, &sink);
        let request = ChapterBlueprintRequest::new(3, "测试", 8000);

        let mock = MockLanguageModel::new(vec![blueprint_range(1, 3).as_str()]);
        let outcome = service
            .generate(&mock, &project, &request, &CancellationToken::new())
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.blueprint().len(), 3);
        assert!(mock.prompts()[0].contains("设计3章的节奏分布"));
    }

    #[test]
    fn cancellation_stops_between_chunks() {
        let (_temp, project) = project_with_architecture();
        let prompts = PromptRegistry::new().expect("registry");
        let sink = VecLogSink::new();
        let service = ChapterBlueprintService::new(&prompts, &sink);
        let request = ChapterBlueprintRequest::new(25, "测试", 4096);
        let token = CancellationToken::new();
        token.cancel();

        let mock = MockLanguageModel::new(vec![]);
        let err = service
            .generate(&mock, &project, &request, &token)
            .unwrap_err();
        assert!(matches!(err, BlueprintError::Cancelled(_)));
        assert_eq!(mock.calls(), 0);
    }

    #[test]
    fn missing_architecture_is_reported() {
        let temp = TempDir::new().unwrap();
        let project = Project::open(temp.path()).unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ChapterBlueprintService::new(&prompts, &sink);
        let err = service
            .generate(
                &MockLanguageModel::new(vec![]),
                &project,
                &ChapterBlueprintRequest::new(5, "", 4096),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, BlueprintError::Artifact(ArtifactError::Missing { .. })));
    }
}
