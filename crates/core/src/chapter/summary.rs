use std::sync::OnceLock;

use regex::Regex;

use crate::blueprint::ChapterBlueprintEntry;
use crate::llm::LanguageModel;
use crate::project::Project;
use crate::prompts::{keys, PromptArguments, PromptRegistry};

use super::{truncate_chars, ChapterError, ChapterStage, NextChapterFields};

/// Summaries shorter than this trigger the simplified prompt.
pub const MIN_SUMMARY_CHARS: usize = 50;

const SUMMARY_LABELS: [&str; 4] = ["当前章节摘要", "章节摘要", "本章摘要", "摘要"];

/// Texts of up to `count` chapters before `current`, oldest first. Missing
/// chapters contribute nothing.
pub fn load_recent_chapters(
    project: &Project,
    current: u32,
    count: usize,
) -> Result<Vec<String>, ChapterError> {
    if current <= 1 || count == 0 {
        return Ok(Vec::new());
    }
    let start = current.saturating_sub(count as u32).max(1);
    let mut texts = Vec::new();
    for chapter_number in start..current {
        if let Some(text) = project.chapter_text(chapter_number)? {
            if !text.trim().is_empty() {
                texts.push(text);
            }
        }
    }
    Ok(texts)
}

pub fn summarize_recent_chapters(
    model: &dyn LanguageModel,
    prompts: &PromptRegistry,
    chapter: &ChapterBlueprintEntry,
    next: &NextChapterFields,
    combined_text: &str,
    chapter_number: u32,
) -> Result<String, ChapterError> {
    let stage = ChapterStage::Summary;
    let prompt = prompts
        .format(
            keys::CHAPTER_SUMMARY,
            &summary_arguments(chapter, next, combined_text, chapter_number),
        )
        .map_err(|source| ChapterError::Prompt { stage, source })?;
    model
        .invoke(&prompt, None)
        .map_err(|source| ChapterError::Model { stage, source })
}

pub fn summarize_simple(
    model: &dyn LanguageModel,
    prompts: &PromptRegistry,
    chapter: &ChapterBlueprintEntry,
    combined_text: &str,
    chapter_number: u32,
) -> Result<String, ChapterError> {
    let stage = ChapterStage::Summary;
    let prompt = prompts
        .format_with(
            keys::CHAPTER_SUMMARY_SIMPLE,
            [
                ("combined_text", combined_text.to_string()),
                ("novel_number", chapter_number.to_string()),
                ("chapter_title", chapter.chapter_title.clone()),
                ("chapter_summary", chapter.chapter_summary.clone()),
            ],
        )
        .map_err(|source| ChapterError::Prompt { stage, source })?;
    model
        .invoke(&prompt, None)
        .map_err(|source| ChapterError::Model { stage, source })
}

/// Text after the highest-priority summary marker; without any marker the
/// largest prose block is used.
pub fn extract_summary(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }

    for regex in marker_regexes() {
        if let Some(found) = regex.find(text) {
            let rest = text[found.end()..]
                .trim()
                .trim_start_matches('*')
                .trim();
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
    }

    largest_prose_block(text)
}

pub fn extract_bounded_summary(text: &str, max_chars: usize) -> String {
    truncate_chars(&extract_summary(text), max_chars)
}

fn largest_prose_block(text: &str) -> String {
    text.split("\n\n")
        .map(|block| {
            block
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .max_by_key(|block| block.chars().count())
        .unwrap_or_default()
}

fn marker_regexes() -> &'static [Regex] {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        SUMMARY_LABELS
            .iter()
            .map(|label| {
                Regex::new(&format!(
                    r"(?:[【\[]\s*{label}\s*[】\]]\s*[:：]?|\*{{0,2}}{label}\*{{0,2}}\s*[:：]\*{{0,2}})"
                ))
                .expect("invalid summary marker regex")
            })
            .collect()
    })
}

fn summary_arguments(
    chapter: &ChapterBlueprintEntry,
    next: &NextChapterFields,
    combined_text: &str,
    chapter_number: u32,
) -> PromptArguments {
    let mut args = PromptArguments::new();
    args.insert("combined_text".into(), combined_text.to_string());
    args.insert("novel_number".into(), chapter_number.to_string());
    args.insert("chapter_title".into(), chapter.chapter_title.clone());
    args.insert("chapter_role".into(), chapter.chapter_role.clone());
    args.insert("chapter_purpose".into(), chapter.chapter_purpose.clone());
    args.insert("suspense_level".into(), chapter.suspense_level.clone());
    args.insert("foreshadowing".into(), chapter.foreshadowing.clone());
    args.insert("plot_twist_level".into(), chapter.plot_twist_level.clone());
    args.insert("chapter_summary".into(), chapter.chapter_summary.clone());
    next.insert_into(&mut args);
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_summary_by_marker() {
        let response = "一些内容\n当前章节摘要: 这是摘要部分";
        assert_eq!(extract_summary(response), "这是摘要部分");
    }

    #[test]
    fn prefers_higher_priority_markers() {
        let response = "摘要: 次要\n\n**当前章节摘要**：主要内容";
        assert_eq!(extract_summary(response), "主要内容");
        assert_eq!(extract_summary("【本章摘要】\n括号形式"), "括号形式");
    }

    #[test]
    fn falls_back_to_largest_block() {
        let response = "# 标题\n\n短段\n\n这是一段明显更长的正文摘要内容，描述了主角的行动。";
        assert_eq!(
            extract_summary(response),
            "这是一段明显更长的正文摘要内容，描述了主角的行动。"
        );
        assert_eq!(extract_summary("纯文本摘要"), "纯文本摘要");
        assert_eq!(extract_summary("  "), "");
    }

    #[test]
    fn bounded_summary_is_truncated() {
        let long = format!("当前章节摘要: {}", "字".repeat(3000));
        assert_eq!(extract_bounded_summary(&long, 2000).chars().count(), 2000);
    }
}
