use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blueprint::{ChapterBlueprint, ChapterBlueprintEntry, LookupSource};
use crate::llm::{LanguageModel, LanguageModelError};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::project::{ArtifactError, Project};
use crate::prompts::{keys, PromptArguments, PromptError, PromptRegistry};
use crate::retrieval::{
    RetrievalEngine, RetrievalRequest, DEFAULT_MAX_TOTAL_RESULTS,
    DEFAULT_RETRIEVAL_K, KNOWLEDGE_EMPTY,
};
use crate::seed::DEFAULT_USER_GUIDANCE;
use crate::volume::VolumePlan;

mod prompt;
mod summary;

use prompt::{
    render_first_chapter_prompt, render_next_chapter_prompt, FirstChapterContext,
    NextChapterContext,
};
pub use summary::{extract_summary, MIN_SUMMARY_CHARS};
use summary::{extract_bounded_summary, load_recent_chapters, summarize_recent_chapters, summarize_simple};

pub const MAX_HISTORY_CHAPTERS: usize = 3;
pub const MAX_SUMMARY_SOURCE_CHARS: usize = 4_000;
pub const MAX_SUMMARY_OUTPUT_CHARS: usize = 2_000;
pub const PREVIOUS_EXCERPT_CHARS: usize = 800;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChapterStage {
    Summary,
    Prompt,
    Draft,
    Enrich,
}

impl ChapterStage {
    fn label(&self) -> &'static str {
        match self {
            Self::Summary => "章节摘要",
            Self::Prompt => "提示词构建",
            Self::Draft => "章节草稿生成",
            Self::Enrich => "章节扩写",
        }
    }
}

impl fmt::Display for ChapterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum ChapterError {
    #[error("渲染{stage}提示词失败: {source}")]
    Prompt {
        stage: ChapterStage,
        #[source]
        source: PromptError,
    },
    #[error("调用模型执行{stage}失败: {source}")]
    Model {
        stage: ChapterStage,
        #[source]
        source: LanguageModelError,
    },
    #[error("第{chapter}章草稿生成结果为空，未写入任何文件")]
    EmptyDraft { chapter: u32 },
    #[error("第{chapter}章不存在或内容为空")]
    MissingChapter { chapter: u32 },
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Per-chapter hints supplied by the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChapterGuidance {
    pub user_guidance: String,
    pub characters_involved: String,
    pub key_items: String,
    pub scene_location: String,
    pub time_constraint: String,
}

impl ChapterGuidance {
    pub fn with_user_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.user_guidance = guidance.into();
        self
    }

    pub fn user_guidance_or_default(&self) -> &str {
        if self.user_guidance.trim().is_empty() {
            DEFAULT_USER_GUIDANCE
        } else {
            &self.user_guidance
        }
    }
}

/// Blueprint fields of the following chapter, or neutral defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NextChapterFields {
    pub number: u32,
    pub title: String,
    pub role: String,
    pub purpose: String,
    pub suspense_level: String,
    pub foreshadowing: String,
    pub plot_twist_level: String,
    pub summary: String,
}

impl NextChapterFields {
    pub fn from_entry(entry: &ChapterBlueprintEntry) -> Self {
        Self {
            number: entry.chapter_number,
            title: entry.chapter_title.clone(),
            role: entry.chapter_role.clone(),
            purpose: entry.chapter_purpose.clone(),
            suspense_level: entry.suspense_level.clone(),
            foreshadowing: entry.foreshadowing.clone(),
            plot_twist_level: entry.plot_twist_level.clone(),
            summary: entry.chapter_summary.clone(),
        }
    }

    pub fn placeholder(number: u32) -> Self {
        Self {
            number,
            title: "（未命名）".to_string(),
            role: "过渡章节".to_string(),
            purpose: "承上启下".to_string(),
            suspense_level: "中等".to_string(),
            foreshadowing: "无特殊伏笔".to_string(),
            plot_twist_level: "★☆☆☆☆".to_string(),
            summary: "衔接过渡内容".to_string(),
        }
    }

    fn insert_into(&self, args: &mut PromptArguments) {
        args.insert("next_chapter_number".into(), self.number.to_string());
        args.insert("next_chapter_title".into(), self.title.clone());
        args.insert("next_chapter_role".into(), self.role.clone());
        args.insert("next_chapter_purpose".into(), self.purpose.clone());
        args.insert("next_chapter_suspense_level".into(), self.suspense_level.clone());
        args.insert("next_chapter_foreshadowing".into(), self.foreshadowing.clone());
        args.insert("next_chapter_plot_twist_level".into(), self.plot_twist_level.clone());
        args.insert("next_chapter_summary".into(), self.summary.clone());
    }
}

#[derive(Clone, Debug)]
pub struct ChapterDraftRequest<'a> {
    pub chapter_number: u32,
    pub word_number: u32,
    pub blueprint: &'a ChapterBlueprint,
    pub volume_plan: &'a VolumePlan,
    pub guidance: ChapterGuidance,
    pub history_chapters: usize,
    pub retrieval_k: usize,
    pub max_total_results: usize,
    /// Caller-edited prompt used verbatim instead of building one.
    pub custom_prompt: Option<String>,
}

impl<'a> ChapterDraftRequest<'a> {
    pub fn new(
        chapter_number: u32,
        word_number: u32,
        blueprint: &'a ChapterBlueprint,
        volume_plan: &'a VolumePlan,
    ) -> Self {
        Self {
            chapter_number,
            word_number,
            blueprint,
            volume_plan,
            guidance: ChapterGuidance::default(),
            history_chapters: MAX_HISTORY_CHAPTERS,
            retrieval_k: DEFAULT_RETRIEVAL_K,
            max_total_results: DEFAULT_MAX_TOTAL_RESULTS,
            custom_prompt: None,
        }
    }

    pub fn with_guidance(mut self, guidance: ChapterGuidance) -> Self {
        self.guidance = guidance;
        self
    }

    pub fn with_custom_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_prompt = Some(prompt.into());
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct ChapterPrompt {
    pub prompt_text: String,
    pub summary: String,
    pub queries: Vec<String>,
    pub filtered_context: String,
}

#[derive(Clone, Debug)]
pub struct ChapterDraft {
    pub chapter_number: u32,
    pub content: String,
    pub prompt: String,
    pub path: PathBuf,
    pub summary: String,
    pub filtered_context: String,
}

pub struct ChapterService<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
}

impl<'a> ChapterService<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self { prompts, sink }
    }

    /// Resolves the chapter record, logging when the blueprint had to fall
    /// back to position or a synthesized entry.
    pub fn chapter_entry(&self, blueprint: &ChapterBlueprint, number: u32) -> ChapterBlueprintEntry {
        let lookup = blueprint.lookup(number);
        match lookup.source {
            LookupSource::Number => {}
            LookupSource::Position => self.log(
                LogLevel::Warn,
                format!(
                    "章节蓝图中未找到第{number}章标题，按位置使用第{number}条记录（原第{}章）。",
                    lookup.entry.chapter_number
                ),
            ),
            LookupSource::Synthesized => self.log(
                LogLevel::Warn,
                format!("章节蓝图中没有第{number}章，使用空白章节信息继续。"),
            ),
        }
        lookup.entry
    }

    pub fn build_chapter_prompt(
        &self,
        model: &dyn LanguageModel,
        retrieval: Option<&RetrievalEngine<'_>>,
        project: &Project,
        request: &ChapterDraftRequest<'_>,
    ) -> Result<ChapterPrompt, ChapterError> {
        let number = request.chapter_number;
        let chapter = self.chapter_entry(request.blueprint, number);
        let volume_context = self.volume_context(project, request.volume_plan, number)?;

        if number <= 1 {
            let architecture = project.architecture()?;
            let prompt_text = render_first_chapter_prompt(
                self.prompts,
                &FirstChapterContext {
                    chapter_number: number,
                    word_number: request.word_number,
                    chapter: &chapter,
                    guidance: &request.guidance,
                    architecture: architecture.trim(),
                    volume_context: &volume_context,
                },
            )?;
            return Ok(ChapterPrompt {
                prompt_text,
                ..ChapterPrompt::default()
            });
        }

        let next = request
            .blueprint
            .chapter(number + 1)
            .map(NextChapterFields::from_entry)
            .unwrap_or_else(|| NextChapterFields::placeholder(number + 1));

        let recent = load_recent_chapters(project, number, request.history_chapters.max(1))?;
        let combined = recent.join("\n");
        let combined_tail = tail_chars(&combined, MAX_SUMMARY_SOURCE_CHARS);
        let summary = if combined_tail.trim().is_empty() {
            String::new()
        } else {
            self.recency_summary(model, &chapter, &next, combined_tail, number)?
        };

        let previous_excerpt = project
            .chapter_text(number - 1)?
            .map(|text| tail_chars(text.trim(), PREVIOUS_EXCERPT_CHARS).to_string())
            .unwrap_or_default();

        let (queries, filtered_context) = match retrieval {
            Some(engine) => {
                let mut retrieval_request = RetrievalRequest::new(number, &chapter, &request.guidance);
                retrieval_request.short_summary = &summary;
                retrieval_request.volume_count = request.volume_plan.volume_count();
                retrieval_request.target_chapters = request.volume_plan.target_chapters();
                retrieval_request.k = request.retrieval_k;
                retrieval_request.max_total_results = request.max_total_results;
                let outcome = engine.retrieve(model, &retrieval_request);
                (outcome.queries, outcome.context)
            }
            None => (Vec::new(), KNOWLEDGE_EMPTY.to_string()),
        };

        let global_summary = project.global_summary()?;
        let character_state = project.character_state()?;
        let prompt_text = render_next_chapter_prompt(
            self.prompts,
            &NextChapterContext {
                chapter_number: number,
                word_number: request.word_number,
                chapter: &chapter,
                next: &next,
                guidance: &request.guidance,
                global_summary: global_summary.trim(),
                previous_excerpt: &previous_excerpt,
                character_state: character_state.trim(),
                short_summary: &summary,
                volume_context: &volume_context,
                filtered_context: &filtered_context,
            },
        )?;

        Ok(ChapterPrompt {
            prompt_text,
            summary,
            queries,
            filtered_context,
        })
    }

    /// Builds the prompt (unless a custom one is given), calls the model and
    /// writes `chapters/chapter_<n>.txt`. An empty reply writes nothing.
    pub fn generate_chapter_draft(
        &self,
        model: &dyn LanguageModel,
        retrieval: Option<&RetrievalEngine<'_>>,
        project: &Project,
        request: &ChapterDraftRequest<'_>,
    ) -> Result<ChapterDraft, ChapterError> {
        let prompt = match &request.custom_prompt {
            Some(text) if !text.trim().is_empty() => {
                self.log(LogLevel::Info, "使用自定义提示词生成章节草稿。");
                ChapterPrompt {
                    prompt_text: text.clone(),
                    ..ChapterPrompt::default()
                }
            }
            _ => self.build_chapter_prompt(model, retrieval, project, request)?,
        };

        let number = request.chapter_number;
        self.log(LogLevel::Info, format!("调用模型生成第{number}章草稿"));
        let response = model
            .invoke(&prompt.prompt_text, None)
            .map_err(|source| ChapterError::Model {
                stage: ChapterStage::Draft,
                source,
            })?;
        let content = response.trim().to_string();
        if content.is_empty() {
            return Err(ChapterError::EmptyDraft { chapter: number });
        }

        let path = project.write_chapter(number, &content)?;
        self.log(
            LogLevel::Info,
            format!("第{number}章草稿已保存（{} 字）：{}", content.chars().count(), path.display()),
        );
        Ok(ChapterDraft {
            chapter_number: number,
            content,
            prompt: prompt.prompt_text,
            path,
            summary: prompt.summary,
            filtered_context: prompt.filtered_context,
        })
    }

    /// Expands a short chapter towards `word_number`. Returns whether the
    /// file was rewritten; an empty reply keeps the original.
    pub fn enrich_chapter(
        &self,
        model: &dyn LanguageModel,
        project: &Project,
        chapter_number: u32,
        word_number: u32,
    ) -> Result<bool, ChapterError> {
        let text = project
            .chapter_text(chapter_number)?
            .filter(|text| !text.trim().is_empty())
            .ok_or(ChapterError::MissingChapter {
                chapter: chapter_number,
            })?;

        let stage = ChapterStage::Enrich;
        let prompt = self
            .prompts
            .format_with(
                keys::ENRICH,
                [
                    ("novel_number", chapter_number.to_string()),
                    ("chapter_text", text.trim().to_string()),
                    ("word_number", word_number.to_string()),
                ],
            )
            .map_err(|source| ChapterError::Prompt { stage, source })?;
        let response = model
            .invoke(&prompt, None)
            .map_err(|source| ChapterError::Model { stage, source })?;
        let enriched = response.trim();
        if enriched.is_empty() {
            self.log(LogLevel::Warn, format!("第{chapter_number}章扩写返回空结果，保留原文。"));
            return Ok(false);
        }
        project.write_chapter(chapter_number, enriched)?;
        self.log(
            LogLevel::Info,
            format!(
                "第{chapter_number}章已扩写：{} → {} 字",
                text.trim().chars().count(),
                enriched.chars().count()
            ),
        );
        Ok(true)
    }

    fn recency_summary(
        &self,
        model: &dyn LanguageModel,
        chapter: &ChapterBlueprintEntry,
        next: &NextChapterFields,
        combined_tail: &str,
        number: u32,
    ) -> Result<String, ChapterError> {
        self.log(LogLevel::Info, "生成章节摘要");
        let response =
            summarize_recent_chapters(model, self.prompts, chapter, next, combined_tail, number)?;
        let summary = extract_bounded_summary(&response, MAX_SUMMARY_OUTPUT_CHARS);
        if summary.chars().count() >= MIN_SUMMARY_CHARS
            || !self.prompts.is_enabled(keys::CHAPTER_SUMMARY_SIMPLE)
        {
            return Ok(summary);
        }

        self.log(
            LogLevel::Warn,
            format!("章节摘要过短（{} 字），改用简化提示词重试。", summary.chars().count()),
        );
        let retry = summarize_simple(model, self.prompts, chapter, combined_tail, number)?;
        let retried = extract_bounded_summary(&retry, MAX_SUMMARY_OUTPUT_CHARS);
        if retried.chars().count() > summary.chars().count() {
            Ok(retried)
        } else {
            Ok(summary)
        }
    }

    fn volume_context(
        &self,
        project: &Project,
        plan: &VolumePlan,
        number: u32,
    ) -> Result<String, ChapterError> {
        if !plan.is_partitioned() {
            return Ok("（未分卷）".to_string());
        }
        let volume = plan.volume_of(number);
        let mut context = match plan.range(volume) {
            Some(range) => format!(
                "分卷信息：第{volume}卷（第{}章 - 第{}章），本章为本卷第{}章。",
                range.start_chapter,
                range.end_chapter,
                number - range.start_chapter + 1
            ),
            None => format!("分卷信息：第{volume}卷。"),
        };
        if volume > 1 {
            let previous = project.volume_summary(volume - 1)?;
            if !previous.trim().is_empty() {
                context.push_str(&format!("\n上一卷总结：\n{}", previous.trim()));
            }
        }
        Ok(context)
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

/// Whether `text` is under `threshold` of the per-chapter word budget.
pub fn needs_enrichment(text: &str, words_per_chapter: u32, threshold: f64) -> bool {
    (text.trim().chars().count() as f64) < threshold * words_per_chapter as f64
}

fn tail_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((index, _)) => &text[index..],
        None => text,
    }
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::VecLogSink;
    use crate::project::write_atomic;
    use crate::retrieval::KNOWLEDGE_FALLBACK;
    use crate::testing::{blueprint_range, MockLanguageModel, UnavailableIndex};
    use crate::vectorstore::VectorStore;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Project, ChapterBlueprint, VolumePlan) {
        let temp = TempDir::new().unwrap();
        let project = Project::open(temp.path()).unwrap();
        write_atomic(&project.architecture_path(), "小说设定：城市守夜人").unwrap();
        let blueprint = ChapterBlueprint::from_text(blueprint_range(1, 6));
        let plan = VolumePlan::new(6, 0).unwrap();
        (temp, project, blueprint, plan)
    }

    #[test]
    fn tail_and_truncate_count_characters() {
        assert_eq!(tail_chars("甲乙丙丁", 2), "丙丁");
        assert_eq!(tail_chars("甲乙", 5), "甲乙");
        assert_eq!(truncate_chars("甲乙丙丁", 3), "甲乙丙");
        assert_eq!(truncate_chars("甲", 3), "甲");
    }

    #[test]
    fn first_chapter_uses_architecture_without_retrieval() {
        let (_temp, project, blueprint, plan) = setup();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ChapterService::new(&prompts, &sink);
        let request = ChapterDraftRequest::new(1, 800, &blueprint, &plan);

        let model = MockLanguageModel::new(vec!["第一章正文"]);
        let draft = service
            .generate_chapter_draft(&model, None, &project, &request)
            .unwrap();
        assert_eq!(model.calls(), 1);
        assert!(draft.prompt.contains("小说设定：城市守夜人"));
        assert!(draft.prompt.contains("标题1"));
        assert_eq!(project.chapter_text(1).unwrap().as_deref(), Some("第一章正文"));
    }

    #[test]
    fn later_chapter_summarizes_history_and_retries_short_summary() {
        let (_temp, project, blueprint, plan) = setup();
        project.write_chapter(1, "第一章：林默来到钟楼。").unwrap();
        project.write_chapter(2, "第二章：他找到了日记。").unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ChapterService::new(&prompts, &sink);
        let request = ChapterDraftRequest::new(3, 800, &blueprint, &plan);

        let long_summary = format!("当前章节摘要: {}", "林默决定追查日记的来历。".repeat(6));
        let model = MockLanguageModel::new(vec![
            "当前章节摘要: 太短",
            long_summary.as_str(),
            "第三章正文",
        ]);
        let draft = service
            .generate_chapter_draft(&model, None, &project, &request)
            .unwrap();
        assert_eq!(model.calls(), 3);
        assert!(draft.summary.starts_with("林默决定追查日记的来历。"));
        assert!(draft.prompt.contains("他找到了日记。"));
        assert!(draft.prompt.contains("标题4"));
        assert_eq!(draft.filtered_context, KNOWLEDGE_EMPTY);
    }

    #[test]
    fn unreachable_index_still_produces_a_draft() {
        let (_temp, project, blueprint, plan) = setup();
        project.write_chapter(1, "第一章：林默来到钟楼。").unwrap();
        project.write_chapter(2, "第二章：他找到了日记。").unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let index = UnavailableIndex;
        let store = VectorStore::new(&index, &sink).unwrap();
        let engine = RetrievalEngine::new(&prompts, &store, &sink);
        let service = ChapterService::new(&prompts, &sink);
        let request = ChapterDraftRequest::new(3, 800, &blueprint, &plan);

        let summary = format!("当前章节摘要: {}", "林默决定追查日记的来历。".repeat(6));
        let model = MockLanguageModel::new(vec![summary.as_str(), "第三章正文"]);
        let draft = service
            .generate_chapter_draft(&model, Some(&engine), &project, &request)
            .unwrap();
        assert_eq!(draft.filtered_context, KNOWLEDGE_FALLBACK);
        assert!(draft.prompt.contains(KNOWLEDGE_FALLBACK));
        assert_eq!(project.chapter_text(3).unwrap().as_deref(), Some("第三章正文"));
        assert!(!sink.messages_at(LogLevel::Warn).is_empty());
    }

    #[test]
    fn empty_draft_writes_nothing() {
        let (_temp, project, blueprint, plan) = setup();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ChapterService::new(&prompts, &sink);
        let request = ChapterDraftRequest::new(1, 800, &blueprint, &plan);

        let model = MockLanguageModel::new(vec![""]);
        let err = service
            .generate_chapter_draft(&model, None, &project, &request)
            .unwrap_err();
        assert!(matches!(err, ChapterError::EmptyDraft { chapter: 1 }));
        assert!(!project.chapter_exists(1));
    }

    #[test]
    fn custom_prompt_bypasses_construction() {
        let (_temp, project, blueprint, plan) = setup();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ChapterService::new(&prompts, &sink);
        let request =
            ChapterDraftRequest::new(4, 800, &blueprint, &plan).with_custom_prompt("直接写第四章");

        let model = MockLanguageModel::new(vec!["第四章正文"]);
        service
            .generate_chapter_draft(&model, None, &project, &request)
            .unwrap();
        assert_eq!(model.prompts(), vec!["直接写第四章".to_string()]);
    }

    #[test]
    fn missing_header_uses_position_and_warns() {
        let text = blueprint_range(1, 6).replace("第5章 - [标题5]\n", "");
        let blueprint = ChapterBlueprint::from_text(text);
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ChapterService::new(&prompts, &sink);

        let entry = service.chapter_entry(&blueprint, 5);
        assert_eq!(entry.chapter_title, "标题6");
        assert_eq!(sink.messages_at(LogLevel::Warn).len(), 1);
    }

    #[test]
    fn enrich_keeps_text_on_empty_reply() {
        let (_temp, project, _, _) = setup();
        project.write_chapter(2, "很短的章节").unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ChapterService::new(&prompts, &sink);

        let model = MockLanguageModel::new(vec!["", "扩写后的章节正文"]);
        assert!(!service.enrich_chapter(&model, &project, 2, 3000).unwrap());
        assert_eq!(project.chapter_text(2).unwrap().as_deref(), Some("很短的章节"));
        assert!(service.enrich_chapter(&model, &project, 2, 3000).unwrap());
        assert_eq!(project.chapter_text(2).unwrap().as_deref(), Some("扩写后的章节正文"));

        assert!(matches!(
            service.enrich_chapter(&model, &project, 9, 3000),
            Err(ChapterError::MissingChapter { chapter: 9 })
        ));
    }

    #[test]
    fn enrichment_threshold() {
        assert!(needs_enrichment(&"字".repeat(500), 1000, 0.7));
        assert!(!needs_enrichment(&"字".repeat(700), 1000, 0.7));
    }
}
