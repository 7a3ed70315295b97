//! Drives one project from seed to finalized chapters.
//!
//! Every operation is synchronous and resumable: the services underneath
//! checkpoint to the project directory, so calling an operation again picks
//! up where the previous run stopped.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::architecture::{ArchitectureError, ArchitectureOutcome, ArchitectureService, ArchitectureStage};
use crate::blueprint::{
    BlueprintError, BlueprintOutcome, ChapterBlueprint, ChapterBlueprintRequest, ChapterBlueprintService,
};
use crate::cancel::{CancellationToken, Cancelled};
use crate::chapter::{needs_enrichment, ChapterDraft, ChapterDraftRequest, ChapterError, ChapterGuidance, ChapterService};
use crate::config::PipelineConfig;
use crate::finalization::{ChapterFinalizer, FinalizeChapterRequest, FinalizeError, FinalizeReport};
use crate::interaction::{ConfirmKind, ConfirmationGate};
use crate::llm::{LanguageModel, RetryingModel, Sleeper};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::project::{ArtifactError, Project};
use crate::prompts::PromptRegistry;
use crate::retrieval::RetrievalEngine;
use crate::seed::{Seed, ValidationError};
use crate::vectorstore::{VectorIndex, VectorStore, VectorStoreError};
use crate::volume::VolumePlan;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("项目尚未初始化：缺少 `{path}`")]
    MissingSeed { path: PathBuf },
    #[error("缺少必需文件 `{path}`")]
    MissingArtifact { path: PathBuf },
    #[error("第{chapter}章之前缺少章节 {missing:?}，已取消生成")]
    ContinuityDeclined { chapter: u32, missing: Vec<u32> },
    #[error("小说架构在「{stage}」步骤返回空结果，已保存进度")]
    ArchitecturePaused { stage: ArchitectureStage },
    #[error("章节蓝图在第{next_chapter}章处返回空结果，已保存进度")]
    BlueprintPaused { next_chapter: u32 },
    #[error("未配置向量库")]
    VectorIndexUnavailable,
    #[error("第{chapter}章在{attempts}次尝试后仍然失败：{source}")]
    ChapterFailed {
        chapter: u32,
        attempts: usize,
        #[source]
        source: Box<PipelineError>,
    },
    #[error(transparent)]
    Architecture(#[from] ArchitectureError),
    #[error(transparent)]
    Blueprint(#[from] BlueprintError),
    #[error(transparent)]
    Chapter(#[from] ChapterError),
    #[error(transparent)]
    Finalize(#[from] FinalizeError),
    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl PipelineError {
    fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled(_)
            | Self::Architecture(ArchitectureError::Cancelled(_))
            | Self::Blueprint(BlueprintError::Cancelled(_))
            | Self::Finalize(FinalizeError::Cancelled(_)) => true,
            Self::ChapterFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// What happened to one chapter inside a batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChapterOutcome {
    pub chapter_number: u32,
    /// `false` when an existing chapter was kept.
    pub drafted: bool,
    pub enriched: bool,
    /// `None` when re-finalization was declined.
    pub finalized: Option<FinalizeReport>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchReport {
    pub chapters: Vec<ChapterOutcome>,
}

impl BatchReport {
    pub fn finalized_chapters(&self) -> Vec<u32> {
        self.chapters
            .iter()
            .filter(|outcome| outcome.finalized.is_some())
            .map(|outcome| outcome.chapter_number)
            .collect()
    }
}

/// Wires the services for one project.
///
/// Every model call goes through [`RetryingModel`]; vector operations are
/// skipped when no index is attached.
pub struct NovelPipeline<'a> {
    project: &'a Project,
    model: &'a dyn LanguageModel,
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    index: Option<&'a dyn VectorIndex>,
    gate: ConfirmationGate,
    config: PipelineConfig,
    sleeper: Option<Arc<dyn Sleeper>>,
    cancel: CancellationToken,
}

impl<'a> NovelPipeline<'a> {
    pub fn new(
        project: &'a Project,
        model: &'a dyn LanguageModel,
        prompts: &'a PromptRegistry,
        sink: &'a dyn LogSink,
    ) -> Self {
        Self {
            project,
            model,
            prompts,
            sink,
            index: None,
            gate: ConfirmationGate::default(),
            config: PipelineConfig::default(),
            sleeper: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_vector_index(mut self, index: &'a dyn VectorIndex) -> Self {
        self.index = Some(index);
        self
    }

    /// The gate's timeout is replaced by `confirm_timeout_secs` when a
    /// config is applied afterwards.
    pub fn with_confirmations(mut self, gate: ConfirmationGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.gate = self
            .gate
            .with_timeout(std::time::Duration::from_secs(config.confirm_timeout_secs));
        self.config = config;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn project(&self) -> &Project {
        self.project
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Validates and persists the seed. Refused once chapter 1 exists.
    pub fn init_seed(&self, seed: &Seed) -> Result<VolumePlan, PipelineError> {
        seed.validate()?;
        let plan = seed.volume_plan()?;
        self.project.write_seed(seed)?;
        self.log(
            LogLevel::Info,
            format!(
                "已保存小说设定：{}（{}），共{}章，每章{}字。",
                seed.topic, seed.genre, seed.target_chapters, seed.words_per_chapter
            ),
        );
        if plan.is_partitioned() {
            self.log(LogLevel::Info, format!("分卷方案：\n{}", plan.describe()));
        }
        Ok(plan)
    }

    pub fn seed(&self) -> Result<Seed, PipelineError> {
        self.project
            .read_seed()?
            .ok_or_else(|| PipelineError::MissingSeed {
                path: self.project.seed_path(),
            })
    }

    pub fn generate_architecture(&self) -> Result<ArchitectureOutcome, PipelineError> {
        let seed = self.seed()?;
        let model = self.retrying_model();
        let service = ArchitectureService::new(self.prompts, self.sink);
        Ok(service.generate(&model, self.project, &seed, &self.cancel)?)
    }

    pub fn generate_blueprint(&self) -> Result<BlueprintOutcome, PipelineError> {
        let seed = self.seed()?;
        let plan = seed.volume_plan()?;
        let mut request = ChapterBlueprintRequest::new(
            seed.target_chapters,
            seed.guidance_or_default(),
            self.config.max_tokens,
        );
        if plan.is_partitioned() {
            request = request.with_volume_plan(plan.describe());
        }
        let model = self.retrying_model();
        let service = ChapterBlueprintService::new(self.prompts, self.sink);
        Ok(service.generate(&model, self.project, &request, &self.cancel)?)
    }

    pub fn load_blueprint(&self) -> Result<ChapterBlueprint, PipelineError> {
        ChapterBlueprintService::new(self.prompts, self.sink)
            .load(self.project)?
            .ok_or_else(|| PipelineError::MissingArtifact {
                path: self.project.blueprint_path(),
            })
    }

    /// Drafts one chapter after the continuity and overwrite confirmations.
    /// `Ok(None)` means the existing chapter was kept.
    pub fn draft_chapter(
        &self,
        chapter_number: u32,
        guidance: ChapterGuidance,
        custom_prompt: Option<String>,
    ) -> Result<Option<ChapterDraft>, PipelineError> {
        self.confirm_continuity(chapter_number)?;
        if !self.confirm_overwrite(chapter_number) {
            return Ok(None);
        }
        let seed = self.seed()?;
        let blueprint = self.load_blueprint()?;
        self.draft(&seed, &blueprint, chapter_number, guidance, custom_prompt)
            .map(Some)
    }

    /// `Ok(None)` means a repeated finalization was declined.
    pub fn finalize_chapter(&self, chapter_number: u32) -> Result<Option<FinalizeReport>, PipelineError> {
        let seed = self.seed()?;
        let plan = seed.volume_plan()?;
        if !self.confirm_refinalize(chapter_number)? {
            return Ok(None);
        }
        self.finalize(&plan, chapter_number).map(Some)
    }

    /// Expands a chapter towards `word_number` (the seed's budget when `None`).
    pub fn enrich_chapter(&self, chapter_number: u32, word_number: Option<u32>) -> Result<bool, PipelineError> {
        let words = match word_number {
            Some(words) => words,
            None => self.seed()?.words_per_chapter,
        };
        let model = self.retrying_model();
        let service = ChapterService::new(self.prompts, self.sink);
        Ok(service.enrich_chapter(&model, self.project, chapter_number, words)?)
    }

    pub fn import_knowledge(&self, text: &str) -> Result<usize, PipelineError> {
        let store = self.store()?.ok_or(PipelineError::VectorIndexUnavailable)?;
        let inserted = store.import_knowledge(text)?;
        self.log(LogLevel::Info, format!("已导入{inserted}个知识库片段。"));
        Ok(inserted)
    }

    /// Drafts and finalizes `chapters` in ascending order. A chapter that
    /// still fails after `chapter_retries` extra attempts aborts the batch;
    /// chapters finished before it stay as they are.
    pub fn run_batch(
        &self,
        chapters: RangeInclusive<u32>,
        guidance: &ChapterGuidance,
    ) -> Result<BatchReport, PipelineError> {
        let seed = self.seed()?;
        let plan = seed.volume_plan()?;
        let blueprint = self.load_blueprint()?;
        let mut report = BatchReport::default();
        let (first, last) = (*chapters.start(), *chapters.end());
        if first == 0 || first > last {
            return Ok(report);
        }

        self.confirm_continuity(first)?;
        self.log(LogLevel::Info, format!("批量生成第{first}章 - 第{last}章。"));

        for number in chapters {
            self.cancel.check()?;
            let attempts = self.config.chapter_retries + 1;
            let mut attempt = 0;
            let outcome = loop {
                attempt += 1;
                match self.process_chapter(&seed, &plan, &blueprint, number, guidance) {
                    Ok(outcome) => break outcome,
                    Err(error) if error.is_cancelled() => return Err(error),
                    Err(error) if attempt < attempts => {
                        self.log(
                            LogLevel::Warn,
                            format!("第{number}章第{attempt}次尝试失败：{error}，重试中..."),
                        );
                    }
                    Err(error) => {
                        self.log(LogLevel::Error, format!("第{number}章生成失败，批量任务终止：{error}"));
                        return Err(PipelineError::ChapterFailed {
                            chapter: number,
                            attempts,
                            source: Box::new(error),
                        });
                    }
                }
            };
            report.chapters.push(outcome);
        }

        self.log(
            LogLevel::Info,
            format!("批量任务完成，共定稿{}章。", report.finalized_chapters().len()),
        );
        Ok(report)
    }

    /// Architecture, then blueprint, then a batch over every chapter from
    /// the first one missing on disk.
    pub fn run_all(&self, guidance: &ChapterGuidance) -> Result<BatchReport, PipelineError> {
        if let ArchitectureOutcome::Paused { stage } = self.generate_architecture()? {
            return Err(PipelineError::ArchitecturePaused { stage });
        }
        self.cancel.check()?;
        if let BlueprintOutcome::Paused { next_chapter, .. } = self.generate_blueprint()? {
            return Err(PipelineError::BlueprintPaused { next_chapter });
        }
        self.cancel.check()?;

        let target = self.seed()?.target_chapters;
        match (1..=target).find(|&number| !self.project.chapter_exists(number)) {
            Some(first) => self.run_batch(first..=target, guidance),
            None => {
                self.log(LogLevel::Info, "所有章节均已存在，无需生成。");
                Ok(BatchReport::default())
            }
        }
    }

    fn process_chapter(
        &self,
        seed: &Seed,
        plan: &VolumePlan,
        blueprint: &ChapterBlueprint,
        number: u32,
        guidance: &ChapterGuidance,
    ) -> Result<ChapterOutcome, PipelineError> {
        let mut outcome = ChapterOutcome {
            chapter_number: number,
            ..ChapterOutcome::default()
        };

        if self.confirm_overwrite(number) {
            let draft = self.draft(seed, blueprint, number, guidance.clone(), None)?;
            outcome.drafted = true;
            if self.config.auto_enrich
                && needs_enrichment(&draft.content, seed.words_per_chapter, self.config.enrich_threshold)
            {
                outcome.enriched = self.enrich_chapter(number, Some(seed.words_per_chapter))?;
            }
        }
        self.cancel.check()?;

        if outcome.drafted || self.confirm_refinalize(number)? {
            outcome.finalized = Some(self.finalize(plan, number)?);
        }
        Ok(outcome)
    }

    fn draft(
        &self,
        seed: &Seed,
        blueprint: &ChapterBlueprint,
        number: u32,
        guidance: ChapterGuidance,
        custom_prompt: Option<String>,
    ) -> Result<ChapterDraft, PipelineError> {
        self.cancel.check()?;
        let plan = seed.volume_plan()?;
        let guidance = if guidance.user_guidance.trim().is_empty() {
            guidance.with_user_guidance(seed.user_guidance.clone())
        } else {
            guidance
        };
        let mut request = ChapterDraftRequest::new(number, seed.words_per_chapter, blueprint, &plan)
            .with_guidance(guidance);
        request.history_chapters = self.config.history_chapters;
        request.retrieval_k = self.config.retrieval_k;
        request.max_total_results = self.config.max_total_results;
        if let Some(prompt) = custom_prompt {
            request = request.with_custom_prompt(prompt);
        }

        let model = self.retrying_model();
        let service = ChapterService::new(self.prompts, self.sink);
        let store = self.store()?;
        let engine = store.as_ref().map(|store| {
            RetrievalEngine::new(self.prompts, store, self.sink)
                .with_stats(self.project.retrieval_stats_path())
        });
        Ok(service.generate_chapter_draft(&model, engine.as_ref(), self.project, &request)?)
    }

    fn finalize(&self, plan: &VolumePlan, number: u32) -> Result<FinalizeReport, PipelineError> {
        let model = self.retrying_model();
        let store = self.store()?;
        let finalizer = ChapterFinalizer::new(self.prompts, self.sink);
        Ok(finalizer.finalize_chapter(
            &model,
            store.as_ref(),
            self.project,
            &FinalizeChapterRequest::new(number, plan),
            &self.cancel,
        )?)
    }

    fn confirm_continuity(&self, chapter_number: u32) -> Result<(), PipelineError> {
        if chapter_number <= 1 {
            return Ok(());
        }
        let missing = self.project.missing_chapters_before(chapter_number);
        if missing.is_empty() {
            return Ok(());
        }
        let kind = ConfirmKind::ContinuityGap {
            chapter: chapter_number,
            missing: missing.clone(),
        };
        if self.gate.ask(&kind, self.sink) {
            self.log(LogLevel::Warn, format!("{kind}，用户选择继续。"));
            Ok(())
        } else {
            Err(PipelineError::ContinuityDeclined {
                chapter: chapter_number,
                missing,
            })
        }
    }

    fn confirm_overwrite(&self, chapter_number: u32) -> bool {
        if !self.project.chapter_exists(chapter_number) {
            return true;
        }
        let proceed = self.gate.ask(&ConfirmKind::Overwrite { chapter: chapter_number }, self.sink);
        if !proceed {
            self.log(LogLevel::Info, format!("保留已有的第{chapter_number}章。"));
        }
        proceed
    }

    fn confirm_refinalize(&self, chapter_number: u32) -> Result<bool, PipelineError> {
        let Some(store) = self.store()? else {
            return Ok(true);
        };
        if !self.project.chapter_exists(chapter_number) {
            return Ok(true);
        }
        let indexed = match store.contains_chapter(chapter_number) {
            Ok(indexed) => indexed,
            Err(error) => {
                self.log(LogLevel::Warn, format!("无法确认第{chapter_number}章是否已入库：{error}"));
                store.count()? > 0
            }
        };
        if !indexed {
            return Ok(true);
        }
        let proceed = self
            .gate
            .ask(&ConfirmKind::Refinalize { chapter: chapter_number }, self.sink);
        if !proceed {
            self.log(LogLevel::Info, format!("跳过第{chapter_number}章的重复定稿。"));
        }
        Ok(proceed)
    }

    fn retrying_model(&self) -> RetryingModel<'a> {
        let model = RetryingModel::new(self.model, self.sink).with_max_retries(self.config.max_retries);
        match &self.sleeper {
            Some(sleeper) => model.with_sleeper(Arc::clone(sleeper)),
            None => model,
        }
    }

    fn store(&self) -> Result<Option<VectorStore<'a>>, PipelineError> {
        self.index
            .map(|index| VectorStore::new(index, self.sink))
            .transpose()
            .map_err(PipelineError::from)
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}
