//! Post-draft bookkeeping for one chapter: global summary, character state,
//! plot-arc ledger, vector index and the closing summary of a volume.

use std::fmt;

use thiserror::Error;

use crate::cancel::{CancellationToken, Cancelled};
use crate::llm::{LanguageModel, LanguageModelError};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::plot_arcs::{
    strip_foreshadow_blocks, unresolved_lines, volume_carry_block, PlotArcError, PlotArcLedger,
};
use crate::project::{ArtifactError, Project};
use crate::prompts::{keys, PromptError, PromptRegistry};
use crate::vectorstore::{DocType, DocumentMetadata, VectorStore, VectorStoreError};
use crate::volume::VolumePlan;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FinalizeStage {
    Summary,
    CharacterState,
    VolumeSummary,
}

impl fmt::Display for FinalizeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Summary => "前文摘要更新",
            Self::CharacterState => "角色状态更新",
            Self::VolumeSummary => "分卷总结",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("未找到第{chapter}章的章节文件")]
    MissingChapter { chapter: u32 },
    #[error("第{chapter}章内容为空，无法完成定稿")]
    EmptyChapter { chapter: u32 },
    #[error("渲染{stage}提示词失败: {source}")]
    Prompt {
        stage: FinalizeStage,
        #[source]
        source: PromptError,
    },
    #[error("调用模型执行{stage}失败: {source}")]
    Model {
        stage: FinalizeStage,
        #[source]
        source: LanguageModelError,
    },
    #[error(transparent)]
    PlotArcs(#[from] PlotArcError),
    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

#[derive(Clone, Debug)]
pub struct FinalizeChapterRequest<'a> {
    pub chapter_number: u32,
    pub volume_plan: &'a VolumePlan,
}

impl<'a> FinalizeChapterRequest<'a> {
    pub fn new(chapter_number: u32, volume_plan: &'a VolumePlan) -> Self {
        Self {
            chapter_number,
            volume_plan,
        }
    }
}

/// What each step changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    pub chapter_number: u32,
    pub volume: u32,
    pub summary_updated: bool,
    pub character_state_updated: bool,
    pub plot_arcs_updated: bool,
    pub plot_arcs_compressed: bool,
    pub foreshadowing: String,
    pub segments_written: usize,
    pub closed_volume: Option<u32>,
}

pub struct ChapterFinalizer<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
}

impl<'a> ChapterFinalizer<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self { prompts, sink }
    }

    /// Runs the finalization steps in order. A missing or empty chapter fails
    /// before anything is touched; model errors in the summary, character and
    /// plot-arc steps propagate, vector and volume steps only log.
    pub fn finalize_chapter(
        &self,
        model: &dyn LanguageModel,
        store: Option<&VectorStore<'_>>,
        project: &Project,
        request: &FinalizeChapterRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<FinalizeReport, FinalizeError> {
        let number = request.chapter_number;
        let chapter_text = project
            .chapter_text(number)?
            .ok_or(FinalizeError::MissingChapter { chapter: number })?;
        let chapter_text = chapter_text.trim();
        if chapter_text.is_empty() {
            return Err(FinalizeError::EmptyChapter { chapter: number });
        }

        let plan = request.volume_plan;
        let volume = plan.volume_of(number);
        let mut report = FinalizeReport {
            chapter_number: number,
            volume,
            ..FinalizeReport::default()
        };
        self.log(LogLevel::Info, format!("开始定稿第{number}章。"));

        cancel.check()?;
        if self.prompts.is_enabled(keys::SUMMARY_UPDATE) {
            report.summary_updated = self.update_global_summary(model, project, number, chapter_text)?;
        }

        cancel.check()?;
        if self.prompts.is_enabled(keys::CHARACTER_STATE_UPDATE) {
            report.character_state_updated =
                self.update_character_state(model, project, plan, number, chapter_text)?;
        }

        let ledger = PlotArcLedger::new(self.prompts, self.sink);
        let arcs_enabled = self.prompts.is_enabled(keys::PLOT_ARCS_UPDATE);
        cancel.check()?;
        if arcs_enabled {
            report.plot_arcs_updated = ledger.update(model, project, number, chapter_text)?;
        }

        cancel.check()?;
        if arcs_enabled && self.prompts.is_enabled(keys::PLOT_ARCS_COMPRESS_AUTO) {
            report.plot_arcs_compressed = ledger.compress_if_needed(model, project, number)?;
        }

        cancel.check()?;
        if arcs_enabled {
            report.foreshadowing = ledger.distill_into_summary(model, project, number)?;
        }

        cancel.check()?;
        if let Some(store) = store {
            match store.upsert_chapter(chapter_text, number, volume, DocType::Chapter) {
                Ok(count) => report.segments_written = count,
                Err(err) => self.log(
                    LogLevel::Warn,
                    format!("第{number}章写入向量库失败，已跳过：{err}"),
                ),
            }
        }

        cancel.check()?;
        if let Some(closed) = plan.closes_volume(number) {
            if !self.prompts.is_enabled(keys::VOLUME_SUMMARY) {
                self.log(LogLevel::Info, format!("分卷总结模块已禁用，跳过第{closed}卷总结。"));
            } else {
                match self.close_volume(model, store, project, plan, closed, number, &report.foreshadowing) {
                    Ok(()) => report.closed_volume = Some(closed),
                    Err(err) => self.log(
                        LogLevel::Error,
                        format!("第{closed}卷总结生成失败，继续后续流程：{err}"),
                    ),
                }
            }
        }

        self.log(LogLevel::Info, format!("第{number}章定稿完成。"));
        Ok(report)
    }

    fn update_global_summary(
        &self,
        model: &dyn LanguageModel,
        project: &Project,
        number: u32,
        chapter_text: &str,
    ) -> Result<bool, FinalizeError> {
        let stage = FinalizeStage::Summary;
        let old_summary = project.global_summary()?;
        let prompt = self
            .prompts
            .format_with(
                keys::SUMMARY_UPDATE,
                [
                    ("novel_number", number.to_string()),
                    ("chapter_text", chapter_text.to_string()),
                    ("global_summary", old_summary.trim().to_string()),
                ],
            )
            .map_err(|source| FinalizeError::Prompt { stage, source })?;
        let response = model
            .invoke(&prompt, None)
            .map_err(|source| FinalizeError::Model { stage, source })?;
        if response.trim().is_empty() {
            self.log(LogLevel::Warn, "摘要更新返回空文本，保留原有前文摘要。");
            return Ok(false);
        }
        project.write_global_summary(response.trim())?;
        Ok(true)
    }

    fn update_character_state(
        &self,
        model: &dyn LanguageModel,
        project: &Project,
        plan: &VolumePlan,
        number: u32,
        chapter_text: &str,
    ) -> Result<bool, FinalizeError> {
        let stage = FinalizeStage::CharacterState;
        let old_state = project.character_state()?;
        let prompt = self
            .prompts
            .format_with(
                keys::CHARACTER_STATE_UPDATE,
                [
                    ("novel_number", number.to_string()),
                    ("chapter_text", chapter_text.to_string()),
                    ("old_state", old_state.trim().to_string()),
                    ("character_dynamics", project.character_dynamics()?.trim().to_string()),
                    ("context_summary", context_summary(project, plan, number)?),
                ],
            )
            .map_err(|source| FinalizeError::Prompt { stage, source })?;
        let response = model
            .invoke(&prompt, None)
            .map_err(|source| FinalizeError::Model { stage, source })?;
        if response.trim().is_empty() {
            self.log(LogLevel::Warn, "角色状态更新返回空文本，保留原有角色状态。");
            return Ok(false);
        }
        project.write_character_state(response.trim())?;
        Ok(true)
    }

    /// Writes `volume_<v>_summary.txt` with the carried A/B arcs, replaces the
    /// volume's copy in the index and clears the global summary.
    #[allow(clippy::too_many_arguments)]
    fn close_volume(
        &self,
        model: &dyn LanguageModel,
        store: Option<&VectorStore<'_>>,
        project: &Project,
        plan: &VolumePlan,
        volume: u32,
        number: u32,
        foreshadowing: &str,
    ) -> Result<(), FinalizeError> {
        let stage = FinalizeStage::VolumeSummary;
        let (start, end) = plan
            .range(volume)
            .map(|range| (range.start_chapter, range.end_chapter))
            .unwrap_or((1, number));
        let global_summary = project.global_summary()?;
        let prompt = self
            .prompts
            .format_with(
                keys::VOLUME_SUMMARY,
                [
                    ("volume_number", volume.to_string()),
                    ("start_chapter", start.to_string()),
                    ("end_chapter", end.to_string()),
                    ("volume_plan", project.volume_architecture()?.trim().to_string()),
                    ("global_summary", global_summary.trim().to_string()),
                    ("character_state", project.character_state()?.trim().to_string()),
                ],
            )
            .map_err(|source| FinalizeError::Prompt { stage, source })?;
        self.log(LogLevel::Info, format!("第{volume}卷已完结，生成分卷总结。"));
        let response = model
            .invoke(&prompt, None)
            .map_err(|source| FinalizeError::Model { stage, source })?;

        let body = if response.trim().is_empty() {
            self.log(LogLevel::Warn, "分卷总结返回空文本，改用前文摘要。");
            strip_foreshadow_blocks(&global_summary)
        } else {
            response.trim().to_string()
        };
        let carried = if foreshadowing.trim().is_empty() {
            unresolved_lines(&project.plot_arcs()?).join("\n")
        } else {
            foreshadowing.to_string()
        };
        let text = format!("{}\n\n{}", body.trim(), volume_carry_block(volume, &carried));
        project.write_volume_summary(volume, text.trim())?;

        if let Some(store) = store {
            if let Err(err) = replace_volume_document(store, volume, number, &text) {
                self.log(
                    LogLevel::Warn,
                    format!("第{volume}卷总结写入向量库失败：{err}"),
                );
            }
        }

        project.write_global_summary("")?;
        self.log(
            LogLevel::Info,
            format!("第{volume}卷总结已保存，前文摘要已清空。"),
        );
        Ok(())
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

fn replace_volume_document(
    store: &VectorStore<'_>,
    volume: u32,
    chapter: u32,
    text: &str,
) -> Result<usize, VectorStoreError> {
    store.delete_by(Some(volume), Some(DocType::VolumeSummary))?;
    store.upsert_document(
        text,
        DocumentMetadata {
            chapter: Some(chapter),
            volume: Some(volume),
            doc_type: Some(DocType::VolumeSummary),
            segment: 0,
        },
    )
}

/// Global summary, prefixed with the previous volume's summary once the
/// novel is past its first volume.
fn context_summary(project: &Project, plan: &VolumePlan, number: u32) -> Result<String, ArtifactError> {
    let global_summary = project.global_summary()?;
    let volume = plan.volume_of(number);
    if !plan.is_partitioned() || volume <= 1 {
        return Ok(global_summary.trim().to_string());
    }
    let previous = project.volume_summary(volume - 1)?;
    if previous.trim().is_empty() {
        return Ok(global_summary.trim().to_string());
    }
    Ok(format!(
        "【第{}卷总结】\n{}\n\n【本卷前文摘要】\n{}",
        volume - 1,
        previous.trim(),
        global_summary.trim()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::logging::VecLogSink;
    use crate::testing::{HashEmbedding, MockLanguageModel};
    use crate::vectorstore::{LocalVectorIndex, MetadataFilter, VectorIndex};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        project: Project,
        index: LocalVectorIndex,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let project = Project::open(temp.path()).unwrap();
        let index = LocalVectorIndex::open(project.vectorstore_dir(), Arc::new(HashEmbedding)).unwrap();
        Fixture {
            _temp: temp,
            project,
            index,
        }
    }

    #[test]
    fn empty_chapter_fails_without_mutation() {
        let fx = fixture();
        fx.project.write_global_summary("旧摘要").unwrap();
        fx.project.write_chapter(3, "   \n").unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let finalizer = ChapterFinalizer::new(&prompts, &sink);
        let plan = VolumePlan::new(10, 0).unwrap();
        let model = MockLanguageModel::new(vec!["新摘要"]);

        let err = finalizer
            .finalize_chapter(
                &model,
                None,
                &fx.project,
                &FinalizeChapterRequest::new(3, &plan),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, FinalizeError::EmptyChapter { chapter: 3 }));
        assert_eq!(model.calls(), 0);
        assert_eq!(fx.project.global_summary().unwrap(), "旧摘要");

        let err = finalizer
            .finalize_chapter(
                &model,
                None,
                &fx.project,
                &FinalizeChapterRequest::new(4, &plan),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, FinalizeError::MissingChapter { chapter: 4 }));
    }

    #[test]
    fn runs_steps_in_order_and_indexes_chapter() {
        let fx = fixture();
        fx.project.write_chapter(2, "林默在钟楼里找到了一把生锈的钥匙。").unwrap();
        fx.project.write_global_summary("旧摘要").unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let finalizer = ChapterFinalizer::new(&prompts, &sink);
        let store = VectorStore::new(&fx.index, &sink).unwrap();
        let plan = VolumePlan::new(10, 0).unwrap();
        let model = MockLanguageModel::new(vec![
            "林默接任守夜人，并在钟楼找到钥匙。",
            "林默：\n├──物品:\n│  └──钥匙：生锈",
            "[A级-主线] 钥匙的来历（埋设于第2章）",
        ]);

        let report = finalizer
            .finalize_chapter(
                &model,
                Some(&store),
                &fx.project,
                &FinalizeChapterRequest::new(2, &plan),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(model.calls(), 3);
        assert!(report.summary_updated && report.character_state_updated && report.plot_arcs_updated);
        assert!(!report.plot_arcs_compressed);
        assert!(report.segments_written >= 1);
        assert_eq!(report.closed_volume, None);

        let summary = fx.project.global_summary().unwrap();
        assert!(summary.starts_with("林默接任守夜人"));
        assert!(summary.contains("━━━ 未解决伏笔（截至第2章）━━━\n[A级-主线] 钥匙的来历"));
        assert!(!model.prompts()[1].contains("旧摘要"));
        assert!(model.prompts()[1].contains("林默接任守夜人"));
        assert!(store.contains_chapter(2).unwrap());
    }

    #[test]
    fn empty_replies_keep_previous_artifacts() {
        let fx = fixture();
        fx.project.write_chapter(1, "正文").unwrap();
        fx.project.write_global_summary("旧摘要").unwrap();
        fx.project.write_character_state("旧状态").unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let finalizer = ChapterFinalizer::new(&prompts, &sink);
        let plan = VolumePlan::new(10, 0).unwrap();
        let model = MockLanguageModel::new(vec!["", "", ""]);

        let report = finalizer
            .finalize_chapter(
                &model,
                None,
                &fx.project,
                &FinalizeChapterRequest::new(1, &plan),
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(!report.summary_updated);
        assert_eq!(fx.project.global_summary().unwrap(), "旧摘要");
        assert_eq!(fx.project.character_state().unwrap(), "旧状态");
        assert_eq!(sink.messages_at(LogLevel::Warn).len(), 3);
    }

    #[test]
    fn disabled_character_step_is_skipped() {
        let fx = fixture();
        fx.project.write_chapter(1, "正文").unwrap();
        let mut prompts = PromptRegistry::new().unwrap();
        prompts.set_enabled(keys::CHARACTER_STATE_UPDATE, false).unwrap();
        let sink = VecLogSink::new();
        let finalizer = ChapterFinalizer::new(&prompts, &sink);
        let plan = VolumePlan::new(10, 0).unwrap();
        let model = MockLanguageModel::new(vec!["摘要", "[B级-支线] 信"]);

        let report = finalizer
            .finalize_chapter(
                &model,
                None,
                &fx.project,
                &FinalizeChapterRequest::new(1, &plan),
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(!report.character_state_updated);
        assert_eq!(model.calls(), 2);
        assert_eq!(fx.project.plot_arcs().unwrap(), "[B级-支线] 信");
    }

    #[test]
    fn last_chapter_of_volume_carries_arcs_and_clears_summary() {
        let fx = fixture();
        fx.project.write_chapter(5, "第一卷的最后一章。").unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let finalizer = ChapterFinalizer::new(&prompts, &sink);
        let store = VectorStore::new(&fx.index, &sink).unwrap();
        let plan = VolumePlan::new(10, 2).unwrap();
        let model = MockLanguageModel::new(vec![
            "第一卷摘要",
            "角色状态",
            "[A级-主线] 钥匙\n[C级-细节] 香味\n[B级-支线] 信\n✓ 已解决：门锁",
            "第一卷总结：林默揭开了钟楼的秘密。",
        ]);
        let request = FinalizeChapterRequest::new(5, &plan);

        let report = finalizer
            .finalize_chapter(&model, Some(&store), &fx.project, &request, &CancellationToken::new())
            .unwrap();
        assert_eq!(report.closed_volume, Some(1));
        assert_eq!(fx.project.global_summary().unwrap(), "");

        let volume_summary = fx.project.volume_summary(1).unwrap();
        assert!(volume_summary.starts_with("第一卷总结：林默揭开了钟楼的秘密。"));
        let carry = volume_summary
            .split("━━━ 第1卷未解决伏笔 ━━━")
            .nth(1)
            .unwrap();
        assert!(carry.contains("[A级-主线] 钥匙"));
        assert!(carry.contains("[B级-支线] 信"));
        assert!(!carry.contains("香味"));

        let filter = MetadataFilter::volume(1).with_doc_type(DocType::VolumeSummary);
        assert_eq!(fx.index.count_matching(&filter).unwrap(), 1);
        assert!(model.prompts()[3].contains("第1卷（第1章 - 第5章）"));
    }

    #[test]
    fn closing_a_volume_twice_keeps_one_index_copy() {
        let fx = fixture();
        fx.project.write_chapter(5, "第一卷的最后一章。").unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let finalizer = ChapterFinalizer::new(&prompts, &sink);
        let store = VectorStore::new(&fx.index, &sink).unwrap();
        let plan = VolumePlan::new(10, 2).unwrap();
        let model = MockLanguageModel::new(vec![]).with_fallback("[A级-主线] 钥匙");
        let request = FinalizeChapterRequest::new(5, &plan);

        for _ in 0..2 {
            finalizer
                .finalize_chapter(&model, Some(&store), &fx.project, &request, &CancellationToken::new())
                .unwrap();
        }
        let filter = MetadataFilter::volume(1).with_doc_type(DocType::VolumeSummary);
        assert_eq!(fx.index.count_matching(&filter).unwrap(), 1);
    }

    #[test]
    fn cancellation_stops_before_first_step() {
        let fx = fixture();
        fx.project.write_chapter(1, "正文").unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let finalizer = ChapterFinalizer::new(&prompts, &sink);
        let plan = VolumePlan::new(10, 0).unwrap();
        let model = MockLanguageModel::new(vec!["摘要"]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = finalizer
            .finalize_chapter(&model, None, &fx.project, &FinalizeChapterRequest::new(1, &plan), &cancel)
            .unwrap_err();
        assert!(matches!(err, FinalizeError::Cancelled(_)));
        assert_eq!(model.calls(), 0);
    }
}
