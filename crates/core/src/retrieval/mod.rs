//! Multi-query knowledge retrieval with volume priority, deduplication,
//! temporal tagging and an LLM filter pass.

mod classify;
mod queries;
mod stats;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::Local;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::blueprint::ChapterBlueprintEntry;
use crate::chapter::ChapterGuidance;
use crate::llm::{LanguageModel, LanguageModelError};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::{keys, PromptArguments, PromptError, PromptRegistry};
use crate::vectorstore::{DocumentMetadata, MetadataFilter, SearchHit, VectorStore, VectorStoreError};
use crate::volume::VolumePlan;

pub use classify::{chapter_numbers, classify_temporal, tag_for_distance, TemporalTag};
pub use queries::{parse_query_groups, per_group_k, MAX_QUERY_GROUPS};
pub use stats::{DocUsage, QueryRecord, RetrievalStats, MAX_QUERY_RECORDS};

pub const DEFAULT_RETRIEVAL_K: usize = 4;
pub const DEFAULT_MAX_TOTAL_RESULTS: usize = 12;
pub const DEDUP_PREFIX_CHARS: usize = 400;
pub const FILTER_SNIPPET_MAX_CHARS: usize = 600;
pub const KNOWLEDGE_EMPTY: &str = "（无相关知识库内容）";
pub const KNOWLEDGE_FALLBACK: &str = "（知识库处理失败）";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetrievalStage {
    QueryGeneration,
    Search,
    KnowledgeFilter,
}

impl fmt::Display for RetrievalStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::QueryGeneration => "检索词生成",
            Self::Search => "向量检索",
            Self::KnowledgeFilter => "知识过滤",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("渲染{stage}提示词失败: {source}")]
    Prompt {
        stage: RetrievalStage,
        #[source]
        source: PromptError,
    },
    #[error("调用模型执行{stage}失败: {source}")]
    Model {
        stage: RetrievalStage,
        #[source]
        source: LanguageModelError,
    },
    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),
}

/// Everything the engine needs to know about the chapter being drafted.
#[derive(Clone, Debug)]
pub struct RetrievalRequest<'a> {
    pub chapter_number: u32,
    pub chapter: &'a ChapterBlueprintEntry,
    pub guidance: &'a ChapterGuidance,
    pub short_summary: &'a str,
    pub volume_count: u32,
    pub target_chapters: u32,
    pub k: usize,
    pub max_total_results: usize,
}

impl<'a> RetrievalRequest<'a> {
    pub fn new(
        chapter_number: u32,
        chapter: &'a ChapterBlueprintEntry,
        guidance: &'a ChapterGuidance,
    ) -> Self {
        Self {
            chapter_number,
            chapter,
            guidance,
            short_summary: "",
            volume_count: 0,
            target_chapters: chapter_number,
            k: DEFAULT_RETRIEVAL_K,
            max_total_results: DEFAULT_MAX_TOTAL_RESULTS,
        }
    }

    fn chapter_info(&self) -> String {
        format!(
            "第{}章《{}》\n当前章节定位：{}\n核心目标：{}\n关键要素：{} | {} | {}\n时间约束：{}",
            self.chapter_number,
            self.chapter.chapter_title,
            self.chapter.chapter_role,
            self.chapter.chapter_purpose,
            self.guidance.characters_involved,
            self.guidance.key_items,
            self.guidance.scene_location,
            self.guidance.time_constraint,
        )
    }
}

/// One deduplicated hit and every query group that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrievedEntry {
    pub hash: String,
    pub content: String,
    pub queries: Vec<String>,
    pub metadata: DocumentMetadata,
    pub tag: TemporalTag,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RetrievalOutcome {
    pub queries: Vec<String>,
    pub entries: Vec<RetrievedEntry>,
    /// Condensed block handed to the draft prompt.
    pub context: String,
}

impl RetrievalOutcome {
    fn empty(queries: Vec<String>, entries: Vec<RetrievedEntry>) -> Self {
        Self {
            queries,
            entries,
            context: KNOWLEDGE_EMPTY.to_string(),
        }
    }

    fn fallback() -> Self {
        Self {
            queries: Vec::new(),
            entries: Vec::new(),
            context: KNOWLEDGE_FALLBACK.to_string(),
        }
    }
}

pub struct RetrievalEngine<'a> {
    prompts: &'a PromptRegistry,
    store: &'a VectorStore<'a>,
    sink: &'a dyn LogSink,
    stats_path: Option<PathBuf>,
}

impl<'a> RetrievalEngine<'a> {
    pub fn new(prompts: &'a PromptRegistry, store: &'a VectorStore<'a>, sink: &'a dyn LogSink) -> Self {
        Self {
            prompts,
            store,
            sink,
            stats_path: None,
        }
    }

    /// Persist per-query usage to `path` (usually `vectorstore_stats.json`).
    pub fn with_stats(mut self, path: impl Into<PathBuf>) -> Self {
        self.stats_path = Some(path.into());
        self
    }

    /// Like [`try_retrieve`](Self::try_retrieve), but a failure is logged and
    /// the outcome carries [`KNOWLEDGE_FALLBACK`] as its context.
    pub fn retrieve(&self, model: &dyn LanguageModel, request: &RetrievalRequest<'_>) -> RetrievalOutcome {
        match self.try_retrieve(model, request) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.log(LogLevel::Warn, format!("知识检索失败，改用占位知识内容：{err}"));
                RetrievalOutcome::fallback()
            }
        }
    }

    pub fn try_retrieve(
        &self,
        model: &dyn LanguageModel,
        request: &RetrievalRequest<'_>,
    ) -> Result<RetrievalOutcome, RetrievalError> {
        if !self.prompts.is_enabled(keys::KNOWLEDGE_SEARCH) {
            self.log(LogLevel::Info, "知识库检索模块已禁用，跳过检索。");
            return Ok(RetrievalOutcome::empty(Vec::new(), Vec::new()));
        }
        let collection_size = self.store.count()?;
        if collection_size == 0 {
            self.log(LogLevel::Info, "向量库为空，跳过知识检索。");
            return Ok(RetrievalOutcome::empty(Vec::new(), Vec::new()));
        }

        let queries = self.generate_queries(model, request)?;
        if queries.is_empty() {
            self.log(LogLevel::Warn, "未能从模型输出中解析出检索关键词。");
            return Ok(RetrievalOutcome::empty(queries, Vec::new()));
        }
        self.log(
            LogLevel::Info,
            format!("生成 {} 组检索关键词：{}", queries.len(), queries.join(" / ")),
        );

        let entries = self.search_groups(&queries, request, collection_size)?;
        let usable: Vec<&RetrievedEntry> =
            entries.iter().filter(|entry| !entry.tag.is_skipped()).collect();
        if usable.is_empty() {
            return Ok(RetrievalOutcome::empty(queries, entries));
        }

        let formatted = format_entries(&usable);
        let context = if self.prompts.is_enabled(keys::KNOWLEDGE_FILTER) {
            self.filter(model, request, &formatted)?
        } else {
            formatted
        };
        Ok(RetrievalOutcome {
            queries,
            entries,
            context,
        })
    }

    pub fn generate_queries(
        &self,
        model: &dyn LanguageModel,
        request: &RetrievalRequest<'_>,
    ) -> Result<Vec<String>, RetrievalError> {
        let stage = RetrievalStage::QueryGeneration;
        let prompt = self
            .prompts
            .format(keys::KNOWLEDGE_SEARCH, &search_arguments(request))
            .map_err(|source| RetrievalError::Prompt { stage, source })?;
        let response = model
            .invoke(&prompt, None)
            .map_err(|source| RetrievalError::Model { stage, source })?;
        Ok(parse_query_groups(&response))
    }

    /// Runs every group, deduplicates by content hash and tags each entry.
    pub fn search_groups(
        &self,
        queries: &[String],
        request: &RetrievalRequest<'_>,
        collection_size: usize,
    ) -> Result<Vec<RetrievedEntry>, RetrievalError> {
        let k_prime = per_group_k(queries.len(), request.k, collection_size);
        let current_volume = self.current_volume(request)?;
        let mut stats = self.load_stats();

        let mut entries: Vec<RetrievedEntry> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();
        for query in queries {
            let hits = match self.fetch(query, k_prime, current_volume) {
                Ok(hits) => hits,
                Err(err) => {
                    self.log(LogLevel::Error, format!("知识检索失败（{query}）: {err}"));
                    continue;
                }
            };
            let hashed: Vec<(String, &str)> = hits
                .iter()
                .filter(|hit| !hit.content.trim().is_empty())
                .map(|hit| (content_hash(&hit.content), hit.content.as_str()))
                .collect();
            if let Some(stats) = stats.as_mut() {
                stats.record(query, request.chapter_number, &hashed, Local::now());
            }

            for (hit, (hash, _)) in hits
                .iter()
                .filter(|hit| !hit.content.trim().is_empty())
                .zip(hashed.iter())
            {
                if let Some(&index) = seen.get(hash) {
                    let entry = &mut entries[index];
                    if !entry.queries.contains(query) {
                        entry.queries.push(query.clone());
                    }
                    continue;
                }
                if entries.len() >= request.max_total_results {
                    continue;
                }
                seen.insert(hash.clone(), entries.len());
                entries.push(RetrievedEntry {
                    hash: hash.clone(),
                    content: hit.content.clone(),
                    queries: vec![query.clone()],
                    metadata: hit.metadata.clone(),
                    tag: classify_temporal(&hit.content, request.chapter_number),
                });
            }
        }

        if let Some(stats) = stats {
            self.save_stats(&stats);
        }
        let skipped = entries.iter().filter(|entry| entry.tag.is_skipped()).count();
        self.log(
            LogLevel::Info,
            format!("检索得到 {} 条去重结果，其中 {skipped} 条为近章内容被跳过。", entries.len()),
        );
        Ok(entries)
    }

    fn current_volume(&self, request: &RetrievalRequest<'_>) -> Result<Option<u32>, RetrievalError> {
        if request.volume_count <= 1 || !self.store.has_volume_metadata()? {
            return Ok(None);
        }
        match VolumePlan::new(request.target_chapters, request.volume_count) {
            Ok(plan) => Ok(Some(plan.volume_of(request.chapter_number))),
            Err(err) => {
                self.log(LogLevel::Warn, format!("分卷配置无效，按全库检索：{err}"));
                Ok(None)
            }
        }
    }

    /// Current volume first plus one hit from the previous volume; any filter
    /// failure falls back to an unfiltered search.
    fn fetch(
        &self,
        query: &str,
        k: usize,
        volume: Option<u32>,
    ) -> Result<Vec<SearchHit>, VectorStoreError> {
        let Some(volume) = volume else {
            return self.store.search(query, k, None);
        };

        let filtered = || -> Result<Vec<SearchHit>, VectorStoreError> {
            let mut hits = Vec::new();
            let current_k = k.saturating_sub(1).max(1);
            hits.extend(self.store.search(query, current_k, Some(&MetadataFilter::volume(volume)))?);
            if volume > 1 {
                hits.extend(self.store.search(
                    query,
                    1,
                    Some(&MetadataFilter::volume(volume - 1)),
                )?);
            }
            Ok(hits)
        };
        match filtered() {
            Ok(hits) => Ok(hits),
            Err(err) => {
                self.log(LogLevel::Warn, format!("分卷过滤检索失败，改为全库检索：{err}"));
                self.store.search(query, k, None)
            }
        }
    }

    fn filter(
        &self,
        model: &dyn LanguageModel,
        request: &RetrievalRequest<'_>,
        formatted: &str,
    ) -> Result<String, RetrievalError> {
        let stage = RetrievalStage::KnowledgeFilter;
        let mut arguments = PromptArguments::new();
        arguments.insert("chapter_info".into(), request.chapter_info());
        arguments.insert("retrieved_texts".into(), formatted.to_string());
        let prompt = self
            .prompts
            .format(keys::KNOWLEDGE_FILTER, &arguments)
            .map_err(|source| RetrievalError::Prompt { stage, source })?;

        match model.invoke(&prompt, None) {
            Ok(response) if !response.trim().is_empty() => Ok(response.trim().to_string()),
            Ok(_) => {
                self.log(LogLevel::Warn, "知识过滤返回空结果。");
                Ok(KNOWLEDGE_FALLBACK.to_string())
            }
            Err(err) => {
                self.log(LogLevel::Error, format!("知识过滤失败: {err}"));
                Ok(KNOWLEDGE_FALLBACK.to_string())
            }
        }
    }

    fn load_stats(&self) -> Option<RetrievalStats> {
        let path = self.stats_path.as_ref()?;
        match RetrievalStats::load(path) {
            Ok(stats) => Some(stats),
            Err(err) => {
                self.log(LogLevel::Warn, format!("检索统计文件无法读取，重新开始统计：{err}"));
                Some(RetrievalStats::default())
            }
        }
    }

    fn save_stats(&self, stats: &RetrievalStats) {
        if let Some(path) = &self.stats_path {
            if let Err(err) = stats.save(path) {
                self.log(LogLevel::Warn, format!("检索统计写入失败：{err}"));
            }
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

/// SHA-1 of the first 400 characters, hex encoded.
pub fn content_hash(content: &str) -> String {
    let prefix: String = content.chars().take(DEDUP_PREFIX_CHARS).collect();
    hex::encode(Sha1::digest(prefix.as_bytes()))
}

fn format_entries(entries: &[&RetrievedEntry]) -> String {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let mut snippet: String = entry.content.trim().chars().take(FILTER_SNIPPET_MAX_CHARS).collect();
            if entry.content.trim().chars().count() > FILTER_SNIPPET_MAX_CHARS {
                snippet.push_str("...");
            }
            format!(
                "[检索结果{}] {}（{}）\n{}",
                index + 1,
                entry.tag.label(),
                entry.tag.instruction(),
                snippet
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn search_arguments(request: &RetrievalRequest<'_>) -> PromptArguments {
    let mut args = PromptArguments::new();
    args.insert("chapter_number".into(), request.chapter_number.to_string());
    args.insert("chapter_title".into(), request.chapter.chapter_title.clone());
    args.insert("chapter_role".into(), request.chapter.chapter_role.clone());
    args.insert("chapter_purpose".into(), request.chapter.chapter_purpose.clone());
    args.insert("foreshadowing".into(), request.chapter.foreshadowing.clone());
    args.insert("characters_involved".into(), request.guidance.characters_involved.clone());
    args.insert("key_items".into(), request.guidance.key_items.clone());
    args.insert("scene_location".into(), request.guidance.scene_location.clone());
    args.insert("time_constraint".into(), request.guidance.time_constraint.clone());
    args.insert("short_summary".into(), request.short_summary.to_string());
    args.insert("user_guidance".into(), request.guidance.user_guidance_or_default().to_string());
    args
}
