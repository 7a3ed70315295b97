//! Chapter segmentation and the similarity index behind retrieval.

mod local;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::EmbeddingModelError;
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::project::ArtifactError;

pub use local::{LocalVectorIndex, VECTOR_STORE_FILE_NAME};

/// 默认的知识片段字符数限制。
pub const DEFAULT_SEGMENT_CHAR_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("embedding generation failed: {0}")]
    Embedding(#[from] EmbeddingModelError),
    #[error("分句器不可用：{0}")]
    Tokenizer(String),
    #[error("向量库缺少分卷元数据，无法按卷过滤")]
    MissingVolumeMetadata,
    #[error("向量维度不一致：期望 {expected}，实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("向量数量({embeddings})与片段数量({documents})不一致")]
    CountMismatch { documents: usize, embeddings: usize },
    #[error("failed to open vector store file `{path}`: {source}")]
    OpenFile { path: PathBuf, source: io::Error },
    #[error("failed to write vector store file `{path}`: {source}")]
    WriteFile { path: PathBuf, source: io::Error },
    #[error("向量库记录损坏 `{path}` 第{line}行: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[error("failed to serialize vector store record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("向量库锁已失效")]
    Poisoned,
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("向量库服务调用失败: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl VectorStoreError {
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        VectorStoreError::Backend(Box::new(error))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Chapter,
    VolumeSummary,
    ExternalKnowledge,
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DocType::Chapter => "chapter",
            DocType::VolumeSummary => "volume_summary",
            DocType::ExternalKnowledge => "external_knowledge",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<DocType>,
    #[serde(default)]
    pub segment: usize,
}

/// Equality constraints on metadata; `None` fields match anything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub chapter: Option<u32>,
    pub volume: Option<u32>,
    pub doc_type: Option<DocType>,
}

impl MetadataFilter {
    pub fn volume(volume: u32) -> Self {
        Self {
            volume: Some(volume),
            ..Self::default()
        }
    }

    pub fn chapter(chapter: u32) -> Self {
        Self {
            chapter: Some(chapter),
            ..Self::default()
        }
    }

    pub fn with_doc_type(mut self, doc_type: DocType) -> Self {
        self.doc_type = Some(doc_type);
        self
    }

    pub fn matches(&self, metadata: &DocumentMetadata) -> bool {
        if let Some(chapter) = self.chapter {
            if metadata.chapter != Some(chapter) {
                return false;
            }
        }
        if let Some(volume) = self.volume {
            if metadata.volume != Some(volume) {
                return false;
            }
        }
        if let Some(doc_type) = self.doc_type {
            if metadata.doc_type != Some(doc_type) {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewDocument {
    pub text: String,
    pub metadata: DocumentMetadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub content: String,
    pub metadata: DocumentMetadata,
    pub score: f32,
}

/// Persistent k-NN index over text segments with metadata.
pub trait VectorIndex: Send + Sync {
    fn count(&self) -> Result<usize, VectorStoreError>;

    fn count_matching(&self, filter: &MetadataFilter) -> Result<usize, VectorStoreError>;

    /// Whether any stored document carries a volume number.
    fn has_volume_metadata(&self) -> Result<bool, VectorStoreError>;

    fn insert(&self, documents: Vec<NewDocument>) -> Result<usize, VectorStoreError>;

    /// Fails with `MissingVolumeMetadata` when `filter` names a volume and the
    /// index predates volume tagging.
    fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>, VectorStoreError>;

    fn delete_by(&self, filter: &MetadataFilter) -> Result<usize, VectorStoreError>;
}

/// Greedy sentence packer. Sentences are never split, so one longer than the
/// limit becomes its own segment.
#[derive(Clone, Copy, Debug)]
pub struct Segmenter {
    max_chars: usize,
}

impl Segmenter {
    pub fn new(max_chars: usize) -> Result<Self, VectorStoreError> {
        if max_chars == 0 {
            return Err(VectorStoreError::Tokenizer("片段长度上限必须大于0".to_string()));
        }
        Ok(Self { max_chars })
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;

        for sentence in sentences(text) {
            if sentence.trim().is_empty() {
                if !current.is_empty() {
                    current.push_str(sentence);
                    current_len += sentence.chars().count();
                }
                continue;
            }
            let sentence_len = sentence.trim_end().chars().count();
            if current_len > 0 && current_len + sentence_len > self.max_chars {
                push_segment(&mut segments, &current);
                current.clear();
                current_len = 0;
            }
            current.push_str(sentence);
            current_len += sentence.chars().count();
        }
        push_segment(&mut segments, &current);
        segments
    }
}

/// Cuts after each run of terminal punctuation, keeping trailing closing
/// quotes and whitespace with the sentence they end.
fn sentences(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for end in sentence_end_regex().find_iter(text) {
        pieces.push(&text[start..end.end()]);
        start = end.end();
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

fn sentence_end_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#"[.!?。！？…；;]+[”’"'）)」』]*\s*"#).expect("invalid sentence end regex")
    })
}

fn push_segment(segments: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        segments.push(trimmed.to_string());
    }
}

/// Segmenting front end over a [`VectorIndex`].
pub struct VectorStore<'a> {
    index: &'a dyn VectorIndex,
    segmenter: Segmenter,
    sink: &'a dyn LogSink,
}

impl<'a> VectorStore<'a> {
    pub fn new(index: &'a dyn VectorIndex, sink: &'a dyn LogSink) -> Result<Self, VectorStoreError> {
        Ok(Self {
            index,
            segmenter: Segmenter::new(DEFAULT_SEGMENT_CHAR_LIMIT)?,
            sink,
        })
    }

    pub fn index(&self) -> &'a dyn VectorIndex {
        self.index
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    /// Segments `text` and inserts every segment tagged with chapter, volume
    /// and type. Empty text inserts nothing.
    pub fn upsert_chapter(
        &self,
        text: &str,
        chapter: u32,
        volume: u32,
        doc_type: DocType,
    ) -> Result<usize, VectorStoreError> {
        let segments = self.segmenter.split(text);
        if segments.is_empty() {
            self.log(
                LogLevel::Warn,
                format!("向量库更新跳过：第{chapter}章文本为空或无法拆分有效片段。"),
            );
            return Ok(0);
        }

        self.log(
            LogLevel::Info,
            format!("准备写入向量库：第{chapter}章（第{volume}卷），共 {} 个片段。", segments.len()),
        );
        let documents = segments
            .into_iter()
            .enumerate()
            .map(|(segment, text)| NewDocument {
                text,
                metadata: DocumentMetadata {
                    chapter: Some(chapter),
                    volume: Some(volume),
                    doc_type: Some(doc_type),
                    segment,
                },
            })
            .collect();
        self.index.insert(documents)
    }

    /// Stores `text` as a single document without segmentation.
    pub fn upsert_document(
        &self,
        text: &str,
        metadata: DocumentMetadata,
    ) -> Result<usize, VectorStoreError> {
        if text.trim().is_empty() {
            return Ok(0);
        }
        self.index.insert(vec![NewDocument {
            text: text.trim().to_string(),
            metadata,
        }])
    }

    /// External reference material; tagged chapter 0, volume 0.
    pub fn import_knowledge(&self, text: &str) -> Result<usize, VectorStoreError> {
        let count = self.upsert_chapter(text, 0, 0, DocType::ExternalKnowledge)?;
        self.log(LogLevel::Info, format!("已导入外部知识片段 {count} 个。"));
        Ok(count)
    }

    pub fn delete_by(
        &self,
        volume: Option<u32>,
        doc_type: Option<DocType>,
    ) -> Result<usize, VectorStoreError> {
        self.index.delete_by(&MetadataFilter {
            chapter: None,
            volume,
            doc_type,
        })
    }

    pub fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>, VectorStoreError> {
        self.index.search(query, k, filter)
    }

    pub fn count(&self) -> Result<usize, VectorStoreError> {
        self.index.count()
    }

    pub fn has_volume_metadata(&self) -> Result<bool, VectorStoreError> {
        self.index.has_volume_metadata()
    }

    /// Whether chapter segments for `chapter` were already written.
    pub fn contains_chapter(&self, chapter: u32) -> Result<bool, VectorStoreError> {
        let filter = MetadataFilter::chapter(chapter).with_doc_type(DocType::Chapter);
        Ok(self.index.count_matching(&filter)? > 0)
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message));
    }
}
