//! Test doubles shared by unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use crate::embedding::{EmbeddingModel, EmbeddingModelError};
use crate::llm::{ErrorKind, LanguageModel, LanguageModelError};
use crate::vectorstore::{MetadataFilter, NewDocument, SearchHit, VectorIndex, VectorStoreError};

pub(crate) enum MockReply {
    Text(String),
    Fail(ErrorKind),
}

pub(crate) struct MockLanguageModel {
    responses: Mutex<VecDeque<MockReply>>,
    prompts: Mutex<Vec<String>>,
    fallback: Option<String>,
}

impl MockLanguageModel {
    pub(crate) fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|s| MockReply::Text(s.to_string()))
                    .collect(),
            ),
            prompts: Mutex::new(Vec::new()),
            fallback: None,
        }
    }

    pub(crate) fn with_replies(replies: Vec<MockReply>) -> Self {
        Self {
            responses: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            fallback: None,
        }
    }

    /// Reply used once the scripted responses run out.
    pub(crate) fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = Some(text.to_string());
        self
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl LanguageModel for MockLanguageModel {
    fn invoke(&self, prompt: &str, _system: Option<&str>) -> Result<String, LanguageModelError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.responses.lock().unwrap().pop_front() {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fail(kind)) => Err(LanguageModelError::message(kind, "mock failure")),
            None => match &self.fallback {
                Some(text) => Ok(text.clone()),
                None => Err(LanguageModelError::new(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "no more mock responses",
                ))),
            },
        }
    }
}

/// Bag-of-characters embedding; deterministic and dependency free.
pub(crate) struct HashEmbedding;

pub(crate) fn hash_embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; 128];
    for ch in text.chars() {
        vector[(ch as usize) % 128] += 1.0;
    }
    vector
}

impl EmbeddingModel for HashEmbedding {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingModelError> {
        Ok(texts.iter().map(|text| hash_embed(text)).collect())
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingModelError> {
        Ok(hash_embed(text))
    }
}

/// Index whose every call fails the way an unreachable server does.
pub(crate) struct UnavailableIndex;

impl UnavailableIndex {
    fn refused() -> VectorStoreError {
        VectorStoreError::backend(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))
    }
}

impl VectorIndex for UnavailableIndex {
    fn count(&self) -> Result<usize, VectorStoreError> {
        Err(Self::refused())
    }

    fn count_matching(&self, _filter: &MetadataFilter) -> Result<usize, VectorStoreError> {
        Err(Self::refused())
    }

    fn has_volume_metadata(&self) -> Result<bool, VectorStoreError> {
        Err(Self::refused())
    }

    fn insert(&self, _documents: Vec<NewDocument>) -> Result<usize, VectorStoreError> {
        Err(Self::refused())
    }

    fn search(
        &self,
        _query: &str,
        _k: usize,
        _filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>, VectorStoreError> {
        Err(Self::refused())
    }

    fn delete_by(&self, _filter: &MetadataFilter) -> Result<usize, VectorStoreError> {
        Err(Self::refused())
    }
}

/// Blueprint records for chapters `start..=end` in the canonical layout.
pub(crate) fn blueprint_range(start: u32, end: u32) -> String {
    (start..=end)
        .map(|n| {
            format!(
                "第{n}章 - [标题{n}]\n本章定位：[定位{n}]\n核心作用：[作用{n}]\n悬念密度：[渐进]\n伏笔操作：[埋设{n}]\n认知颠覆：★☆☆☆☆\n本章简述：[简述{n}]"
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
