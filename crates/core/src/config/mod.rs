//! `config.json`: provider profiles, the novel being written and pipeline
//! tunables.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::DEFAULT_MAX_RETRIES;
use crate::retrieval::{DEFAULT_MAX_TOTAL_RESULTS, DEFAULT_RETRIEVAL_K};
use crate::seed::Seed;

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout() -> u64 {
    600
}

fn default_embedding_retrieval_k() -> usize {
    DEFAULT_RETRIEVAL_K
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config `{path}`: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("未找到名为 `{0}` 的模型配置")]
    UnknownProfile(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub interface_format: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            interface_format: String::new(),
            model_name: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout: default_timeout(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub interface_format: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_embedding_retrieval_k")]
    pub retrieval_k: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            interface_format: String::new(),
            model_name: String::new(),
            retrieval_k: default_embedding_retrieval_k(),
        }
    }
}

/// Seed fields plus the project directory.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NovelConfig {
    pub topic: String,
    pub genre: String,
    #[serde(alias = "num_chapters")]
    pub target_chapters: u32,
    #[serde(alias = "word_number")]
    pub words_per_chapter: u32,
    pub volume_count: u32,
    pub user_guidance: String,
    pub filepath: String,
}

impl NovelConfig {
    pub fn to_seed(&self) -> Seed {
        Seed::new(
            self.topic.trim(),
            self.genre.trim(),
            self.target_chapters,
            self.words_per_chapter,
        )
        .with_volumes(self.volume_count)
        .with_guidance(self.user_guidance.trim())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_retries: usize,
    /// Extra attempts for one chapter inside a batch.
    pub chapter_retries: usize,
    pub retrieval_k: usize,
    pub max_total_results: usize,
    pub history_chapters: usize,
    pub confirm_timeout_secs: u64,
    pub enrich_threshold: f64,
    pub auto_enrich: bool,
    pub max_tokens: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            chapter_retries: 1,
            retrieval_k: DEFAULT_RETRIEVAL_K,
            max_total_results: DEFAULT_MAX_TOTAL_RESULTS,
            history_chapters: 3,
            confirm_timeout_secs: 60,
            enrich_threshold: 0.7,
            auto_enrich: false,
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VectorBackend {
    /// JSONL index under the project directory.
    #[default]
    Local,
    Qdrant,
}

/// Where chapter segments are indexed. Only `backend = "qdrant"` reads the
/// connection fields; a blank `base_url` means `http://localhost:6333`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub backend: VectorBackend,
    pub base_url: String,
    pub collection_name: String,
    pub api_key: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Local,
            base_url: String::new(),
            collection_name: "novel_chapters".to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RecentUsage {
    #[serde(default)]
    pub last_llm_interface: Option<String>,
    #[serde(default)]
    pub last_embedding_interface: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub llm_profiles: BTreeMap<String, LlmConfig>,
    #[serde(default)]
    pub embedding_profiles: BTreeMap<String, EmbeddingConfig>,
    #[serde(default)]
    pub novel: NovelConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub recent: RecentUsage,
}

impl Config {
    pub fn upsert_llm_profile<S: Into<String>>(&mut self, name: S, profile: LlmConfig) {
        self.llm_profiles.insert(name.into(), profile);
    }

    pub fn upsert_embedding_profile<S: Into<String>>(&mut self, name: S, profile: EmbeddingConfig) {
        self.embedding_profiles.insert(name.into(), profile);
    }

    /// Named profile, else the most recently used, else the first one.
    pub fn llm_profile(&self, name: Option<&str>) -> Result<(&str, &LlmConfig), ConfigError> {
        select_profile(
            &self.llm_profiles,
            name,
            self.recent.last_llm_interface.as_deref(),
        )
    }

    pub fn embedding_profile(
        &self,
        name: Option<&str>,
    ) -> Result<(&str, &EmbeddingConfig), ConfigError> {
        select_profile(
            &self.embedding_profiles,
            name,
            self.recent.last_embedding_interface.as_deref(),
        )
    }

    pub fn from_json_str(input: &str, path: &Path) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(input).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&data, path)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized).map_err(io_error)
    }
}

fn select_profile<'a, T>(
    profiles: &'a BTreeMap<String, T>,
    requested: Option<&str>,
    recent: Option<&str>,
) -> Result<(&'a str, &'a T), ConfigError> {
    if let Some(name) = requested {
        return profiles
            .get_key_value(name)
            .map(|(key, value)| (key.as_str(), value))
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()));
    }
    recent
        .and_then(|name| profiles.get_key_value(name))
        .or_else(|| profiles.iter().next())
        .map(|(key, value)| (key.as_str(), value))
        .ok_or_else(|| ConfigError::UnknownProfile("<default>".to_string()))
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
}

impl ConfigStore {
    /// A missing file yields defaults.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            Config::from_path(&path)?
        } else {
            Config::default()
        };
        Ok(Self { path, config })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.to_path(&self.path)
    }

    pub fn touch_llm_interface<S: Into<String>>(&mut self, name: S) {
        self.config.recent.last_llm_interface = Some(name.into());
    }

    pub fn touch_embedding_interface<S: Into<String>>(&mut self, name: S) {
        self.config.recent.last_embedding_interface = Some(name.into());
    }
}
