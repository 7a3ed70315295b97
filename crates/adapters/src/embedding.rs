use std::time::Duration;

use log::debug;
use reqwest::blocking::{Client, Response};
use reqwest::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};

use novel_core::config::{Config, EmbeddingConfig};
use novel_core::embedding::{EmbeddingModel, EmbeddingModelError};

use crate::endpoint::{endpoint, ollama_embeddings_url, resolve_base_url, VersionPolicy};
use crate::error::AdapterError;
use crate::retry::{call_with_retry, RetryConfig};

const EMBEDDING_TIMEOUT: Duration = Duration::from_secs(60);

pub fn create_embedding_adapter(
    config: &Config,
    profile_name: Option<&str>,
) -> Result<Box<dyn EmbeddingModel>, AdapterError> {
    let (name, profile) = config.embedding_profile(profile_name)?;
    debug!("using embedding profile `{name}` ({})", profile.interface_format);
    create_embedding_adapter_from_profile(profile)
}

pub fn create_embedding_adapter_from_profile(
    profile: &EmbeddingConfig,
) -> Result<Box<dyn EmbeddingModel>, AdapterError> {
    let format = profile.interface_format.trim().to_lowercase();
    match format.as_str() {
        "openai" => Ok(Box::new(OpenAiEmbeddingAdapter::new(profile, "https://api.openai.com/v1")?)),
        "ml studio" => Ok(Box::new(OpenAiEmbeddingAdapter::new(profile, "http://localhost:5000/v1")?)),
        "siliconflow" | "硅基流动" => Ok(Box::new(OpenAiEmbeddingAdapter::new(
            profile,
            "https://api.siliconflow.cn/v1",
        )?)),
        "阿里云百炼" => Ok(Box::new(OpenAiEmbeddingAdapter::new(
            profile,
            "https://dashscope.aliyuncs.com/compatible-mode/v1",
        )?)),
        "ollama" => Ok(Box::new(OllamaEmbeddingAdapter::new(profile)?)),
        other => Err(AdapterError::InvalidConfig(format!(
            "unknown embedding interface_format: {other}"
        ))),
    }
}

fn build_client() -> Result<Client, AdapterError> {
    Ok(Client::builder().timeout(EMBEDDING_TIMEOUT).build()?)
}

fn check_status(response: Response) -> Result<Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().unwrap_or_default();
        Err(AdapterError::HttpStatus { status, body })
    }
}

/// `/embeddings` on an OpenAI-compatible server; the whole batch goes in one request.
struct OpenAiEmbeddingAdapter {
    client: Client,
    url: String,
    api_key: Option<String>,
    model_name: String,
    retry: RetryConfig,
}

impl OpenAiEmbeddingAdapter {
    fn new(profile: &EmbeddingConfig, default_url: &str) -> Result<Self, AdapterError> {
        if profile.model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "embedding model_name must not be empty".to_string(),
            ));
        }
        let base = resolve_base_url(&profile.base_url, default_url, VersionPolicy::AppendV1)?;

        Ok(Self {
            client: build_client()?,
            url: endpoint(&base, "embeddings"),
            api_key: Some(profile.api_key.trim().to_string()).filter(|key| !key.is_empty()),
            model_name: profile.model_name.trim().to_string(),
            retry: RetryConfig::default(),
        })
    }

    fn embed(&self, input: &[&str]) -> Result<Vec<Vec<f32>>, AdapterError> {
        let mut request = self.client.post(&self.url).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let payload = OpenAiEmbeddingRequest {
            model: &self.model_name,
            input,
        };
        let response = check_status(request.json(&payload).send()?)?;
        let parsed: OpenAiEmbeddingResponse = response.json()?;
        parse_openai_embeddings(parsed, input.len())
    }
}

impl EmbeddingModel for OpenAiEmbeddingAdapter {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        call_with_retry(|| self.embed(&inputs), &self.retry)
            .map_err(AdapterError::into_embedding_error)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingModelError> {
        call_with_retry(|| self.embed(&[text]), &self.retry)
            .and_then(|vectors| vectors.into_iter().next().ok_or(AdapterError::EmptyResponse))
            .map_err(AdapterError::into_embedding_error)
    }
}

/// Ollama's native `/api/embeddings`, one text per request.
struct OllamaEmbeddingAdapter {
    client: Client,
    url: String,
    model_name: String,
    retry: RetryConfig,
}

impl OllamaEmbeddingAdapter {
    fn new(profile: &EmbeddingConfig) -> Result<Self, AdapterError> {
        if profile.model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Ollama embedding model_name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            client: build_client()?,
            url: ollama_embeddings_url(&profile.base_url)?,
            model_name: profile.model_name.trim().to_string(),
            retry: RetryConfig::default(),
        })
    }

    fn embed_once(&self, text: &str) -> Result<Vec<f32>, AdapterError> {
        let payload = OllamaEmbeddingRequest {
            model: &self.model_name,
            prompt: text,
        };
        let response = check_status(self.client.post(&self.url).json(&payload).send()?)?;
        let parsed: OllamaEmbeddingResponse = response.json()?;
        parsed
            .embedding
            .filter(|values| !values.is_empty())
            .map(|values| values.into_iter().map(|v| v as f32).collect())
            .ok_or(AdapterError::EmptyResponse)
    }
}

impl EmbeddingModel for OllamaEmbeddingAdapter {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingModelError> {
        texts
            .iter()
            .map(|text| {
                call_with_retry(|| self.embed_once(text), &self.retry)
                    .map_err(AdapterError::into_embedding_error)
            })
            .collect()
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingModelError> {
        call_with_retry(|| self.embed_once(text), &self.retry)
            .map_err(AdapterError::into_embedding_error)
    }
}

/// Orders vectors by the server's `index` field and checks the count.
fn parse_openai_embeddings(
    response: OpenAiEmbeddingResponse,
    expected: usize,
) -> Result<Vec<Vec<f32>>, AdapterError> {
    let mut data = response.data;
    data.sort_by_key(|item| item.index);
    let vectors: Vec<Vec<f32>> = data
        .into_iter()
        .map(|item| item.embedding.into_iter().map(|v| v as f32).collect())
        .collect();
    if vectors.is_empty() {
        return Err(AdapterError::EmptyResponse);
    }
    if vectors.len() != expected {
        return Err(AdapterError::InvalidConfig(format!(
            "embedding endpoint returned {} vectors for {expected} inputs",
            vectors.len()
        )));
    }
    Ok(vectors)
}

#[derive(Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    #[serde(default)]
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f64>,
}

#[derive(Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Option<Vec<f64>>,
}
