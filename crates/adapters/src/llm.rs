use std::time::Duration;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};

use novel_core::config::{Config, LlmConfig};
use novel_core::llm::{LanguageModel, LanguageModelError};

use crate::endpoint::{endpoint, resolve_base_url, VersionPolicy};
use crate::error::AdapterError;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// OpenAI-compatible presets: interface name, default base url, default system prompt.
const OPENAI_PRESETS: &[(&str, &str, &str)] = &[
    ("openai", "https://api.openai.com/v1", DEFAULT_SYSTEM_PROMPT),
    ("deepseek", "https://api.deepseek.com/v1", DEFAULT_SYSTEM_PROMPT),
    ("ollama", "http://localhost:11434/v1", DEFAULT_SYSTEM_PROMPT),
    ("ml studio", "http://localhost:5000/v1", DEFAULT_SYSTEM_PROMPT),
    ("阿里云百炼", "https://dashscope.aliyuncs.com/compatible-mode/v1", DEFAULT_SYSTEM_PROMPT),
    ("火山引擎", "https://ark.cn-beijing.volces.com/api/v3", "你是DeepSeek，是一个 AI 人工智能助手"),
    ("硅基流动", "https://api.siliconflow.cn/v1", "你是DeepSeek，是一个 AI 人工智能助手"),
    ("grok", "https://api.x.ai/v1", "You are Grok, created by xAI."),
];

/// Builds the adapter for a named profile, or the last used one when `profile_name` is `None`.
pub fn create_llm_adapter(
    config: &Config,
    profile_name: Option<&str>,
) -> Result<Box<dyn LanguageModel>, AdapterError> {
    let (name, profile) = config.llm_profile(profile_name)?;
    debug!("using LLM profile `{name}` ({})", profile.interface_format);
    create_llm_adapter_from_profile(profile)
}

pub fn create_llm_adapter_from_profile(
    profile: &LlmConfig,
) -> Result<Box<dyn LanguageModel>, AdapterError> {
    let format = profile.interface_format.trim().to_lowercase();
    if format == "gemini" {
        return Ok(Box::new(GeminiAdapter::new(profile)?));
    }

    let (_, default_url, system_prompt) = OPENAI_PRESETS
        .iter()
        .find(|(name, _, _)| *name == format)
        .ok_or_else(|| {
            AdapterError::InvalidConfig(format!("unknown interface_format: {format}"))
        })?;
    let base_url = resolve_base_url(&profile.base_url, default_url, VersionPolicy::AppendV1)?;
    Ok(Box::new(OpenAiLikeAdapter::new(profile, &base_url, system_prompt)?))
}

fn build_client(timeout: u64) -> Result<Client, AdapterError> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout.max(1)))
        .build()?)
}

fn require(value: &str, field: &str) -> Result<(), AdapterError> {
    if value.trim().is_empty() {
        Err(AdapterError::InvalidConfig(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

/// Chat completions against any OpenAI-compatible endpoint.
///
/// One HTTP attempt per `invoke`; retries belong to the caller's retry wrapper.
struct OpenAiLikeAdapter {
    client: Client,
    url: String,
    api_key: Option<String>,
    model_name: String,
    max_tokens: Option<u32>,
    temperature: f32,
    system_prompt: String,
}

impl OpenAiLikeAdapter {
    fn new(profile: &LlmConfig, base_url: &str, system_prompt: &str) -> Result<Self, AdapterError> {
        require(&profile.model_name, "model_name")?;

        let api_key = Some(profile.api_key.trim().to_string()).filter(|key| !key.is_empty());
        Ok(Self {
            client: build_client(profile.timeout)?,
            url: endpoint(base_url, "chat/completions"),
            api_key,
            model_name: profile.model_name.clone(),
            max_tokens: Some(profile.max_tokens).filter(|tokens| *tokens > 0),
            temperature: profile.temperature,
            system_prompt: system_prompt.to_string(),
        })
    }

    fn complete(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String, AdapterError> {
        let body = ChatCompletionRequest {
            model: &self.model_name,
            messages: vec![
                ChatMessageRequest {
                    role: "system",
                    content: system_prompt.unwrap_or(self.system_prompt.as_str()),
                },
                ChatMessageRequest {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut request = self.client.post(&self.url).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.json(&body).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(AdapterError::HttpStatus { status, body });
        }
        let parsed: ChatCompletionResponse = response.json()?;
        extract_choice_content(parsed).ok_or(AdapterError::EmptyResponse)
    }
}

impl LanguageModel for OpenAiLikeAdapter {
    fn invoke(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, LanguageModelError> {
        debug!("chat completion → {} ({})", self.url, self.model_name);
        self.complete(prompt, system_prompt)
            .map_err(AdapterError::into_model_error)
    }
}

struct GeminiAdapter {
    client: Client,
    url: String,
    temperature: f32,
    max_tokens: u32,
}

impl GeminiAdapter {
    fn new(profile: &LlmConfig) -> Result<Self, AdapterError> {
        require(&profile.api_key, "Gemini api_key")?;
        require(&profile.model_name, "Gemini model_name")?;

        let base = resolve_base_url(
            &profile.base_url,
            "https://generativelanguage.googleapis.com/v1beta",
            VersionPolicy::AsIs,
        )?;
        let route = format!(
            "models/{model}:generateContent?key={key}",
            model = profile.model_name.trim(),
            key = profile.api_key.trim()
        );
        Ok(Self {
            client: build_client(profile.timeout)?,
            url: endpoint(&base, &route),
            temperature: profile.temperature,
            max_tokens: profile.max_tokens,
        })
    }

    fn generate(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String, AdapterError> {
        let request = GeminiRequest {
            system_instruction: system_prompt.map(|text| GeminiInstruction {
                parts: vec![GeminiRequestPart { text }],
            }),
            contents: vec![GeminiRequestContent {
                role: "user",
                parts: vec![GeminiRequestPart { text: prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: self.max_tokens,
                temperature: self.temperature,
            },
        };

        let response = self.client.post(&self.url).json(&request).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            if let Some(secs) = parse_retry_delay(&body) {
                warn!("Gemini asked to retry after {secs}s (HTTP {status})");
            }
            return Err(AdapterError::HttpStatus { status, body });
        }

        let parsed: GeminiResponse = response.json()?;
        parse_gemini_response(parsed)
    }
}

impl LanguageModel for GeminiAdapter {
    fn invoke(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, LanguageModelError> {
        self.generate(prompt, system_prompt)
            .map_err(AdapterError::into_model_error)
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

fn extract_choice_content(response: ChatCompletionResponse) -> Option<String> {
    response.choices.into_iter().find_map(|choice| {
        choice
            .message
            .and_then(|message| message.content)
            .or(choice.text)
            .filter(|content| !content.trim().is_empty())
    })
}

#[derive(Serialize)]
struct GeminiRequest<'a> {
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiInstruction<'a>>,
    contents: Vec<GeminiRequestContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiInstruction<'a> {
    parts: Vec<GeminiRequestPart<'a>>,
}

#[derive(Serialize)]
struct GeminiRequestContent<'a> {
    role: &'static str,
    parts: Vec<GeminiRequestPart<'a>>,
}

#[derive(Serialize)]
struct GeminiRequestPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    Other(serde_json::Value),
}

fn parse_gemini_response(response: GeminiResponse) -> Result<String, AdapterError> {
    for candidate in response.candidates {
        match candidate.finish_reason.as_deref() {
            Some("MAX_TOKENS") => warn!("Gemini response truncated by max_tokens"),
            Some("SAFETY") => warn!("Gemini response blocked by safety filters"),
            Some("RECITATION") => warn!("Gemini response blocked for recitation"),
            _ => {}
        }

        let text: String = candidate
            .content
            .into_iter()
            .flat_map(|content| content.parts)
            .filter_map(|part| match part {
                GeminiPart::Text { text } => Some(text),
                GeminiPart::Other(_) => None,
            })
            .collect();
        if !text.trim().is_empty() {
            return Ok(text);
        }
    }
    Err(AdapterError::EmptyResponse)
}

/// Extracts the server-suggested wait, in seconds, from a Gemini quota error body.
fn parse_retry_delay(body: &str) -> Option<u64> {
    static RETRY_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"retry[_ ]?delay"?\s*[:=]?\s*"?(\d+)"#).expect("invalid retry delay regex")
    });

    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/details")
                .and_then(|details| details.as_array())
                .and_then(|details| {
                    details.iter().find_map(|detail| {
                        detail
                            .get("retryDelay")
                            .or_else(|| detail.get("retry_delay"))
                            .and_then(parse_delay_value)
                    })
                })
        });

    from_json.or_else(|| {
        RETRY_RE
            .captures(&body.to_ascii_lowercase())
            .and_then(|caps| caps.get(1))
            .and_then(|value| value.as_str().parse().ok())
    })
}

fn parse_delay_value(value: &serde_json::Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|text| text.trim_end_matches('s').parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(format: &str) -> LlmConfig {
        LlmConfig {
            api_key: "sk-test".into(),
            interface_format: format.into(),
            model_name: "test-model".into(),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn presets_fill_in_default_endpoints() {
        let adapter =
            OpenAiLikeAdapter::new(&profile("deepseek"), "https://api.deepseek.com/v1", DEFAULT_SYSTEM_PROMPT)
                .unwrap();
        assert_eq!(adapter.url, "https://api.deepseek.com/v1/chat/completions");

        for (name, default_url, _) in OPENAI_PRESETS {
            assert!(
                resolve_base_url("", default_url, VersionPolicy::AppendV1).is_ok(),
                "preset `{name}` needs a usable default base_url"
            );
        }
        let mut custom = profile("火山引擎");
        custom.base_url = "ark.example.com".into();
        assert!(matches!(
            create_llm_adapter_from_profile(&custom),
            Err(AdapterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn unknown_interface_and_missing_model_are_rejected() {
        assert!(matches!(
            create_llm_adapter_from_profile(&profile("carrier pigeon")),
            Err(AdapterError::InvalidConfig(_))
        ));
        let mut missing_model = profile("openai");
        missing_model.model_name.clear();
        assert!(create_llm_adapter_from_profile(&missing_model).is_err());
        assert!(create_llm_adapter_from_profile(&profile("Grok")).is_ok());
    }

    #[test]
    fn first_non_empty_choice_wins() {
        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"  "}},{"text":"legacy"},{"message":{"content":"later"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_choice_content(response).as_deref(), Some("legacy"));

        let empty: ChatCompletionResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(extract_choice_content(empty).is_none());
    }

    #[test]
    fn gemini_parts_are_joined() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"第一"},{"inlineData":{}},{"text":"段"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(parse_gemini_response(response).unwrap(), "第一段");

        let blocked: GeminiResponse =
            serde_json::from_str(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#).unwrap();
        assert!(matches!(
            parse_gemini_response(blocked),
            Err(AdapterError::EmptyResponse)
        ));
    }

    #[test]
    fn retry_delay_is_read_from_quota_errors() {
        let body = r#"{"error":{"code":429,"details":[{"@type":"RetryInfo","retryDelay":"37s"}]}}"#;
        assert_eq!(parse_retry_delay(body), Some(37));
        assert_eq!(parse_retry_delay("quota exceeded, retry_delay: 12"), Some(12));
        assert_eq!(parse_retry_delay("internal error"), None);
    }
}
