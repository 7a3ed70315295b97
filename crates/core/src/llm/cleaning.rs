use std::error::Error as StdError;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::LanguageModelError;

/// Short responses are inspected for refusals and provider error text.
const REFUSAL_MAX_CHARS: usize = 200;
const API_ERROR_MAX_CHARS: usize = 500;
const MARKUP_MAX_CHARS: usize = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseClass {
    Valid,
    Refusal,
    ApiErrorRateLimit,
    ApiError,
    StructuredEmpty,
    OnlyWhitespace,
    OnlyMarkup,
}

impl ResponseClass {
    pub fn is_valid(self) -> bool {
        matches!(self, ResponseClass::Valid)
    }

    pub fn is_rate_limit(self) -> bool {
        matches!(self, ResponseClass::ApiErrorRateLimit)
    }

    pub fn label(self) -> &'static str {
        match self {
            ResponseClass::Valid => "有效响应",
            ResponseClass::Refusal => "模型拒绝",
            ResponseClass::ApiErrorRateLimit => "限流错误文本",
            ResponseClass::ApiError => "接口错误文本",
            ResponseClass::StructuredEmpty => "空结构体",
            ResponseClass::OnlyWhitespace => "空白响应",
            ResponseClass::OnlyMarkup => "仅含标记符号",
        }
    }
}

/// Strips reasoning tags and code fences, unescapes HTML entities and
/// collapses runs of blank lines.
pub fn clean_response(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n");
    let without_think = think_block_regex().replace_all(&normalized, "");
    let without_think = match without_think.rfind("</think>") {
        Some(index) => without_think[index + "</think>".len()..].to_string(),
        None => without_think.into_owned(),
    };

    let unfenced = match whole_fence_regex().captures(&without_think) {
        Some(caps) => caps
            .get(1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
        None => without_think,
    };
    let unfenced = fence_line_regex().replace_all(&unfenced, "");

    let unescaped = unescape_html(&unfenced);
    let collapsed = blank_run_regex().replace_all(&unescaped, "\n\n");
    collapsed.trim().to_string()
}

/// Classifies an already cleaned response. Only `Valid` is accepted by callers.
pub fn classify_response(cleaned: &str) -> ResponseClass {
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return ResponseClass::OnlyWhitespace;
    }
    if is_refusal(trimmed) {
        return ResponseClass::Refusal;
    }
    if looks_like_api_error(trimmed) {
        if is_rate_limit_text(trimmed) {
            return ResponseClass::ApiErrorRateLimit;
        }
        if contains_api_error_marker(trimmed) || error_label_regex().is_match(&trimmed.to_lowercase()) {
            return ResponseClass::ApiError;
        }
    }
    if is_structured_empty(trimmed) {
        return ResponseClass::StructuredEmpty;
    }
    if trimmed.chars().count() <= MARKUP_MAX_CHARS && !trimmed.chars().any(char::is_alphanumeric) {
        return ResponseClass::OnlyMarkup;
    }
    ResponseClass::Valid
}

/// Rate-limit wording in free text. Lines inside code fences or starting
/// with a comment marker are ignored.
pub fn is_rate_limit_text(text: &str) -> bool {
    let mut in_fence = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || is_comment_line(trimmed) {
            continue;
        }
        if line_mentions_rate_limit(trimmed) {
            return true;
        }
    }
    false
}

/// True for HTTP 429 or an error chain whose text reads like a rate limit.
pub fn is_rate_limit_error(error: &LanguageModelError) -> bool {
    if error.kind() == super::ErrorKind::RateLimited || error.status_code() == Some(429) {
        return true;
    }
    let mut current: Option<&(dyn StdError + 'static)> = Some(error.as_inner());
    while let Some(err) = current {
        if line_mentions_rate_limit(&err.to_string()) {
            return true;
        }
        current = err.source();
    }
    false
}

fn line_mentions_rate_limit(line: &str) -> bool {
    const PHRASES: &[&str] = &[
        "resource exhausted",
        "resource_exhausted",
        "resourceexhausted",
        "rate limit",
        "rate_limit",
        "ratelimit",
        "too many requests",
        "quota exceeded",
        "exceeded your current quota",
        "insufficient_quota",
        "配额不足",
        "配额已用尽",
        "超出配额",
        "请求过多",
        "请求过于频繁",
        "频率限制",
        "速率限制",
        "限流",
        "资源耗尽",
    ];
    let lower = line.to_lowercase();
    PHRASES.iter().any(|phrase| lower.contains(phrase)) || status_429_regex().is_match(&lower)
}

fn is_comment_line(line: &str) -> bool {
    const MARKERS: &[&str] = &["//", "#", "/*", "*", "--", "<!--", "'''", "\"\"\"", ";"];
    MARKERS.iter().any(|marker| line.starts_with(marker))
}

/// A refusal either opens the response, possibly after an apology, or is a
/// first-person refusal to produce the requested content.
fn is_refusal(text: &str) -> bool {
    const OPENERS: &[&str] = &[
        "i cannot",
        "i can't",
        "i can not",
        "i won't",
        "i will not",
        "i'm unable to",
        "i am unable to",
        "as an ai",
        "我无法",
        "我不能",
        "我没办法",
        "无法完成该请求",
        "无法满足该请求",
        "作为一个ai",
        "作为ai",
        "作为人工智能",
        "作为语言模型",
        "作为一个语言模型",
    ];
    if text.chars().count() > REFUSAL_MAX_CHARS {
        return false;
    }
    let lower = text.to_lowercase();
    let opening = apology_prefix_regex().replace(&lower, "");
    OPENERS.iter().any(|phrase| opening.starts_with(phrase))
        || generation_refusal_regex().is_match(&lower)
}

/// Provider error text surfaced as content: a JSON body with an `error` key,
/// a leading error label or rate-limit phrase, or an HTTP status code.
fn looks_like_api_error(text: &str) -> bool {
    if matches!(
        serde_json::from_str::<Value>(text),
        Ok(Value::Object(map)) if map.contains_key("error")
    ) {
        return true;
    }
    if text.chars().count() > API_ERROR_MAX_CHARS {
        return false;
    }
    const RATE_LIMIT_OPENERS: &[&str] = &[
        "resource exhausted",
        "resource_exhausted",
        "rate limit",
        "too many requests",
        "quota exceeded",
        "请求过于频繁",
        "请求过多",
        "配额不足",
    ];
    let lower = text.to_lowercase();
    error_label_regex().is_match(&lower)
        || RATE_LIMIT_OPENERS.iter().any(|phrase| lower.starts_with(phrase))
        || http_status_regex().is_match(&lower)
}

fn contains_api_error_marker(text: &str) -> bool {
    const MARKERS: &[&str] = &[
        "internal server error",
        "service unavailable",
        "bad gateway",
        "gateway timeout",
        "invalid api key",
        "invalid_api_key",
        "unauthorized",
        "authentication failed",
        "model not found",
        "model_not_found",
        "error code:",
        "\"error\"",
        "服务不可用",
        "服务器错误",
        "服务器内部错误",
        "接口错误",
        "认证失败",
        "请求失败",
    ];
    let lower = text.to_lowercase();
    MARKERS.iter().any(|marker| lower.contains(marker))
}

fn is_structured_empty(text: &str) -> bool {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => value_is_empty(&value),
        Err(_) => false,
    }
}

fn value_is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.iter().all(value_is_empty),
        Value::Object(map) => map.values().all(value_is_empty),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn unescape_html(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    entity_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let entity = &caps[1];
            decode_entity(entity).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn decode_entity(entity: &str) -> Option<String> {
    let named = match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        "hellip" => Some('…'),
        "mdash" => Some('—'),
        "ndash" => Some('–'),
        "ldquo" => Some('“'),
        "rdquo" => Some('”'),
        "lsquo" => Some('‘'),
        "rsquo" => Some('’'),
        _ => None,
    };
    if let Some(ch) = named {
        return Some(ch.to_string());
    }
    let code = if let Some(hex) = entity
        .strip_prefix("#x")
        .or_else(|| entity.strip_prefix("#X"))
    {
        u32::from_str_radix(hex, 16).ok()?
    } else if let Some(dec) = entity.strip_prefix('#') {
        dec.parse::<u32>().ok()?
    } else {
        return None;
    };
    char::from_u32(code).map(|ch| ch.to_string())
}

fn think_block_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("invalid think regex"))
}

fn whole_fence_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?s)^\s*```[\w\-]*[ \t]*\n(.*?)\n?[ \t]*```\s*$")
            .expect("invalid fence regex")
    })
}

fn fence_line_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?m)^[ \t]*```[\w\-]*[ \t]*$\n?").expect("invalid fence line regex"))
}

fn blank_run_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("invalid blank line regex"))
}

fn entity_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z]+);").expect("invalid entity regex"))
}

fn apology_prefix_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^(?:(?:i'm |i am |很|非常)?(?:sorry|抱歉|对不起|i apologize)[,，.。!！\s]*(?:but[,\s]*|但是?[,，\s]*)?)")
            .expect("invalid apology regex")
    })
}

fn generation_refusal_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?:i (?:cannot|can't|can not|won't|will not|am unable to)|i'm unable to)\s+(?:help|assist|generate|write|create|provide|comply|fulfill|complete|continue)|我(?:无法|不能|没办法)(?:为你|为您|帮你|帮您)?(?:完成|生成|创作|提供|满足|协助|继续)(?:该|这个|此|这类|您的|你的)?(?:请求|要求|内容|任务)",
        )
        .expect("invalid generation refusal regex")
    })
}

fn error_label_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^\[?(?:error|api ?error|http error|exception|错误|请求错误|接口错误|调用失败)\]?(?:\s*code)?\s*[:：]")
            .expect("invalid error label regex")
    })
}

fn http_status_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^(?:http\s*)?[45]\d{2}\s+[a-z]|\b(?:http|status(?:[ _]code)?|error[ _]code)\s*[:=]?\s*[45]\d{2}\b")
            .expect("invalid http status regex")
    })
}

fn status_429_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?:http|status|error|code)[\s:=_\-]*429\b|\b429\s+too many")
            .expect("invalid 429 regex")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ErrorKind;

    #[test]
    fn strips_think_blocks_and_fences() {
        let raw = "<think>先想一想</think>\n```markdown\n正文第一段\n\n\n\n第二段 &amp; 结尾\n```";
        assert_eq!(clean_response(raw), "正文第一段\n\n第二段 & 结尾");
    }

    #[test]
    fn drops_reasoning_before_dangling_close_tag() {
        assert_eq!(clean_response("推理过程</think>\n答案"), "答案");
    }

    #[test]
    fn classifies_failure_shapes() {
        assert_eq!(classify_response(""), ResponseClass::OnlyWhitespace);
        assert_eq!(classify_response("..."), ResponseClass::OnlyMarkup);
        assert_eq!(classify_response("{}"), ResponseClass::StructuredEmpty);
        assert_eq!(
            classify_response(r#"{"items": [], "text": " "}"#),
            ResponseClass::StructuredEmpty
        );
        assert_eq!(classify_response("我无法完成该请求"), ResponseClass::Refusal);
        assert_eq!(
            classify_response("I'm sorry, but I cannot help with that."),
            ResponseClass::Refusal
        );
        assert_eq!(
            classify_response("Error code: 429 - Resource exhausted"),
            ResponseClass::ApiErrorRateLimit
        );
        assert_eq!(
            classify_response("Error code: 503 - Service Unavailable"),
            ResponseClass::ApiError
        );
        assert_eq!(classify_response("林默推开了门。"), ResponseClass::Valid);
    }

    #[test]
    fn short_dialogue_is_not_mistaken_for_failure() {
        assert_eq!(classify_response("他低声说：我不能走。"), ResponseClass::Valid);
        assert_eq!(classify_response("“我无法原谅你。”她转身离开。"), ResponseClass::Valid);
        assert_eq!(
            classify_response("城门口的告示写着：今日限流，请求失败者明日再来。"),
            ResponseClass::Valid
        );
        assert_eq!(
            classify_response("He said: I cannot stay here tonight."),
            ResponseClass::Valid
        );
    }

    #[test]
    fn refusals_are_anchored_or_explicit() {
        assert_eq!(classify_response("抱歉，我不能继续这个故事。"), ResponseClass::Refusal);
        assert_eq!(
            classify_response("好的。不过我无法生成这类内容。"),
            ResponseClass::Refusal
        );
        assert_eq!(
            classify_response("As an AI language model, I prefer not to."),
            ResponseClass::Refusal
        );
    }

    #[test]
    fn error_payloads_need_an_error_shape() {
        assert_eq!(
            classify_response(r#"{"error": {"code": 429, "message": "quota exceeded"}}"#),
            ResponseClass::ApiErrorRateLimit
        );
        assert_eq!(
            classify_response("429 Too Many Requests"),
            ResponseClass::ApiErrorRateLimit
        );
        assert_eq!(classify_response("错误：请求失败"), ResponseClass::ApiError);
        assert_eq!(
            classify_response("Rate limit reached for gpt-4o in organization org-x"),
            ResponseClass::ApiErrorRateLimit
        );
    }

    #[test]
    fn long_text_mentioning_rate_limit_is_valid() {
        let body = "城中传闻，商会对盐铁交易实行限流。".repeat(40);
        assert_eq!(classify_response(&body), ResponseClass::Valid);
    }

    #[test]
    fn commented_rate_limit_is_not_detected() {
        assert!(!is_rate_limit_text("// If rate limit, try again later"));
        assert!(!is_rate_limit_text("```\nrate limit\n```"));
        assert!(is_rate_limit_text("Too Many Requests"));
        assert!(is_rate_limit_text("请求过于频繁，请稍后再试"));
    }

    #[test]
    fn detects_rate_limit_errors() {
        let by_status =
            LanguageModelError::message(ErrorKind::Other, "upstream failure").with_status(429);
        assert!(is_rate_limit_error(&by_status));

        let by_text = LanguageModelError::message(ErrorKind::Other, "RESOURCE_EXHAUSTED: quota");
        assert!(is_rate_limit_error(&by_text));

        let other = LanguageModelError::message(ErrorKind::Network, "connection reset");
        assert!(!is_rate_limit_error(&other));
    }

    #[test]
    fn unescapes_numeric_entities() {
        assert_eq!(unescape_html("&#20320;&#x597D;&unknown;"), "你好&unknown;");
    }
}
