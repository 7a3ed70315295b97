//! Base URLs for provider profiles and the endpoints hanging off them.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::AdapterError;

static VERSION_SEGMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/v\d+(?:beta\d*|alpha\d*)?(?:/|$)").expect("invalid version segment regex")
});

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VersionPolicy {
    /// OpenAI-style APIs: add `/v1` unless the URL already names a version.
    AppendV1,
    AsIs,
}

/// Picks the profile's `base_url`, or `default` when it is blank, and
/// normalizes it. A trailing `#` pins the URL exactly as written.
pub fn resolve_base_url(
    configured: &str,
    default: &str,
    policy: VersionPolicy,
) -> Result<String, AdapterError> {
    let chosen = match configured.trim() {
        "" => default.trim(),
        custom => custom,
    };
    if chosen.is_empty() {
        return Err(AdapterError::InvalidConfig(
            "base_url must not be empty for this interface".to_string(),
        ));
    }

    if let Some(pinned) = chosen.strip_suffix('#') {
        let pinned = pinned.trim_end_matches('/');
        check_scheme(pinned)?;
        return Ok(pinned.to_string());
    }

    let base = chosen.trim_end_matches('/');
    check_scheme(base)?;
    if policy == VersionPolicy::AppendV1 && !VERSION_SEGMENT_RE.is_match(base) {
        Ok(format!("{base}/v1"))
    } else {
        Ok(base.to_string())
    }
}

fn check_scheme(url: &str) -> Result<(), AdapterError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(AdapterError::InvalidConfig(format!(
            "base_url must start with http:// or https://, got `{url}`"
        )))
    }
}

pub fn endpoint(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Ollama's native embedding route, whatever flavour of base URL was configured.
pub fn ollama_embeddings_url(base: &str) -> Result<String, AdapterError> {
    let mut url = resolve_base_url(base, "http://localhost:11434", VersionPolicy::AsIs)?;
    if url.ends_with("/api/embeddings") {
        return Ok(url);
    }
    if url.ends_with("/api") {
        url.push_str("/embeddings");
        return Ok(url);
    }
    if let Some(index) = url.find("/v1") {
        url.truncate(index);
    }
    Ok(endpoint(&url, "api/embeddings"))
}
