use std::sync::OnceLock;

use regex::Regex;

pub const MAX_QUERY_GROUPS: usize = 5;

const SHORT_LINE_MIN_CHARS: usize = 2;
const SHORT_LINE_MAX_CHARS: usize = 50;
const WHOLE_RESPONSE_MAX_CHARS: usize = 100;
const FALLBACK_DELIMITERS: [char; 6] = ['、', '-', ':', '：', '|', '｜'];
const CHATTER_PREFIXES: [&str; 7] = ["注", "说明", "#", "*", "关键词", "输出", "示例"];

/// Turns the query-generation reply into at most five search groups.
///
/// `·`-joined lines win; otherwise lines split on `、 - : |`; otherwise short
/// standalone lines; finally the whole reply when it is short enough.
pub fn parse_query_groups(response: &str) -> Vec<String> {
    let lines: Vec<&str> = response
        .lines()
        .map(strip_list_marker)
        .filter(|line| !line.is_empty())
        .collect();

    let primary: Vec<String> = lines
        .iter()
        .filter(|line| line.contains('·'))
        .map(|line| join_terms(line.split('·')))
        .filter(|group| !group.is_empty())
        .collect();
    if !primary.is_empty() {
        return cap(primary);
    }

    let delimited: Vec<String> = lines
        .iter()
        .filter(|line| !is_chatter(line))
        .filter(|line| line.contains(FALLBACK_DELIMITERS))
        .map(|line| join_terms(line.split(FALLBACK_DELIMITERS)))
        .filter(|group| !group.is_empty())
        .collect();
    if !delimited.is_empty() {
        return cap(delimited);
    }

    let short: Vec<String> = lines
        .iter()
        .filter(|line| !is_chatter(line))
        .filter(|line| {
            let len = line.chars().count();
            (SHORT_LINE_MIN_CHARS..=SHORT_LINE_MAX_CHARS).contains(&len)
        })
        .map(|line| join_terms(line.split_whitespace()))
        .collect();
    if !short.is_empty() {
        return cap(short);
    }

    let whole = response.trim();
    if !whole.is_empty() && whole.chars().count() <= WHOLE_RESPONSE_MAX_CHARS {
        return vec![join_terms(whole.split_whitespace())];
    }
    Vec::new()
}

/// Per-group fetch size for `groups` query groups.
pub fn per_group_k(groups: usize, k: usize, collection_size: usize) -> usize {
    let k = k.max(1);
    if groups > 5 {
        (k / 2).max(1)
    } else if groups > 3 {
        k
    } else {
        (k * 2).min(collection_size).max(1)
    }
}

fn cap(mut groups: Vec<String>) -> Vec<String> {
    groups.truncate(MAX_QUERY_GROUPS);
    groups
}

fn join_terms<'a>(terms: impl Iterator<Item = &'a str>) -> String {
    terms
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_chatter(line: &str) -> bool {
    CHATTER_PREFIXES.iter().any(|prefix| line.starts_with(prefix))
        || line.ends_with('：')
        || line.ends_with(':')
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    match list_marker_regex().find(line) {
        Some(found) => line[found.end()..].trim(),
        None => line,
    }
}

fn list_marker_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^(?:[-•]\s+|\d{1,2}\s*[.、)）]\s*|[（(]\d{1,2}[)）]\s*)")
            .expect("invalid list marker regex")
    })
}
