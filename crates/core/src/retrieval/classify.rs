use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::blueprint::parse_chapter_number;

/// How a retrieved snippet relates to the chapter being written.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TemporalTag {
    External,
    Skip,
    HistoryLimit,
    HistoryRef,
    HistoryOk,
    HistoryUnknown,
}

impl TemporalTag {
    /// Marker shown to the filter prompt; `Skip` entries never reach it.
    pub fn label(self) -> &'static str {
        match self {
            Self::External => "[外部知识]",
            Self::Skip => "[跳过]",
            Self::HistoryLimit => "[历史-近章]",
            Self::HistoryRef => "[历史-参考]",
            Self::HistoryOk => "[历史-远章]",
            Self::HistoryUnknown => "[未知来源]",
        }
    }

    pub fn instruction(self) -> &'static str {
        match self {
            Self::External => "优先使用",
            Self::Skip => "跳过",
            Self::HistoryLimit => "需改写≥50%",
            Self::HistoryRef => "需改写≥40%",
            Self::HistoryOk => "仅引用核心概念",
            Self::HistoryUnknown => "原样保留",
        }
    }

    pub fn is_skipped(self) -> bool {
        matches!(self, Self::Skip)
    }
}

impl fmt::Display for TemporalTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::External => "EXTERNAL",
            Self::Skip => "SKIP",
            Self::HistoryLimit => "HISTORY_LIMIT",
            Self::HistoryRef => "HISTORY_REF",
            Self::HistoryOk => "HISTORY_OK",
            Self::HistoryUnknown => "HISTORY_UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Tags `content` by the distance between `current` and the latest chapter it
/// mentions. Text without a chapter marker is external knowledge, whatever
/// its index metadata says.
pub fn classify_temporal(content: &str, current: u32) -> TemporalTag {
    let numbers = chapter_numbers(content);
    if let Some(latest) = numbers.iter().max() {
        return tag_for_distance(current as i64 - *latest as i64);
    }
    if has_chapter_marker(content) {
        return TemporalTag::HistoryUnknown;
    }
    TemporalTag::External
}

pub fn tag_for_distance(distance: i64) -> TemporalTag {
    match distance {
        d if d <= 2 => TemporalTag::Skip,
        3 => TemporalTag::HistoryLimit,
        4 | 5 => TemporalTag::HistoryRef,
        _ => TemporalTag::HistoryOk,
    }
}

/// Chapter numbers referenced as `第 N 章` (digits or Chinese numerals) or
/// `chapter_N`.
pub fn chapter_numbers(content: &str) -> Vec<u32> {
    let mut numbers: Vec<u32> = chapter_number_regex()
        .captures_iter(content)
        .filter_map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .and_then(|m| parse_chapter_number(m.as_str()))
        })
        .collect();
    numbers.extend(
        chapter_word_regex()
            .captures_iter(content)
            .filter_map(|caps| caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok())),
    );
    numbers
}

fn has_chapter_marker(content: &str) -> bool {
    chapter_marker_regex().is_match(content)
}

fn chapter_number_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"第\s*(?:(\d+)|([零〇一二两三四五六七八九十百千]+))\s*章")
            .expect("invalid chapter number regex")
    })
}

fn chapter_word_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)chapter[_\s]*(\d+)").expect("invalid chapter word regex")
    })
}

/// `第…章` whose number did not parse; English markers only count with digits.
fn chapter_marker_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"第\s*[^\s章]{1,4}\s*章").expect("invalid chapter marker regex")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(content: &str, current: u32) -> TemporalTag {
        classify_temporal(content, current)
    }

    #[test]
    fn distance_bands() {
        assert_eq!(tag("第 9 章 他回到钟楼", 10), TemporalTag::Skip);
        assert_eq!(tag("第 7 章 雨夜", 10), TemporalTag::HistoryLimit);
        assert_eq!(tag("第 5 章 雨夜", 10), TemporalTag::HistoryRef);
        assert_eq!(tag("第 3 章 雨夜", 10), TemporalTag::HistoryOk);
        assert_eq!(tag("守夜人的誓言", 10), TemporalTag::External);
    }

    #[test]
    fn latest_reference_wins() {
        assert_eq!(tag("第2章埋下伏笔，第八章回收", 10), TemporalTag::Skip);
        assert_eq!(tag("see Chapter_4 notes", 10), TemporalTag::HistoryOk);
    }

    #[test]
    fn marker_without_number_is_unknown() {
        assert_eq!(tag("第某章提到过这把钥匙", 10), TemporalTag::HistoryUnknown);
    }

    #[test]
    fn unmarked_chapter_prose_is_external() {
        assert_eq!(tag("他推开门，雨还在下。", 10), TemporalTag::External);
        assert_eq!(
            tag("The next chapter of her life began in the rain.", 10),
            TemporalTag::External
        );
        assert_eq!(tag("As told in chapter 9, the bell rang.", 10), TemporalTag::Skip);
    }
}
