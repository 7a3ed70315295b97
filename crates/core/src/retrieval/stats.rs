use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::project::{self, ArtifactError};

pub const MAX_QUERY_RECORDS: usize = 1000;
const PREVIEW_CHARS: usize = 80;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub timestamp: DateTime<Local>,
    pub query: String,
    pub results_count: usize,
    pub chapter_number: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocUsage {
    pub count: u64,
    pub first_seen: DateTime<Local>,
    pub last_used: DateTime<Local>,
    #[serde(default)]
    pub preview: String,
}

/// Contents of `vectorstore_stats.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalStats {
    pub queries: Vec<QueryRecord>,
    pub doc_usage: BTreeMap<String, DocUsage>,
    pub query_keywords: BTreeMap<String, u64>,
    pub total_retrievals: u64,
    pub empty_results_count: u64,
}

impl RetrievalStats {
    /// A missing file starts fresh; a corrupt one is reported to the caller.
    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        Ok(project::read_json(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        project::write_json(path, self)
    }

    /// Records one search call. `hits` pairs each document hash with its text.
    pub fn record(
        &mut self,
        query: &str,
        chapter_number: u32,
        hits: &[(String, &str)],
        now: DateTime<Local>,
    ) {
        self.total_retrievals += 1;
        if hits.is_empty() {
            self.empty_results_count += 1;
        }

        self.queries.push(QueryRecord {
            timestamp: now,
            query: query.to_string(),
            results_count: hits.len(),
            chapter_number,
        });
        if self.queries.len() > MAX_QUERY_RECORDS {
            let excess = self.queries.len() - MAX_QUERY_RECORDS;
            self.queries.drain(..excess);
        }

        for keyword in query.split_whitespace() {
            *self.query_keywords.entry(keyword.to_string()).or_default() += 1;
        }

        for (hash, content) in hits {
            self.doc_usage
                .entry(hash.clone())
                .and_modify(|usage| {
                    usage.count += 1;
                    usage.last_used = now;
                })
                .or_insert_with(|| DocUsage {
                    count: 1,
                    first_seen: now,
                    last_used: now,
                    preview: content.chars().take(PREVIEW_CHARS).collect(),
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_usage_and_caps_queries() {
        let now = Local::now();
        let mut stats = RetrievalStats::default();
        stats.record("钟楼 密室", 3, &[("h1".into(), "钟楼的密室")], now);
        stats.record("钟楼", 3, &[("h1".into(), "钟楼的密室")], now);
        stats.record("无结果", 3, &[], now);

        assert_eq!(stats.total_retrievals, 3);
        assert_eq!(stats.empty_results_count, 1);
        assert_eq!(stats.doc_usage["h1"].count, 2);
        assert_eq!(stats.query_keywords["钟楼"], 2);

        for i in 0..MAX_QUERY_RECORDS {
            stats.record(&format!("q{i}"), 4, &[], now);
        }
        assert_eq!(stats.queries.len(), MAX_QUERY_RECORDS);
        assert_eq!(stats.queries.last().unwrap().query, format!("q{}", MAX_QUERY_RECORDS - 1));
    }

    #[test]
    fn saves_and_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectorstore_stats.json");
        assert_eq!(RetrievalStats::load(&path).unwrap(), RetrievalStats::default());

        let mut stats = RetrievalStats::default();
        stats.record("雨夜", 2, &[("abc".into(), "雨夜里")], Local::now());
        stats.save(&path).unwrap();
        let loaded = RetrievalStats::load(&path).unwrap();
        assert_eq!(loaded.total_retrievals, 1);
        assert_eq!(loaded.doc_usage["abc"].preview, "雨夜里");
    }
}
