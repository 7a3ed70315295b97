use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    DocumentMetadata, MetadataFilter, NewDocument, SearchHit, VectorIndex, VectorStoreError,
};
use crate::embedding::{cosine_similarity, EmbeddingModel};
use crate::project;

pub const VECTOR_STORE_FILE_NAME: &str = "documents.jsonl";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredRecord {
    id: String,
    text: String,
    embedding: Vec<f32>,
    #[serde(default)]
    metadata: DocumentMetadata,
}

/// JSON-lines index kept fully in memory; inserts append, deletes rewrite.
pub struct LocalVectorIndex {
    path: PathBuf,
    embedding: Arc<dyn EmbeddingModel>,
    records: Mutex<Vec<StoredRecord>>,
}

impl LocalVectorIndex {
    pub fn open(
        dir: impl AsRef<Path>,
        embedding: Arc<dyn EmbeddingModel>,
    ) -> Result<Self, VectorStoreError> {
        let dir = dir.as_ref();
        project::ensure_dir(dir)?;
        let path = dir.join(VECTOR_STORE_FILE_NAME);
        let records = read_records(&path)?;
        Ok(Self {
            path,
            embedding,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<StoredRecord>>, VectorStoreError> {
        self.records.lock().map_err(|_| VectorStoreError::Poisoned)
    }

    fn append(&self, records: &[StoredRecord]) -> Result<(), VectorStoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| VectorStoreError::OpenFile {
                path: self.path.clone(),
                source,
            })?;
        let mut buffer = String::new();
        for record in records {
            buffer.push_str(&serde_json::to_string(record)?);
            buffer.push('\n');
        }
        file.write_all(buffer.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|source| VectorStoreError::WriteFile {
                path: self.path.clone(),
                source,
            })
    }

    fn rewrite(&self, records: &[StoredRecord]) -> Result<(), VectorStoreError> {
        let mut buffer = String::new();
        for record in records {
            buffer.push_str(&serde_json::to_string(record)?);
            buffer.push('\n');
        }
        project::write_atomic(&self.path, &buffer)?;
        Ok(())
    }
}

fn read_records(path: &Path) -> Result<Vec<StoredRecord>, VectorStoreError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(VectorStoreError::OpenFile {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|source| VectorStoreError::Corrupt {
                path: path.to_path_buf(),
                line: index + 1,
                source,
            })
        })
        .collect()
}

impl VectorIndex for LocalVectorIndex {
    fn count(&self) -> Result<usize, VectorStoreError> {
        Ok(self.lock()?.len())
    }

    fn count_matching(&self, filter: &MetadataFilter) -> Result<usize, VectorStoreError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|record| filter.matches(&record.metadata))
            .count())
    }

    fn has_volume_metadata(&self) -> Result<bool, VectorStoreError> {
        Ok(self
            .lock()?
            .iter()
            .any(|record| record.metadata.volume.is_some()))
    }

    fn insert(&self, documents: Vec<NewDocument>) -> Result<usize, VectorStoreError> {
        if documents.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = documents.iter().map(|doc| doc.text.clone()).collect();
        let embeddings = self.embedding.embed_documents(&texts)?;
        if embeddings.len() != documents.len() {
            return Err(VectorStoreError::CountMismatch {
                documents: documents.len(),
                embeddings: embeddings.len(),
            });
        }

        let mut records = self.lock()?;
        let expected = records
            .first()
            .map(|record| record.embedding.len())
            .or_else(|| embeddings.first().map(Vec::len))
            .unwrap_or(0);
        if let Some(bad) = embeddings.iter().find(|vector| vector.len() != expected) {
            return Err(VectorStoreError::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }

        let new_records: Vec<StoredRecord> = documents
            .into_iter()
            .zip(embeddings)
            .map(|(document, embedding)| StoredRecord {
                id: Uuid::new_v4().to_string(),
                text: document.text,
                embedding,
                metadata: document.metadata,
            })
            .collect();
        self.append(&new_records)?;
        let inserted = new_records.len();
        records.extend(new_records);
        Ok(inserted)
    }

    fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>, VectorStoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        {
            let records = self.lock()?;
            if records.is_empty() {
                return Ok(Vec::new());
            }
            if filter.and_then(|f| f.volume).is_some()
                && !records.iter().any(|record| record.metadata.volume.is_some())
            {
                return Err(VectorStoreError::MissingVolumeMetadata);
            }
        }

        let query_vector = self.embedding.embed_query(query)?;
        let records = self.lock()?;
        let mut scored: Vec<SearchHit> = records
            .iter()
            .filter(|record| filter.map_or(true, |f| f.matches(&record.metadata)))
            .map(|record| SearchHit {
                content: record.text.clone(),
                metadata: record.metadata.clone(),
                score: cosine_similarity(&query_vector, &record.embedding),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    fn delete_by(&self, filter: &MetadataFilter) -> Result<usize, VectorStoreError> {
        let mut records = self.lock()?;
        let before = records.len();
        let kept: Vec<StoredRecord> = records
            .iter()
            .filter(|record| !filter.matches(&record.metadata))
            .cloned()
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.rewrite(&kept)?;
            *records = kept;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingModelError;
    use crate::vectorstore::DocType;
    use tempfile::tempdir;

    /// Bag-of-characters embedding: texts sharing characters score higher.
    struct CharEmbedding;

    fn embed(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; 64];
        for ch in text.chars() {
            vector[(ch as usize) % 64] += 1.0;
        }
        vector
    }

    impl EmbeddingModel for CharEmbedding {
        fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingModelError> {
            Ok(texts.iter().map(|text| embed(text)).collect())
        }

        fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingModelError> {
            Ok(embed(text))
        }
    }

    fn doc(text: &str, chapter: u32, volume: Option<u32>, doc_type: DocType) -> NewDocument {
        NewDocument {
            text: text.to_string(),
            metadata: DocumentMetadata {
                chapter: Some(chapter),
                volume,
                doc_type: Some(doc_type),
                segment: 0,
            },
        }
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempdir().unwrap();
        let index = LocalVectorIndex::open(dir.path(), Arc::new(CharEmbedding)).unwrap();
        index
            .insert(vec![
                doc("aaaa", 1, Some(1), DocType::Chapter),
                doc("bbbb", 2, Some(1), DocType::Chapter),
            ])
            .unwrap();
        drop(index);

        let reopened = LocalVectorIndex::open(dir.path(), Arc::new(CharEmbedding)).unwrap();
        assert_eq!(reopened.count().unwrap(), 2);
        let hits = reopened.search("aaab", 1, None).unwrap();
        assert_eq!(hits[0].content, "aaaa");
    }

    #[test]
    fn volume_filter_on_legacy_index_fails() {
        let dir = tempdir().unwrap();
        let index = LocalVectorIndex::open(dir.path(), Arc::new(CharEmbedding)).unwrap();
        index
            .insert(vec![doc("aaaa", 1, None, DocType::Chapter)])
            .unwrap();
        let err = index
            .search("aaaa", 3, Some(&MetadataFilter::volume(1)))
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::MissingVolumeMetadata));
        assert_eq!(index.search("aaaa", 3, None).unwrap().len(), 1);
    }

    #[test]
    fn delete_by_volume_and_type() {
        let dir = tempdir().unwrap();
        let index = LocalVectorIndex::open(dir.path(), Arc::new(CharEmbedding)).unwrap();
        index
            .insert(vec![
                doc("summary one", 10, Some(1), DocType::VolumeSummary),
                doc("chapter one", 10, Some(1), DocType::Chapter),
                doc("summary two", 20, Some(2), DocType::VolumeSummary),
            ])
            .unwrap();

        let filter = MetadataFilter::volume(1).with_doc_type(DocType::VolumeSummary);
        assert_eq!(index.delete_by(&filter).unwrap(), 1);
        assert_eq!(index.count().unwrap(), 2);
        drop(index);

        let reopened = LocalVectorIndex::open(dir.path(), Arc::new(CharEmbedding)).unwrap();
        assert_eq!(reopened.count().unwrap(), 2);
        assert_eq!(reopened.count_matching(&filter).unwrap(), 0);
    }
}
