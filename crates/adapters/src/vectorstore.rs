//! Qdrant-backed [`VectorIndex`]. Segment metadata lives in the point payload
//! so the core's metadata filters become Qdrant payload filters.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use novel_core::config::VectorStoreConfig;
use novel_core::embedding::EmbeddingModel;
use novel_core::vectorstore::{
    DocumentMetadata, MetadataFilter, NewDocument, SearchHit, VectorIndex, VectorStoreError,
};

use crate::endpoint::{endpoint, resolve_base_url, VersionPolicy};
use crate::error::AdapterError;
use crate::retry::{call_with_retry, RetryConfig};

const DEFAULT_QDRANT_URL: &str = "http://localhost:6333";
const MAX_BATCH_SIZE: usize = 32;
const QDRANT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct PointPayload {
    #[serde(default)]
    text: String,
    #[serde(flatten)]
    metadata: DocumentMetadata,
}

#[derive(Serialize)]
struct Point {
    id: String,
    vector: Vec<f32>,
    payload: PointPayload,
}

#[derive(Deserialize)]
struct ScoredPoint {
    #[serde(default)]
    score: f32,
    #[serde(default)]
    payload: Option<PointPayload>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<ScoredPoint>,
}

pub struct QdrantVectorIndex {
    client: Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
    embedding: Arc<dyn EmbeddingModel>,
    retry: RetryConfig,
    /// Vector size of the collection once it is known to exist.
    vector_size: Mutex<Option<usize>>,
}

impl QdrantVectorIndex {
    /// Does not touch the network; the collection is created on first insert.
    pub fn open(
        config: &VectorStoreConfig,
        embedding: Arc<dyn EmbeddingModel>,
    ) -> Result<Self, AdapterError> {
        let collection = config.collection_name.trim();
        if collection.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "向量库 collection_name 不能为空".to_string(),
            ));
        }
        let base_url = resolve_base_url(&config.base_url, DEFAULT_QDRANT_URL, VersionPolicy::AsIs)?;
        let api_key = Some(config.api_key.trim())
            .filter(|key| !key.is_empty())
            .map(str::to_string);

        Ok(Self {
            client: Client::builder().timeout(QDRANT_TIMEOUT).build()?,
            base_url,
            collection: collection.to_string(),
            api_key,
            embedding,
            retry: RetryConfig::default(),
            vector_size: Mutex::new(None),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = endpoint(
            &self.base_url,
            &format!("collections/{}/{}", self.collection, path.trim_start_matches('/')),
        );
        let builder = self.client.request(method, url.trim_end_matches('/'));
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    fn cached_vector_size(&self) -> Result<Option<usize>, VectorStoreError> {
        self.vector_size
            .lock()
            .map(|size| *size)
            .map_err(|_| VectorStoreError::Poisoned)
    }

    fn remember_vector_size(&self, size: usize) -> Result<(), VectorStoreError> {
        let mut cached = self.vector_size.lock().map_err(|_| VectorStoreError::Poisoned)?;
        *cached = Some(size);
        Ok(())
    }

    /// `None` when the collection does not exist yet.
    fn collection_vector_size(&self) -> Result<Option<usize>, AdapterError> {
        call_with_retry(
            || {
                let response = self.request(Method::GET, "").send()?;
                if response.status().as_u16() == 404 {
                    return Ok(None);
                }
                let value = parse_json(response)?;
                Ok(value
                    .pointer("/result/config/params/vectors/size")
                    .and_then(Value::as_u64)
                    .map(|size| size as usize))
            },
            &self.retry,
        )
    }

    fn create_collection(&self, vector_size: usize) -> Result<(), AdapterError> {
        debug!(
            "creating qdrant collection `{}` with vector size {vector_size}",
            self.collection
        );
        let payload = json!({
            "vectors": {
                "size": vector_size,
                "distance": "Cosine"
            }
        });
        call_with_retry(
            || ensure_success(self.request(Method::PUT, "").json(&payload).send()?),
            &self.retry,
        )
    }

    /// Existing collection size, or creates the collection with `wanted`.
    fn ensure_collection(&self, wanted: usize) -> Result<usize, VectorStoreError> {
        if let Some(size) = self.cached_vector_size()? {
            return Ok(size);
        }
        let size = match self
            .collection_vector_size()
            .map_err(VectorStoreError::backend)?
        {
            Some(size) => size,
            None => {
                self.create_collection(wanted)
                    .map_err(VectorStoreError::backend)?;
                wanted
            }
        };
        self.remember_vector_size(size)?;
        Ok(size)
    }

    fn upsert_points(&self, points: &[Point]) -> Result<(), AdapterError> {
        let body = json!({ "points": points });
        call_with_retry(
            || ensure_success(self.request(Method::PUT, "points?wait=true").json(&body).send()?),
            &self.retry,
        )
    }

    fn count_points(&self, filter: Option<Value>) -> Result<usize, VectorStoreError> {
        let mut body = json!({ "exact": true });
        if let Some(filter) = filter {
            body["filter"] = filter;
        }
        call_with_retry(
            || {
                let response = self.request(Method::POST, "points/count").json(&body).send()?;
                if response.status().as_u16() == 404 {
                    return Ok(0);
                }
                let value = parse_json(response)?;
                Ok(value
                    .pointer("/result/count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize)
            },
            &self.retry,
        )
        .map_err(VectorStoreError::backend)
    }
}

impl VectorIndex for QdrantVectorIndex {
    fn count(&self) -> Result<usize, VectorStoreError> {
        self.count_points(None)
    }

    fn count_matching(&self, filter: &MetadataFilter) -> Result<usize, VectorStoreError> {
        self.count_points(payload_filter(filter))
    }

    fn has_volume_metadata(&self) -> Result<bool, VectorStoreError> {
        Ok(self.count_points(Some(volume_present_filter()))? > 0)
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
        let wanted = embeddings.first().map(Vec::len).unwrap_or(0);
        let expected = self.ensure_collection(wanted)?;
        if let Some(bad) = embeddings.iter().find(|vector| vector.len() != expected) {
            return Err(VectorStoreError::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }

        let points: Vec<Point> = documents
            .into_iter()
            .zip(embeddings)
            .map(|(document, vector)| Point {
                id: Uuid::new_v4().to_string(),
                vector,
                payload: PointPayload {
                    text: document.text,
                    metadata: document.metadata,
                },
            })
            .collect();
        for batch in points.chunks(MAX_BATCH_SIZE) {
            self.upsert_points(batch).map_err(VectorStoreError::backend)?;
        }
        Ok(points.len())
    }

    fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>, VectorStoreError> {
        if k == 0 || self.count()? == 0 {
            return Ok(Vec::new());
        }
        if filter.and_then(|f| f.volume).is_some() && !self.has_volume_metadata()? {
            return Err(VectorStoreError::MissingVolumeMetadata);
        }

        let vector = self.embedding.embed_query(query)?;
        let mut body = json!({
            "vector": vector,
            "limit": k,
            "with_payload": true,
        });
        if let Some(filter) = filter.and_then(payload_filter) {
            body["filter"] = filter;
        }
        call_with_retry(
            || {
                let response = self.request(Method::POST, "points/search").json(&body).send()?;
                parse_search_response(parse_json(response)?)
            },
            &self.retry,
        )
        .map_err(VectorStoreError::backend)
    }

    fn delete_by(&self, filter: &MetadataFilter) -> Result<usize, VectorStoreError> {
        let removed = self.count_matching(filter)?;
        if removed == 0 {
            return Ok(0);
        }
        let body = json!({ "filter": payload_filter(filter).unwrap_or_else(|| json!({})) });
        call_with_retry(
            || {
                ensure_success(
                    self.request(Method::POST, "points/delete?wait=true")
                        .json(&body)
                        .send()?,
                )
            },
            &self.retry,
        )
        .map_err(VectorStoreError::backend)?;
        Ok(removed)
    }
}

/// `must` match clauses for every set field; `None` when nothing is constrained.
fn payload_filter(filter: &MetadataFilter) -> Option<Value> {
    let mut must = Vec::new();
    if let Some(chapter) = filter.chapter {
        must.push(json!({ "key": "chapter", "match": { "value": chapter } }));
    }
    if let Some(volume) = filter.volume {
        must.push(json!({ "key": "volume", "match": { "value": volume } }));
    }
    if let Some(doc_type) = filter.doc_type {
        must.push(json!({ "key": "doc_type", "match": { "value": doc_type.to_string() } }));
    }
    if must.is_empty() {
        None
    } else {
        Some(json!({ "must": must }))
    }
}

fn volume_present_filter() -> Value {
    json!({ "must_not": [{ "is_empty": { "key": "volume" } }] })
}

fn parse_search_response(value: Value) -> Result<Vec<SearchHit>, AdapterError> {
    let response: SearchResponse = serde_json::from_value(value)?;
    Ok(response
        .result
        .into_iter()
        .filter_map(|point| {
            let payload = point.payload?;
            if payload.text.trim().is_empty() {
                return None;
            }
            Some(SearchHit {
                content: payload.text,
                metadata: payload.metadata,
                score: point.score,
            })
        })
        .collect())
}

fn ensure_success(response: Response) -> Result<(), AdapterError> {
    if response.status().is_success() {
        Ok(())
    } else {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        Err(AdapterError::HttpStatus { status, body })
    }
}

fn parse_json(response: Response) -> Result<Value, AdapterError> {
    if response.status().is_success() {
        response.json::<Value>().map_err(AdapterError::from)
    } else {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        Err(AdapterError::HttpStatus { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use novel_core::embedding::EmbeddingModelError;
    use novel_core::vectorstore::DocType;

    struct UnitEmbedding;

    impl EmbeddingModel for UnitEmbedding {
        fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingModelError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn embed_query(&self, _text: &str) -> Result<Vec<f32>, EmbeddingModelError> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn config(base_url: &str, collection: &str) -> VectorStoreConfig {
        VectorStoreConfig {
            base_url: base_url.into(),
            collection_name: collection.into(),
            ..VectorStoreConfig::default()
        }
    }

    #[test]
    fn metadata_filters_become_payload_conditions() {
        assert_eq!(payload_filter(&MetadataFilter::default()), None);

        let filter = MetadataFilter::volume(2).with_doc_type(DocType::VolumeSummary);
        assert_eq!(
            payload_filter(&filter),
            Some(json!({
                "must": [
                    { "key": "volume", "match": { "value": 2 } },
                    { "key": "doc_type", "match": { "value": "volume_summary" } }
                ]
            }))
        );

        let chapter = payload_filter(&MetadataFilter::chapter(7)).unwrap();
        assert_eq!(chapter["must"][0]["key"], "chapter");
        assert_eq!(chapter["must"][0]["match"]["value"], 7);
    }

    #[test]
    fn payload_flattens_segment_metadata() {
        let payload = PointPayload {
            text: "守夜人推开了门。".into(),
            metadata: DocumentMetadata {
                chapter: Some(3),
                volume: None,
                doc_type: Some(DocType::Chapter),
                segment: 1,
            },
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({ "text": "守夜人推开了门。", "chapter": 3, "doc_type": "chapter", "segment": 1 })
        );
        assert!(value.get("volume").is_none());
    }

    #[test]
    fn search_results_keep_score_and_metadata() {
        let response = json!({
            "result": [
                {
                    "id": "a",
                    "score": 0.92,
                    "payload": { "text": "旧案卷宗", "chapter": 2, "volume": 1, "doc_type": "chapter", "segment": 0 }
                },
                { "id": "b", "score": 0.5, "payload": { "text": "  " } },
                { "id": "c", "score": 0.4 }
            ]
        });
        let hits = parse_search_response(response).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "旧案卷宗");
        assert_eq!(hits[0].metadata.chapter, Some(2));
        assert_eq!(hits[0].metadata.volume, Some(1));
        assert_eq!(hits[0].metadata.doc_type, Some(DocType::Chapter));
        assert!((hits[0].score - 0.92).abs() < 1e-6);
    }

    #[test]
    fn open_validates_connection_settings() {
        let index = QdrantVectorIndex::open(&config("", " chapters "), Arc::new(UnitEmbedding)).unwrap();
        assert_eq!(index.collection(), "chapters");
        assert_eq!(index.base_url, DEFAULT_QDRANT_URL);

        assert!(matches!(
            QdrantVectorIndex::open(&config("", "  "), Arc::new(UnitEmbedding)),
            Err(AdapterError::InvalidConfig(_))
        ));
        assert!(matches!(
            QdrantVectorIndex::open(&config("qdrant:6333", "chapters"), Arc::new(UnitEmbedding)),
            Err(AdapterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn empty_work_skips_the_server() {
        let index = QdrantVectorIndex::open(
            &config("http://127.0.0.1:9", "chapters"),
            Arc::new(UnitEmbedding),
        )
        .unwrap();
        assert_eq!(index.insert(Vec::new()).unwrap(), 0);
        assert!(index.search("守夜人", 0, None).unwrap().is_empty());
    }

    #[test]
    fn unreachable_server_is_a_backend_error() {
        let index = QdrantVectorIndex::open(
            &config("http://127.0.0.1:9", "chapters"),
            Arc::new(UnitEmbedding),
        )
        .unwrap()
        .with_retry(RetryConfig::new(1, Duration::from_millis(0)));
        assert!(matches!(index.count(), Err(VectorStoreError::Backend(_))));
    }
}
