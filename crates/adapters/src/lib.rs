//! HTTP adapters for the language-model, embedding and vector-index traits of `novel_core`.

mod embedding;
mod endpoint;
mod error;
mod llm;
mod retry;
mod vectorstore;

pub use embedding::{create_embedding_adapter, create_embedding_adapter_from_profile};
pub use endpoint::{endpoint, resolve_base_url, VersionPolicy};
pub use error::AdapterError;
pub use llm::{create_llm_adapter, create_llm_adapter_from_profile};
pub use retry::{call_with_retry, RetryConfig};
pub use vectorstore::QdrantVectorIndex;
