//! The error surface seen by embedders. Every module error folds into one of
//! these variants.

use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

use crate::architecture::ArchitectureError;
use crate::blueprint::BlueprintError;
use crate::cancel::Cancelled;
use crate::chapter::ChapterError;
use crate::config::ConfigError;
use crate::embedding::EmbeddingModelError;
use crate::finalization::FinalizeError;
use crate::llm::LanguageModelError;
use crate::pipeline::PipelineError;
use crate::plot_arcs::PlotArcError;
use crate::project::ArtifactError;
use crate::prompts::PromptError;
use crate::retrieval::RetrievalError;
use crate::seed::ValidationError;
use crate::vectorstore::VectorStoreError;
use crate::volume::VolumeError;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum NovelError {
    #[error("参数校验失败：{0}")]
    Validation(String),
    #[error("缺少必需文件 `{path}`")]
    MissingArtifact { path: PathBuf },
    #[error(transparent)]
    Prompt(PromptError),
    #[error("模型服务限流，重试已耗尽：{0}")]
    ResourceExhausted(#[source] BoxError),
    #[error("模型服务调用失败：{0}")]
    Provider(#[source] BoxError),
    #[error("操作已取消")]
    Cancelled,
    #[error("文件读写失败：{0}")]
    Io(#[source] BoxError),
}

impl NovelError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<LanguageModelError> for NovelError {
    fn from(error: LanguageModelError) -> Self {
        if error.is_rate_limited() {
            Self::ResourceExhausted(Box::new(error))
        } else {
            Self::Provider(Box::new(error))
        }
    }
}

impl From<EmbeddingModelError> for NovelError {
    fn from(error: EmbeddingModelError) -> Self {
        if error.is_rate_limited() {
            Self::ResourceExhausted(Box::new(error))
        } else {
            Self::Provider(Box::new(error))
        }
    }
}

impl From<ArtifactError> for NovelError {
    fn from(error: ArtifactError) -> Self {
        match error {
            ArtifactError::Missing { path } => Self::MissingArtifact { path },
            ArtifactError::SeedLocked { .. } => Self::Validation(error.to_string()),
            other => Self::Io(Box::new(other)),
        }
    }
}

impl From<PromptError> for NovelError {
    fn from(error: PromptError) -> Self {
        match error {
            PromptError::Artifact(inner) => inner.into(),
            other => Self::Prompt(other),
        }
    }
}

impl From<ValidationError> for NovelError {
    fn from(error: ValidationError) -> Self {
        Self::Validation(error.to_string())
    }
}

impl From<VolumeError> for NovelError {
    fn from(error: VolumeError) -> Self {
        Self::Validation(error.to_string())
    }
}

impl From<Cancelled> for NovelError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<ConfigError> for NovelError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::UnknownProfile(_) => Self::Validation(error.to_string()),
            other => Self::Io(Box::new(other)),
        }
    }
}

impl From<VectorStoreError> for NovelError {
    fn from(error: VectorStoreError) -> Self {
        match error {
            VectorStoreError::Embedding(inner) => inner.into(),
            VectorStoreError::Artifact(inner) => inner.into(),
            VectorStoreError::DimensionMismatch { .. }
            | VectorStoreError::CountMismatch { .. }
            | VectorStoreError::Backend(_) => Self::Provider(Box::new(error)),
            other => Self::Io(Box::new(other)),
        }
    }
}

impl From<RetrievalError> for NovelError {
    fn from(error: RetrievalError) -> Self {
        match error {
            RetrievalError::Prompt { source, .. } => source.into(),
            RetrievalError::Model { source, .. } => source.into(),
            RetrievalError::VectorStore(inner) => inner.into(),
        }
    }
}

impl From<PlotArcError> for NovelError {
    fn from(error: PlotArcError) -> Self {
        match error {
            PlotArcError::Prompt { source, .. } => source.into(),
            PlotArcError::Model { source, .. } => source.into(),
            PlotArcError::Artifact(inner) => inner.into(),
        }
    }
}

impl From<ArchitectureError> for NovelError {
    fn from(error: ArchitectureError) -> Self {
        match error {
            ArchitectureError::Prompt { source, .. } => source.into(),
            ArchitectureError::Model { source, .. } => source.into(),
            ArchitectureError::Validation(inner) => inner.into(),
            ArchitectureError::Artifact(inner) => inner.into(),
            ArchitectureError::Cancelled(inner) => inner.into(),
        }
    }
}

impl From<BlueprintError> for NovelError {
    fn from(error: BlueprintError) -> Self {
        match error {
            BlueprintError::EmptyArchitecture { path } => Self::MissingArtifact { path },
            BlueprintError::Prompt { source, .. } => source.into(),
            BlueprintError::Model { source, .. } => source.into(),
            BlueprintError::Artifact(inner) => inner.into(),
            BlueprintError::Cancelled(inner) => inner.into(),
        }
    }
}

impl From<ChapterError> for NovelError {
    fn from(error: ChapterError) -> Self {
        match error {
            ChapterError::Prompt { source, .. } => source.into(),
            ChapterError::Model { source, .. } => source.into(),
            ChapterError::EmptyDraft { .. } => Self::Provider(Box::new(error)),
            ChapterError::MissingChapter { .. } => Self::Validation(error.to_string()),
            ChapterError::Artifact(inner) => inner.into(),
        }
    }
}

impl From<FinalizeError> for NovelError {
    fn from(error: FinalizeError) -> Self {
        match error {
            FinalizeError::MissingChapter { .. } | FinalizeError::EmptyChapter { .. } => {
                Self::Validation(error.to_string())
            }
            FinalizeError::Prompt { source, .. } => source.into(),
            FinalizeError::Model { source, .. } => source.into(),
            FinalizeError::PlotArcs(inner) => inner.into(),
            FinalizeError::VectorStore(inner) => inner.into(),
            FinalizeError::Artifact(inner) => inner.into(),
            FinalizeError::Cancelled(inner) => inner.into(),
        }
    }
}

impl From<PipelineError> for NovelError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::MissingArtifact { path } => Self::MissingArtifact { path },
            PipelineError::ContinuityDeclined { .. }
            | PipelineError::MissingSeed { .. }
            | PipelineError::VectorIndexUnavailable => Self::Validation(error.to_string()),
            PipelineError::ArchitecturePaused { .. } | PipelineError::BlueprintPaused { .. } => {
                Self::Provider(Box::new(error))
            }
            PipelineError::ChapterFailed { source, .. } => (*source).into(),
            PipelineError::Architecture(inner) => inner.into(),
            PipelineError::Blueprint(inner) => inner.into(),
            PipelineError::Chapter(inner) => inner.into(),
            PipelineError::Finalize(inner) => inner.into(),
            PipelineError::VectorStore(inner) => inner.into(),
            PipelineError::Artifact(inner) => inner.into(),
            PipelineError::Validation(inner) => inner.into(),
            PipelineError::Cancelled(inner) => inner.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ErrorKind;

    #[test]
    fn rate_limits_become_resource_exhausted() {
        let error = LanguageModelError::message(ErrorKind::RateLimited, "slow down").with_status(429);
        assert!(matches!(NovelError::from(error), NovelError::ResourceExhausted(_)));

        let error = LanguageModelError::message(ErrorKind::Network, "connection reset");
        assert!(matches!(NovelError::from(error), NovelError::Provider(_)));

        let error = EmbeddingModelError::message(ErrorKind::RateLimited, "quota");
        let wrapped = VectorStoreError::Embedding(error);
        assert!(matches!(NovelError::from(wrapped), NovelError::ResourceExhausted(_)));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "qdrant down");
        let backend = VectorStoreError::backend(refused);
        assert!(matches!(NovelError::from(backend), NovelError::Provider(_)));
    }

    #[test]
    fn missing_files_keep_their_path() {
        let error = BlueprintError::Artifact(ArtifactError::Missing {
            path: PathBuf::from("Novel_architecture.txt"),
        });
        match NovelError::from(error) {
            NovelError::MissingArtifact { path } => {
                assert_eq!(path, PathBuf::from("Novel_architecture.txt"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn prompt_policy_and_cancellation() {
        let error = PromptError::Policy("chapter.next_chapter".into());
        assert!(matches!(NovelError::from(error), NovelError::Prompt(_)));
        assert!(NovelError::from(FinalizeError::Cancelled(Cancelled)).is_cancelled());
    }
}
