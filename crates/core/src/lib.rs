pub mod architecture;
pub mod blueprint;
pub mod cancel;
pub mod chapter;
pub mod config;
pub mod embedding;
pub mod error;
pub mod finalization;
pub mod interaction;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod plot_arcs;
pub mod project;
pub mod prompts;
pub mod retrieval;
pub mod seed;
pub mod vectorstore;
pub mod volume;

#[cfg(test)]
mod testing;

pub use architecture::{
    ArchitectureError, ArchitectureOutcome, ArchitectureService, ArchitectureStage, ArchitectureState,
};
pub use blueprint::{
    BlueprintError, BlueprintOutcome, ChapterBlueprint, ChapterBlueprintEntry, ChapterBlueprintRequest,
    ChapterBlueprintService,
};
pub use cancel::{CancellationToken, Cancelled};
pub use chapter::{
    ChapterDraft, ChapterDraftRequest, ChapterError, ChapterGuidance, ChapterPrompt, ChapterService,
};
pub use config::{
    Config, ConfigError, ConfigStore, EmbeddingConfig, LlmConfig, NovelConfig, PipelineConfig,
    RecentUsage, VectorBackend, VectorStoreConfig,
};
pub use embedding::{EmbeddingModel, EmbeddingModelError};
pub use error::NovelError;
pub use finalization::{ChapterFinalizer, FinalizeChapterRequest, FinalizeError, FinalizeReport};
pub use interaction::{
    ConfirmKind, ConfirmationGate, ConfirmationHandler, DefaultAnswers, FixedAnswer,
    DEFAULT_CONFIRM_TIMEOUT,
};
pub use llm::{ErrorKind, LanguageModel, LanguageModelError, RetryingModel, Sleeper, ThreadSleeper};
pub use logging::{
    FanoutLogSink, FileLogSink, LogFacadeSink, LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink,
    StdoutLogSink, VecLogSink,
};
pub use pipeline::{BatchReport, ChapterOutcome, NovelPipeline, PipelineError};
pub use plot_arcs::{ArcCounts, PlotArcError, PlotArcLedger};
pub use project::{ArtifactError, Project};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptSource, PromptTemplate};
pub use retrieval::{RetrievalEngine, RetrievalError, RetrievalOutcome, RetrievalRequest};
pub use seed::{Seed, ValidationError};
pub use vectorstore::{
    DocType, DocumentMetadata, LocalVectorIndex, MetadataFilter, NewDocument, SearchHit, VectorIndex,
    VectorStore, VectorStoreError,
};
pub use volume::{VolumePlan, VolumeRange};
