use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::volume::{validate_volume_config, VolumeError, VolumePlan};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("字段 `{field}` 不能为空")]
    EmptyField { field: &'static str },
    #[error("字段 `{field}` 必须大于0")]
    ZeroValue { field: &'static str },
    #[error(transparent)]
    Volume(#[from] VolumeError),
}

/// Immutable project inputs. Written once to `seed.json`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    pub topic: String,
    pub genre: String,
    pub target_chapters: u32,
    pub words_per_chapter: u32,
    #[serde(default)]
    pub volume_count: u32,
    #[serde(default)]
    pub user_guidance: String,
}

impl Seed {
    pub fn new(
        topic: impl Into<String>,
        genre: impl Into<String>,
        target_chapters: u32,
        words_per_chapter: u32,
    ) -> Self {
        Self {
            topic: topic.into(),
            genre: genre.into(),
            target_chapters,
            words_per_chapter,
            volume_count: 0,
            user_guidance: String::new(),
        }
    }

    pub fn with_volumes(mut self, volume_count: u32) -> Self {
        self.volume_count = volume_count;
        self
    }

    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.user_guidance = guidance.into();
        self
    }

    pub fn is_partitioned(&self) -> bool {
        self.volume_count > 1
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.topic.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "topic" });
        }
        if self.target_chapters == 0 {
            return Err(ValidationError::ZeroValue {
                field: "target_chapters",
            });
        }
        if self.words_per_chapter == 0 {
            return Err(ValidationError::ZeroValue {
                field: "words_per_chapter",
            });
        }
        validate_volume_config(self.target_chapters, self.volume_count)?;
        Ok(())
    }

    pub fn volume_plan(&self) -> Result<VolumePlan, ValidationError> {
        self.validate()?;
        Ok(VolumePlan::new(self.target_chapters, self.volume_count)?)
    }

    /// Guidance text handed to prompts; never empty.
    pub fn guidance_or_default(&self) -> &str {
        let trimmed = self.user_guidance.trim();
        if trimmed.is_empty() {
            DEFAULT_USER_GUIDANCE
        } else {
            trimmed
        }
    }
}

pub const DEFAULT_USER_GUIDANCE: &str = "无特殊指导";
