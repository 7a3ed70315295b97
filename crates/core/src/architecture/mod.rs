use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::{CancellationToken, Cancelled};
use crate::llm::{LanguageModel, LanguageModelError};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::project::{self, ArtifactError, Project, ARCHITECTURE_FILE_NAME, PARTIAL_ARCHITECTURE_FILE_NAME};
use crate::prompts::{keys, PromptArguments, PromptError, PromptRegistry};
use crate::seed::{Seed, ValidationError};
use crate::volume::VolumePlan;

#[derive(Debug, Error)]
pub enum ArchitectureError {
    #[error("failed to render prompt for stage {stage}: {source}")]
    Prompt {
        stage: ArchitectureStage,
        #[source]
        source: PromptError,
    },
    #[error("language model invocation failed for stage {stage}: {source}")]
    Model {
        stage: ArchitectureStage,
        #[source]
        source: LanguageModelError,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ArchitectureStage {
    CoreSeed,
    CharacterDynamics,
    CharacterStateInit,
    WorldBuilding,
    PlotArchitecture,
    VolumePlan,
}

impl ArchitectureStage {
    pub const ALL: [ArchitectureStage; 6] = [
        Self::CoreSeed,
        Self::CharacterDynamics,
        Self::CharacterStateInit,
        Self::WorldBuilding,
        Self::PlotArchitecture,
        Self::VolumePlan,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::CoreSeed => "核心种子",
            Self::CharacterDynamics => "角色动力学",
            Self::CharacterStateInit => "初始角色状态",
            Self::WorldBuilding => "世界观",
            Self::PlotArchitecture => "三幕式情节",
            Self::VolumePlan => "分卷规划",
        }
    }

    fn prompt_key(&self) -> &'static str {
        match self {
            Self::CoreSeed => keys::CORE_SEED,
            Self::CharacterDynamics => keys::CHARACTER_DYNAMICS,
            Self::CharacterStateInit => keys::CHARACTER_STATE_INIT,
            Self::WorldBuilding => keys::WORLD_BUILDING,
            Self::PlotArchitecture => keys::PLOT_ARCHITECTURE,
            Self::VolumePlan => keys::VOLUME_BREAKDOWN,
        }
    }
}

impl fmt::Display for ArchitectureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-stage outputs persisted in `partial_architecture.json`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureState {
    #[serde(default, rename = "core_seed_result", skip_serializing_if = "Option::is_none")]
    core_seed: Option<String>,
    #[serde(
        default,
        rename = "character_dynamics_result",
        skip_serializing_if = "Option::is_none"
    )]
    character_dynamics: Option<String>,
    #[serde(
        default,
        rename = "character_state_result",
        skip_serializing_if = "Option::is_none"
    )]
    character_state: Option<String>,
    #[serde(
        default,
        rename = "world_building_result",
        skip_serializing_if = "Option::is_none"
    )]
    world_building: Option<String>,
    #[serde(default, rename = "plot_arch_result", skip_serializing_if = "Option::is_none")]
    plot_architecture: Option<String>,
    #[serde(
        default,
        rename = "volume_plan_result",
        skip_serializing_if = "Option::is_none"
    )]
    volume_plan: Option<String>,
}

impl ArchitectureState {
    /// Loads the checkpoint; an unreadable file starts over with a warning.
    pub fn load(project: &Project, sink: &dyn LogSink) -> Self {
        let path = project.partial_architecture_path();
        match project::read_json::<ArchitectureState>(&path) {
            Ok(state) => state.unwrap_or_default(),
            Err(err) => {
                sink.log(LogRecord::new(
                    LogLevel::Warn,
                    format!("无法读取 {}，将从空状态开始：{err}", path.display()),
                ));
                Self::default()
            }
        }
    }

    pub fn save(&self, project: &Project) -> Result<(), ArtifactError> {
        project::write_json(&project.partial_architecture_path(), self)
    }

    pub fn get(&self, stage: ArchitectureStage) -> Option<&str> {
        match stage {
            ArchitectureStage::CoreSeed => self.core_seed.as_deref(),
            ArchitectureStage::CharacterDynamics => self.character_dynamics.as_deref(),
            ArchitectureStage::CharacterStateInit => self.character_state.as_deref(),
            ArchitectureStage::WorldBuilding => self.world_building.as_deref(),
            ArchitectureStage::PlotArchitecture => self.plot_architecture.as_deref(),
            ArchitectureStage::VolumePlan => self.volume_plan.as_deref(),
        }
    }

    pub fn set(&mut self, stage: ArchitectureStage, value: String) {
        let value = Some(value);
        match stage {
            ArchitectureStage::CoreSeed => self.core_seed = value,
            ArchitectureStage::CharacterDynamics => self.character_dynamics = value,
            ArchitectureStage::CharacterStateInit => self.character_state = value,
            ArchitectureStage::WorldBuilding => self.world_building = value,
            ArchitectureStage::PlotArchitecture => self.plot_architecture = value,
            ArchitectureStage::VolumePlan => self.volume_plan = value,
        }
    }

    fn text(&self, stage: ArchitectureStage) -> String {
        self.get(stage).unwrap_or_default().trim().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchitectureOutcome {
    Complete(ArchitectureState),
    /// `stage` came back empty; earlier stages are checkpointed.
    Paused { stage: ArchitectureStage },
}

impl ArchitectureOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

pub struct ArchitectureService<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
}

impl<'a> ArchitectureService<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self { prompts, sink }
    }

    /// Runs every missing stage in order. Each success is checkpointed; an
    /// empty reply checkpoints and pauses, a provider error checkpoints and
    /// propagates.
    pub fn generate(
        &self,
        model: &dyn LanguageModel,
        project: &Project,
        seed: &Seed,
        cancel: &CancellationToken,
    ) -> Result<ArchitectureOutcome, ArchitectureError> {
        seed.validate()?;
        let plan = seed.volume_plan()?;
        let mut state = ArchitectureState::load(project, self.sink);

        for (index, stage) in ArchitectureStage::ALL.into_iter().enumerate() {
            if stage == ArchitectureStage::VolumePlan && !plan.is_partitioned() {
                continue;
            }
            let step = index + 1;
            if state.get(stage).is_some() {
                self.log(LogLevel::Info, format!("Step{step} 已完成，跳过{stage}生成。"));
                continue;
            }
            cancel.check()?;

            self.log(LogLevel::Info, format!("Step{step}: 生成{stage}..."));
            let prompt = self
                .prompts
                .format(stage.prompt_key(), &stage_arguments(stage, seed, &plan, &state))
                .map_err(|source| ArchitectureError::Prompt { stage, source })?;
            let response = match model.invoke(&prompt, None) {
                Ok(response) => response,
                Err(source) => {
                    state.save(project)?;
                    return Err(ArchitectureError::Model { stage, source });
                }
            };
            let result = response.trim();
            if result.is_empty() {
                state.save(project)?;
                self.log(
                    LogLevel::Warn,
                    format!("{stage}生成失败，模型返回内容为空。已保存阶段性数据。"),
                );
                return Ok(ArchitectureOutcome::Paused { stage });
            }

            match stage {
                ArchitectureStage::CharacterDynamics => {
                    project::write_atomic(&project.character_dynamics_path(), result)?;
                }
                ArchitectureStage::CharacterStateInit => {
                    project.write_character_state(result)?;
                    self.log(LogLevel::Info, "初始角色状态已写入。");
                }
                _ => {}
            }
            state.set(stage, result.to_string());
            state.save(project)?;
        }

        project::write_atomic(&project.architecture_path(), &render_architecture(seed, &state))?;
        self.log(LogLevel::Info, format!("{ARCHITECTURE_FILE_NAME} 已生成。"));
        if plan.is_partitioned() {
            project::write_atomic(
                &project.volume_architecture_path(),
                &render_volume_architecture(&plan, &state.text(ArchitectureStage::VolumePlan)),
            )?;
            self.log(LogLevel::Info, "分卷架构已生成。");
        }

        project::remove_if_exists(&project.partial_architecture_path())?;
        self.log(
            LogLevel::Info,
            format!("{PARTIAL_ARCHITECTURE_FILE_NAME} 已移除（全部步骤完成）。"),
        );
        Ok(ArchitectureOutcome::Complete(state))
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

fn stage_arguments(
    stage: ArchitectureStage,
    seed: &Seed,
    plan: &VolumePlan,
    state: &ArchitectureState,
) -> PromptArguments {
    let mut args = PromptArguments::new();
    args.insert("user_guidance".into(), seed.user_guidance.trim().to_string());
    args.insert("number_of_chapters".into(), seed.target_chapters.to_string());
    match stage {
        ArchitectureStage::CoreSeed => {
            args.insert("topic".into(), seed.topic.trim().to_string());
            args.insert("genre".into(), seed.genre.trim().to_string());
            args.insert("word_number".into(), seed.words_per_chapter.to_string());
        }
        ArchitectureStage::CharacterDynamics | ArchitectureStage::WorldBuilding => {
            args.insert("core_seed".into(), state.text(ArchitectureStage::CoreSeed));
        }
        ArchitectureStage::CharacterStateInit => {
            args.insert(
                "character_dynamics".into(),
                state.text(ArchitectureStage::CharacterDynamics),
            );
        }
        ArchitectureStage::PlotArchitecture => {
            args.insert("core_seed".into(), state.text(ArchitectureStage::CoreSeed));
            args.insert(
                "character_dynamics".into(),
                state.text(ArchitectureStage::CharacterDynamics),
            );
            args.insert(
                "world_building".into(),
                state.text(ArchitectureStage::WorldBuilding),
            );
        }
        ArchitectureStage::VolumePlan => {
            args.insert("core_seed".into(), state.text(ArchitectureStage::CoreSeed));
            args.insert(
                "character_dynamics".into(),
                state.text(ArchitectureStage::CharacterDynamics),
            );
            args.insert(
                "plot_architecture".into(),
                state.text(ArchitectureStage::PlotArchitecture),
            );
            args.insert("volume_count".into(), plan.volume_count().to_string());
            args.insert("volume_ranges".into(), plan.describe());
        }
    }
    args
}

fn render_architecture(seed: &Seed, state: &ArchitectureState) -> String {
    format!(
        "#=== 0) 小说设定 ===\n主题：{topic},类型：{genre},篇幅：约{chapters}章（每章{words}字）\n\n#=== 1) 核心种子 ===\n{core}\n\n#=== 2) 角色动力学 ===\n{characters}\n\n#=== 3) 世界观 ===\n{world}\n\n#=== 4) 三幕式情节架构 ===\n{plot}\n",
        topic = seed.topic.trim(),
        genre = seed.genre.trim(),
        chapters = seed.target_chapters,
        words = seed.words_per_chapter,
        core = state.text(ArchitectureStage::CoreSeed),
        characters = state.text(ArchitectureStage::CharacterDynamics),
        world = state.text(ArchitectureStage::WorldBuilding),
        plot = state.text(ArchitectureStage::PlotArchitecture),
    )
}

/// Computed ranges first; they win over any numbering in the prose.
fn render_volume_architecture(plan: &VolumePlan, prose: &str) -> String {
    format!(
        "#=== 分卷范围 ===\n{}\n\n#=== 分卷规划 ===\n{}\n",
        plan.describe(),
        prose
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ErrorKind;
    use crate::logging::VecLogSink;
    use crate::testing::{MockLanguageModel, MockReply};
    use tempfile::TempDir;

    fn seed() -> Seed {
        Seed::new("城市守夜人", "悬疑", 30, 800)
    }

    #[test]
    fn unpartitioned_run_writes_artifacts_and_removes_checkpoint() {
        let temp = TempDir::new().unwrap();
        let project = Project::open(temp.path()).unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ArchitectureService::new(&prompts, &sink);
        let model = MockLanguageModel::new(vec!["种子", "角色动力学", "初始状态", "世界观", "情节"]);

        let outcome = service
            .generate(&model, &project, &seed(), &CancellationToken::new())
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(model.calls(), 5);

        let architecture = project.architecture().unwrap();
        assert!(architecture.starts_with("#=== 0) 小说设定 ===\n主题：城市守夜人,类型：悬疑"));
        assert!(architecture.contains("#=== 4) 三幕式情节架构 ===\n情节"));
        assert_eq!(project.character_dynamics().unwrap(), "角色动力学");
        assert_eq!(project.character_state().unwrap(), "初始状态");
        assert!(!project.partial_architecture_path().exists());
        assert!(!project.volume_architecture_path().exists());
        assert!(model.prompts()[4].contains("世界观"));
    }

    #[test]
    fn partitioned_run_adds_volume_plan() {
        let temp = TempDir::new().unwrap();
        let project = Project::open(temp.path()).unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ArchitectureService::new(&prompts, &sink);
        let model = MockLanguageModel::new(vec!["种子", "角色", "状态", "世界", "情节", "第一卷讲起源"]);

        service
            .generate(&model, &project, &seed().with_volumes(3), &CancellationToken::new())
            .unwrap();
        assert!(model.prompts()[5].contains("第2卷：第11章 - 第20章"));
        let volumes = project.volume_architecture().unwrap();
        assert!(volumes.starts_with("#=== 分卷范围 ===\n第1卷：第1章 - 第10章"));
        assert!(volumes.contains("第一卷讲起源"));
    }

    #[test]
    fn empty_reply_pauses_and_resumes() {
        let temp = TempDir::new().unwrap();
        let project = Project::open(temp.path()).unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ArchitectureService::new(&prompts, &sink);

        let model = MockLanguageModel::new(vec!["种子", "角色", ""]);
        let outcome = service
            .generate(&model, &project, &seed(), &CancellationToken::new())
            .unwrap();
        assert_eq!(
            outcome,
            ArchitectureOutcome::Paused {
                stage: ArchitectureStage::CharacterStateInit
            }
        );
        let saved: ArchitectureState = project::read_json(&project.partial_architecture_path())
            .unwrap()
            .unwrap();
        assert_eq!(saved.get(ArchitectureStage::CharacterDynamics), Some("角色"));

        let model = MockLanguageModel::new(vec!["状态", "世界", "情节"]);
        let outcome = service
            .generate(&model, &project, &seed(), &CancellationToken::new())
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(model.calls(), 3);
        assert!(model.prompts()[0].contains("角色"));
    }

    #[test]
    fn provider_error_keeps_checkpoint() {
        let temp = TempDir::new().unwrap();
        let project = Project::open(temp.path()).unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ArchitectureService::new(&prompts, &sink);
        let model = MockLanguageModel::with_replies(vec![
            MockReply::Text("种子".into()),
            MockReply::Fail(ErrorKind::Network),
        ]);

        let err = service
            .generate(&model, &project, &seed(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            ArchitectureError::Model {
                stage: ArchitectureStage::CharacterDynamics,
                ..
            }
        ));
        let json = std::fs::read_to_string(project.partial_architecture_path()).unwrap();
        assert!(json.contains("core_seed_result"));
    }

    #[test]
    fn invalid_seed_is_rejected_before_any_call() {
        let temp = TempDir::new().unwrap();
        let project = Project::open(temp.path()).unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ArchitectureService::new(&prompts, &sink);
        let model = MockLanguageModel::new(vec![]);

        let err = service
            .generate(&model, &project, &seed().with_volumes(7), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ArchitectureError::Validation(_)));
        assert_eq!(model.calls(), 0);
    }
}
