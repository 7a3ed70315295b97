//! Prompt templates: built-in defaults, per-project overrides under
//! `custom_prompts/` and the enable/disable catalog in `prompts_config.json`.

mod catalog;
mod template;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::logging::{LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink};
use crate::project::{self, ArtifactError, Project};

pub use catalog::{
    load_catalog, save_catalog, split_key, validate_catalog_value, BlueprintLabels, ModuleConfig,
    PromptCatalog, CATALOG_VERSION,
};
pub use template::{PromptArguments, PromptSource, PromptTemplate};

const BUILT_IN_PROMPTS: &str = include_str!("../../prompts/default.toml");

/// Module identifiers, `category.name`.
pub mod keys {
    pub const CORE_SEED: &str = "architecture.core_seed";
    pub const CHARACTER_DYNAMICS: &str = "architecture.character_dynamics";
    pub const CHARACTER_STATE_INIT: &str = "architecture.character_state_init";
    pub const WORLD_BUILDING: &str = "architecture.world_building";
    pub const PLOT_ARCHITECTURE: &str = "architecture.plot_architecture";
    pub const VOLUME_BREAKDOWN: &str = "architecture.volume_breakdown";

    pub const CHAPTER_BLUEPRINT: &str = "blueprint.chapter_blueprint";
    pub const CHUNKED_BLUEPRINT: &str = "blueprint.chunked_blueprint";

    pub const FIRST_CHAPTER: &str = "chapter.first_chapter";
    pub const NEXT_CHAPTER: &str = "chapter.next_chapter";
    pub const CHAPTER_SUMMARY: &str = "chapter.chapter_summary";
    pub const CHAPTER_SUMMARY_SIMPLE: &str = "chapter.chapter_summary_simple";
    pub const ENRICH: &str = "chapter.enrich";

    pub const SUMMARY_UPDATE: &str = "finalization.summary_update";
    pub const CHARACTER_STATE_UPDATE: &str = "finalization.character_state_update";
    pub const PLOT_ARCS_UPDATE: &str = "finalization.plot_arcs_update";
    pub const PLOT_ARCS_COMPRESS: &str = "finalization.plot_arcs_compress";
    pub const PLOT_ARCS_COMPRESS_AUTO: &str = "finalization.plot_arcs_compress_auto";
    pub const VOLUME_SUMMARY: &str = "finalization.volume_summary";

    pub const KNOWLEDGE_SEARCH: &str = "helper.knowledge_search";
    pub const KNOWLEDGE_FILTER: &str = "helper.knowledge_filter";
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("提示词模块 `{0}` 不存在")]
    NotFound(String),
    #[error("提示词模块 `{0}` 为必需模块，不能禁用")]
    Policy(String),
    #[error("提示词模块 `{key}` 仍被以下已启用模块依赖：{}", dependents.join("、"))]
    Dependency { key: String, dependents: Vec<String> },
    #[error("提示词模块 `{key}` 的模板为空")]
    EmptyTemplate { key: String },
    #[error("failed to parse built-in prompt definitions: {0}")]
    ParseBuiltIn(toml::de::Error),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

#[derive(Debug, Deserialize)]
struct RawPrompt {
    #[serde(alias = "text")]
    template: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    dependencies: Vec<String>,
}

type PromptDocument = BTreeMap<String, BTreeMap<String, RawPrompt>>;

pub struct PromptRegistry {
    builtins: BTreeMap<String, PromptTemplate>,
    defaults: PromptCatalog,
    catalog: PromptCatalog,
    root: Option<PathBuf>,
    sink: SharedLogSink,
}

impl std::fmt::Debug for PromptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptRegistry")
            .field("modules", &self.builtins.keys().collect::<Vec<_>>())
            .field("root", &self.root)
            .finish()
    }
}

impl PromptRegistry {
    /// Built-in templates only; no overrides, every optional module enabled.
    pub fn new() -> Result<Self, PromptError> {
        let (builtins, defaults) = parse_builtins()?;
        Ok(Self {
            builtins,
            catalog: defaults.clone(),
            defaults,
            root: None,
            sink: Arc::new(NullLogSink),
        })
    }

    /// Registry for `project`, reading `prompts_config.json` and `custom_prompts/`.
    ///
    /// A malformed catalog is backed up and replaced by defaults; loading
    /// never fails because of project files.
    pub fn load(project: &Project, sink: SharedLogSink) -> Result<Self, PromptError> {
        let (builtins, defaults) = parse_builtins()?;
        let catalog = load_catalog(&project.prompts_config_path(), &defaults, sink.as_ref());
        Ok(Self {
            builtins,
            defaults,
            catalog,
            root: Some(project.root().to_path_buf()),
            sink,
        })
    }

    pub fn catalog(&self) -> &PromptCatalog {
        &self.catalog
    }

    pub fn module(&self, key: &str) -> Option<&ModuleConfig> {
        self.catalog.module(key)
    }

    pub fn modules(&self) -> impl Iterator<Item = (String, &ModuleConfig)> {
        self.catalog.iter()
    }

    pub fn blueprint_labels(&self) -> &BlueprintLabels {
        &self.catalog.blueprint_labels
    }

    pub fn builtin(&self, key: &str) -> Option<&PromptTemplate> {
        self.builtins.get(key)
    }

    /// Unknown modules count as enabled.
    pub fn is_enabled(&self, key: &str) -> bool {
        self.catalog
            .module(key)
            .map(|config| config.enabled || config.required)
            .unwrap_or(true)
    }

    pub fn set_enabled(&mut self, key: &str, enabled: bool) -> Result<(), PromptError> {
        let config = self
            .catalog
            .module(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?;
        if !enabled {
            if config.required {
                return Err(PromptError::Policy(key.to_string()));
            }
            let dependents = self.catalog.enabled_dependents(key);
            if !dependents.is_empty() {
                return Err(PromptError::Dependency {
                    key: key.to_string(),
                    dependents,
                });
            }
        }
        if let Some(config) = self.catalog.module_mut(key) {
            config.enabled = enabled;
        }
        self.persist_catalog()
    }

    /// Raw template text: project override, then built-in, then empty.
    pub fn get(&self, key: &str) -> String {
        if let Some(text) = self.read_override(key) {
            return text;
        }
        match self.builtins.get(key) {
            Some(template) => template.template().to_string(),
            None => {
                self.warn(format!("提示词模块 `{key}` 没有可用模板，返回空文本"));
                String::new()
            }
        }
    }

    /// Parsed template. An override lacking any declared placeholder is
    /// ignored in favour of the built-in.
    pub fn template(&self, key: &str) -> Result<PromptTemplate, PromptError> {
        let builtin = self.builtins.get(key);
        if let Some(text) = self.read_override(key) {
            let path = self.override_path(key).unwrap_or_default();
            let candidate = PromptTemplate::parse(key, text, PromptSource::File(path));
            let declared: Vec<&str> = match (self.catalog.module(key), builtin) {
                (Some(config), _) if !config.placeholders.is_empty() => {
                    config.placeholders.iter().map(String::as_str).collect()
                }
                (_, Some(builtin)) => builtin.placeholders().collect(),
                _ => Vec::new(),
            };
            let missing: Vec<&str> = declared
                .into_iter()
                .filter(|name| !candidate.has_placeholder(name))
                .collect();
            if missing.is_empty() || builtin.is_none() {
                return Ok(candidate);
            }
            self.warn(format!(
                "自定义提示词 `{key}` 缺少占位符 {}，改用内置模板",
                missing.join("、")
            ));
        }
        builtin
            .cloned()
            .ok_or_else(|| PromptError::NotFound(key.to_string()))
    }

    /// Renders `key`; missing arguments become empty text with one warning.
    pub fn format(&self, key: &str, arguments: &PromptArguments) -> Result<String, PromptError> {
        let template = self.template(key)?;
        if template.template().trim().is_empty() {
            return Err(PromptError::EmptyTemplate {
                key: key.to_string(),
            });
        }
        Ok(self.render_template(&template, arguments))
    }

    pub fn format_with<I, K, V>(&self, key: &str, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.format(key, &collect_arguments(arguments))
    }

    /// Renders an ad-hoc template such as a user supplied draft prompt.
    pub fn format_text(&self, text: &str, arguments: &PromptArguments) -> String {
        let template = PromptTemplate::parse("custom", text, PromptSource::BuiltIn);
        self.render_template(&template, arguments)
    }

    pub fn save_override(&self, key: &str, content: &str) -> Result<PathBuf, PromptError> {
        let path = self
            .override_path(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?;
        project::write_atomic(&path, content)?;
        Ok(path)
    }

    /// Drops the project override so the built-in template applies again.
    pub fn reset(&self, key: &str) -> Result<(), PromptError> {
        if !self.builtins.contains_key(key) {
            return Err(PromptError::NotFound(key.to_string()));
        }
        if let Some(path) = self.override_path(key) {
            project::remove_if_exists(&path)?;
        }
        Ok(())
    }

    /// Restores every module switch to its default.
    pub fn reset_catalog(&mut self) -> Result<(), PromptError> {
        self.catalog = self.defaults.clone();
        self.persist_catalog()
    }

    pub fn override_path(&self, key: &str) -> Option<PathBuf> {
        let root = self.root.as_ref()?;
        let config = self.catalog.module(key)?;
        let relative = if config.file.is_empty() {
            let (_, name) = split_key(key)?;
            default_override_file(name)
        } else {
            config.file.clone()
        };
        Some(root.join(relative))
    }

    fn read_override(&self, key: &str) -> Option<String> {
        let path = self.override_path(key)?;
        match project::read_optional(&path) {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(err) => {
                self.warn(format!("读取自定义提示词失败，改用内置模板：{err}"));
                None
            }
        }
    }

    fn render_template(&self, template: &PromptTemplate, arguments: &PromptArguments) -> String {
        let missing = template.missing_arguments(arguments);
        if !missing.is_empty() {
            self.warn(format!(
                "提示词 `{}` 缺少参数 {}，按空文本处理",
                template.key(),
                missing.join("、")
            ));
        }
        template.render(arguments)
    }

    fn persist_catalog(&self) -> Result<(), PromptError> {
        if let Some(root) = &self.root {
            save_catalog(&root.join(project::PROMPTS_CONFIG_FILE_NAME), &self.catalog)?;
        }
        Ok(())
    }

    fn warn(&self, message: String) {
        self.sink.log(LogRecord::new(LogLevel::Warn, message));
    }
}

pub fn collect_arguments<I, K, V>(arguments: I) -> PromptArguments
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    arguments
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

fn default_override_file(name: &str) -> String {
    format!("{}/{name}.txt", project::CUSTOM_PROMPTS_DIR_NAME)
}

fn parse_builtins() -> Result<(BTreeMap<String, PromptTemplate>, PromptCatalog), PromptError> {
    let document: PromptDocument =
        toml::from_str(BUILT_IN_PROMPTS).map_err(PromptError::ParseBuiltIn)?;
    let mut templates = BTreeMap::new();
    let mut catalog = PromptCatalog::empty();
    for (category, prompts) in document {
        for (name, raw) in prompts {
            let key = format!("{category}.{name}");
            let template = PromptTemplate::parse(key.clone(), raw.template.trim(), PromptSource::BuiltIn);
            catalog.insert(
                &key,
                ModuleConfig {
                    name: if raw.title.is_empty() { name.clone() } else { raw.title },
                    description: raw.description,
                    file: default_override_file(&name),
                    enabled: true,
                    required: raw.required,
                    placeholders: template.placeholders().map(str::to_string).collect(),
                    dependencies: raw.dependencies,
                },
            );
            templates.insert(key, template);
        }
    }
    Ok((templates, catalog))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::VecLogSink;
    use std::fs;
    use tempfile::tempdir;

    const ALL_KEYS: &[&str] = &[
        keys::CORE_SEED,
        keys::CHARACTER_DYNAMICS,
        keys::CHARACTER_STATE_INIT,
        keys::WORLD_BUILDING,
        keys::PLOT_ARCHITECTURE,
        keys::VOLUME_BREAKDOWN,
        keys::CHAPTER_BLUEPRINT,
        keys::CHUNKED_BLUEPRINT,
        keys::FIRST_CHAPTER,
        keys::NEXT_CHAPTER,
        keys::CHAPTER_SUMMARY,
        keys::CHAPTER_SUMMARY_SIMPLE,
        keys::ENRICH,
        keys::SUMMARY_UPDATE,
        keys::CHARACTER_STATE_UPDATE,
        keys::PLOT_ARCS_UPDATE,
        keys::PLOT_ARCS_COMPRESS,
        keys::PLOT_ARCS_COMPRESS_AUTO,
        keys::VOLUME_SUMMARY,
        keys::KNOWLEDGE_SEARCH,
        keys::KNOWLEDGE_FILTER,
    ];

    fn project_registry() -> (tempfile::TempDir, Project, PromptRegistry, Arc<VecLogSink>) {
        let dir = tempdir().unwrap();
        let project = Project::open(dir.path()).unwrap();
        let sink = Arc::new(VecLogSink::new());
        let registry = PromptRegistry::load(&project, sink.clone()).unwrap();
        (dir, project, registry, sink)
    }

    #[test]
    fn every_module_has_a_builtin_template() {
        let registry = PromptRegistry::new().expect("registry");
        for key in ALL_KEYS {
            let template = registry.builtin(key).unwrap_or_else(|| panic!("{key} missing"));
            assert!(!template.template().is_empty(), "{key} empty");
            assert!(registry.module(key).is_some(), "{key} not in catalog");
        }
    }

    #[test]
    fn missing_arguments_render_empty_with_one_warning() {
        let (_dir, _project, registry, sink) = project_registry();
        let output = registry
            .format_with(keys::CORE_SEED, [("topic", "AI科幻")])
            .unwrap();
        assert!(output.contains("主题：AI科幻"));
        assert!(output.contains("类型：\n"));
        assert_eq!(sink.messages_at(LogLevel::Warn).len(), 1);
    }

    #[test]
    fn required_modules_cannot_be_disabled() {
        let (_dir, _project, mut registry, _sink) = project_registry();
        assert!(matches!(
            registry.set_enabled(keys::NEXT_CHAPTER, false),
            Err(PromptError::Policy(_))
        ));
        assert!(registry.is_enabled(keys::NEXT_CHAPTER));
    }

    #[test]
    fn disabling_with_enabled_dependents_is_rejected() {
        let (_dir, project, mut registry, _sink) = project_registry();
        match registry.set_enabled(keys::PLOT_ARCS_UPDATE, false) {
            Err(PromptError::Dependency { dependents, .. }) => {
                assert!(dependents.contains(&keys::PLOT_ARCS_COMPRESS.to_string()));
            }
            other => panic!("unexpected: {other:?}"),
        }

        registry.set_enabled(keys::PLOT_ARCS_COMPRESS, false).unwrap();
        registry.set_enabled(keys::PLOT_ARCS_COMPRESS_AUTO, false).unwrap();
        registry.set_enabled(keys::PLOT_ARCS_UPDATE, false).unwrap();
        assert!(!registry.is_enabled(keys::PLOT_ARCS_UPDATE));

        let reloaded = PromptRegistry::load(&project, Arc::new(NullLogSink)).unwrap();
        assert!(!reloaded.is_enabled(keys::PLOT_ARCS_UPDATE));
    }

    #[test]
    fn unknown_modules_are_enabled() {
        let registry = PromptRegistry::new().unwrap();
        assert!(registry.is_enabled("helper.does_not_exist"));
        assert_eq!(registry.get("helper.does_not_exist"), "");
    }

    #[test]
    fn override_with_placeholders_wins_and_reset_restores_builtin() {
        let (_dir, _project, registry, _sink) = project_registry();
        let builtin = registry.builtin(keys::KNOWLEDGE_FILTER).unwrap().template().to_string();
        registry
            .save_override(keys::KNOWLEDGE_FILTER, "定制：{chapter_info}\n{retrieved_texts}")
            .unwrap();
        let rendered = registry
            .format_with(
                keys::KNOWLEDGE_FILTER,
                [("chapter_info", "第3章"), ("retrieved_texts", "片段")],
            )
            .unwrap();
        assert_eq!(rendered, "定制：第3章\n片段");

        registry.reset(keys::KNOWLEDGE_FILTER).unwrap();
        assert_eq!(registry.get(keys::KNOWLEDGE_FILTER), builtin);
    }

    #[test]
    fn override_missing_placeholders_falls_back() {
        let (_dir, project, registry, sink) = project_registry();
        let path = registry.override_path(keys::CHARACTER_STATE_UPDATE).unwrap();
        assert!(path.starts_with(project.custom_prompts_dir()));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "只更新状态：{old_state}").unwrap();

        let template = registry.template(keys::CHARACTER_STATE_UPDATE).unwrap();
        assert!(template.source().is_builtin());
        assert!(sink
            .messages_at(LogLevel::Warn)
            .iter()
            .any(|message| message.contains("缺少占位符")));
    }
}
