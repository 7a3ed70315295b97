use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::logging::{LogLevel, LogRecord, LogSink};

pub const CATALOG_VERSION: &str = "1.0";

fn default_version() -> String {
    CATALOG_VERSION.to_string()
}

fn default_enabled() -> bool {
    true
}

/// Per-module switches and metadata persisted in `prompts_config.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub placeholders: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Label synonyms accepted by the blueprint parser, keyed by field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueprintLabels {
    pub chapter_role: Vec<String>,
    pub chapter_purpose: Vec<String>,
    pub suspense_level: Vec<String>,
    pub foreshadowing: Vec<String>,
    pub plot_twist_level: Vec<String>,
    pub chapter_summary: Vec<String>,
}

fn owned(labels: &[&str]) -> Vec<String> {
    labels.iter().map(|label| label.to_string()).collect()
}

impl Default for BlueprintLabels {
    fn default() -> Self {
        Self {
            chapter_role: owned(&["本章定位", "章节定位", "定位", "角色定位"]),
            chapter_purpose: owned(&["核心作用", "章节作用", "作用", "本章作用"]),
            suspense_level: owned(&["悬念密度", "悬念等级", "悬念强度", "悬念"]),
            foreshadowing: owned(&["伏笔操作", "伏笔设计", "伏笔"]),
            plot_twist_level: owned(&["认知颠覆", "颠覆程度", "转折程度", "反转程度"]),
            chapter_summary: owned(&["本章简述", "章节简述", "简述", "内容概要", "章节概要", "概要"]),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptCatalog {
    #[serde(default = "default_version")]
    pub version: String,
    pub modules: BTreeMap<String, BTreeMap<String, ModuleConfig>>,
    #[serde(default)]
    pub blueprint_labels: BlueprintLabels,
}

impl PromptCatalog {
    pub fn empty() -> Self {
        Self {
            version: default_version(),
            modules: BTreeMap::new(),
            blueprint_labels: BlueprintLabels::default(),
        }
    }

    pub fn module(&self, key: &str) -> Option<&ModuleConfig> {
        let (category, name) = split_key(key)?;
        self.modules.get(category)?.get(name)
    }

    pub fn module_mut(&mut self, key: &str) -> Option<&mut ModuleConfig> {
        let (category, name) = split_key(key)?;
        self.modules.get_mut(category)?.get_mut(name)
    }

    pub fn insert(&mut self, key: &str, config: ModuleConfig) {
        if let Some((category, name)) = split_key(key) {
            self.modules
                .entry(category.to_string())
                .or_default()
                .insert(name.to_string(), config);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (String, &ModuleConfig)> {
        self.modules.iter().flat_map(|(category, modules)| {
            modules
                .iter()
                .map(move |(name, config)| (format!("{category}.{name}"), config))
        })
    }

    /// Enabled modules that list `key` among their dependencies.
    pub fn enabled_dependents(&self, key: &str) -> Vec<String> {
        self.iter()
            .filter(|(_, config)| config.enabled && config.dependencies.iter().any(|dep| dep == key))
            .map(|(id, _)| id)
            .collect()
    }

    /// Adds modules from `defaults` that this catalog does not know yet and
    /// refreshes declared placeholders. User switches are kept.
    pub fn merge_defaults(&mut self, defaults: &PromptCatalog) -> bool {
        let mut changed = false;
        for (key, config) in defaults.iter() {
            match self.module_mut(&key) {
                Some(existing) => {
                    if existing.placeholders != config.placeholders {
                        existing.placeholders = config.placeholders.clone();
                        changed = true;
                    }
                    if config.required && !existing.required {
                        existing.required = true;
                        existing.enabled = true;
                        changed = true;
                    }
                }
                None => {
                    self.insert(&key, config.clone());
                    changed = true;
                }
            }
        }
        changed
    }
}

pub fn split_key(key: &str) -> Option<(&str, &str)> {
    let (category, name) = key.split_once('.')?;
    if category.is_empty() || name.is_empty() {
        return None;
    }
    Some((category, name))
}

/// Checks the raw JSON shape before deserializing.
pub fn validate_catalog_value(value: &Value) -> Result<(), String> {
    let root = value.as_object().ok_or("根节点必须是对象")?;
    let modules = root
        .get("modules")
        .ok_or("缺少 modules 字段")?
        .as_object()
        .ok_or("modules 必须是对象")?;
    for (category, entries) in modules {
        let entries = entries
            .as_object()
            .ok_or_else(|| format!("分类 `{category}` 必须是对象"))?;
        for (name, config) in entries {
            let config = config
                .as_object()
                .ok_or_else(|| format!("模块 `{category}.{name}` 必须是对象"))?;
            for field in ["enabled", "required"] {
                match config.get(field) {
                    Some(Value::Bool(_)) => {}
                    _ => return Err(format!("模块 `{category}.{name}` 缺少布尔字段 `{field}`")),
                }
            }
        }
    }
    Ok(())
}

/// Loads the catalog at `path`, falling back to `defaults`.
///
/// A file that fails validation is renamed to
/// `prompts_config.json.bak.<timestamp>` and replaced by the defaults.
pub fn load_catalog(path: &Path, defaults: &PromptCatalog, sink: &dyn LogSink) -> PromptCatalog {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if let Err(err) = save_catalog(path, defaults) {
                warn(sink, format!("无法写入默认提示词配置 `{}`：{err}", path.display()));
            }
            return defaults.clone();
        }
        Err(err) => {
            warn(
                sink,
                format!("读取提示词配置 `{}` 失败，使用默认配置：{err}", path.display()),
            );
            return defaults.clone();
        }
    };

    let parsed = serde_json::from_str::<Value>(&contents)
        .map_err(|err| err.to_string())
        .and_then(|value| {
            validate_catalog_value(&value)?;
            serde_json::from_value::<PromptCatalog>(value).map_err(|err| err.to_string())
        });

    match parsed {
        Ok(mut catalog) => {
            if catalog.merge_defaults(defaults) {
                if let Err(err) = save_catalog(path, &catalog) {
                    warn(sink, format!("更新提示词配置失败：{err}"));
                }
            }
            catalog
        }
        Err(reason) => {
            let backup = backup_path(path);
            match fs::rename(path, &backup) {
                Ok(()) => warn(
                    sink,
                    format!(
                        "提示词配置 `{}` 无效（{reason}），已备份为 `{}` 并恢复默认配置",
                        path.display(),
                        backup.display()
                    ),
                ),
                Err(err) => warn(
                    sink,
                    format!("提示词配置无效（{reason}），且备份失败：{err}"),
                ),
            }
            if let Err(err) = save_catalog(path, defaults) {
                warn(sink, format!("无法写入默认提示词配置：{err}"));
            }
            defaults.clone()
        }
    }
}

pub fn save_catalog(path: &Path, catalog: &PromptCatalog) -> Result<(), crate::project::ArtifactError> {
    crate::project::write_json(path, catalog)
}

fn backup_path(path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "prompts_config.json".to_string());
    path.with_file_name(format!("{file_name}.bak.{stamp}"))
}

fn warn(sink: &dyn LogSink, message: String) {
    sink.log(LogRecord::new(LogLevel::Warn, message));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::VecLogSink;
    use tempfile::tempdir;

    fn sample_defaults() -> PromptCatalog {
        let mut catalog = PromptCatalog::empty();
        catalog.insert(
            "finalization.plot_arcs_update",
            ModuleConfig {
                name: "伏笔台账更新".into(),
                description: String::new(),
                file: "custom_prompts/plot_arcs_update.txt".into(),
                enabled: true,
                required: false,
                placeholders: vec!["chapter_text".into()],
                dependencies: vec![],
            },
        );
        catalog.insert(
            "finalization.plot_arcs_compress",
            ModuleConfig {
                name: "伏笔精简".into(),
                description: String::new(),
                file: "custom_prompts/plot_arcs_compress.txt".into(),
                enabled: true,
                required: false,
                placeholders: vec![],
                dependencies: vec!["finalization.plot_arcs_update".into()],
            },
        );
        catalog
    }

    #[test]
    fn invalid_file_is_backed_up_and_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prompts_config.json");
        fs::write(&path, r#"{"modules": {"chapter": {"enrich": {"enabled": "yes"}}}}"#).unwrap();
        let sink = VecLogSink::new();

        let catalog = load_catalog(&path, &sample_defaults(), &sink);

        assert_eq!(catalog, sample_defaults());
        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("prompts_config.json.bak."))
            .collect();
        assert_eq!(backups.len(), 1);
        assert!(path.exists());
        assert_eq!(sink.messages_at(LogLevel::Warn).len(), 1);
    }

    #[test]
    fn merge_keeps_user_switches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prompts_config.json");
        let mut stored = PromptCatalog::empty();
        let mut disabled = sample_defaults()
            .module("finalization.plot_arcs_compress")
            .cloned()
            .unwrap();
        disabled.enabled = false;
        stored.insert("finalization.plot_arcs_compress", disabled);
        save_catalog(&path, &stored).unwrap();

        let catalog = load_catalog(&path, &sample_defaults(), &VecLogSink::new());

        assert!(!catalog.module("finalization.plot_arcs_compress").unwrap().enabled);
        assert!(catalog.module("finalization.plot_arcs_update").is_some());
    }

    #[test]
    fn finds_enabled_dependents() {
        let catalog = sample_defaults();
        assert_eq!(
            catalog.enabled_dependents("finalization.plot_arcs_update"),
            vec!["finalization.plot_arcs_compress".to_string()]
        );
        assert!(catalog.enabled_dependents("finalization.plot_arcs_compress").is_empty());
    }
}
