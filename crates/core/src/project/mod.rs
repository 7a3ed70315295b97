//! On-disk layout of a novel project and crash-safe access to its artifacts.
//!
//! Every text artifact is replaced through a temporary file in the same
//! directory followed by a rename, so readers only ever observe the previous
//! or the new content.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::seed::Seed;

pub const SEED_FILE_NAME: &str = "seed.json";
pub const PARTIAL_ARCHITECTURE_FILE_NAME: &str = "partial_architecture.json";
pub const ARCHITECTURE_FILE_NAME: &str = "Novel_architecture.txt";
pub const VOLUME_ARCHITECTURE_FILE_NAME: &str = "Volume_architecture.txt";
pub const BLUEPRINT_FILE_NAME: &str = "Novel_directory.txt";
pub const GLOBAL_SUMMARY_FILE_NAME: &str = "global_summary.txt";
pub const CHARACTER_DYNAMICS_FILE_NAME: &str = "character_dynamics.txt";
pub const CHARACTER_STATE_FILE_NAME: &str = "character_state.txt";
pub const PLOT_ARCS_FILE_NAME: &str = "plot_arcs.txt";
pub const CHAPTERS_DIR_NAME: &str = "chapters";
pub const VECTORSTORE_DIR_NAME: &str = "vectorstore";
pub const CUSTOM_PROMPTS_DIR_NAME: &str = "custom_prompts";
pub const PROMPTS_CONFIG_FILE_NAME: &str = "prompts_config.json";
pub const RETRIEVAL_STATS_FILE_NAME: &str = "vectorstore_stats.json";
pub const LOG_DIR_NAME: &str = "logs";
pub const LOG_FILE_NAME: &str = "app.log";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("无法创建目录 `{path}`: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("读取 `{path}` 失败: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("写入 `{path}` 失败: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("删除 `{path}` 失败: {source}")]
    Remove { path: PathBuf, source: io::Error },
    #[error("缺少必需文件 `{path}`")]
    Missing { path: PathBuf },
    #[error("解析 `{path}` 失败: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("序列化 `{path}` 失败: {source}")]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("第1章已生成，种子设定 `{path}` 不可再修改")]
    SeedLocked { path: PathBuf },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Project {
    root: PathBuf,
}

impl Project {
    /// Handle on `root` without touching the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Handle on `root`, creating the directory and `chapters/` when absent.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let project = Self::new(root);
        ensure_dir(&project.root)?;
        ensure_dir(&project.chapters_dir())?;
        Ok(project)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn seed_path(&self) -> PathBuf {
        self.root.join(SEED_FILE_NAME)
    }

    pub fn partial_architecture_path(&self) -> PathBuf {
        self.root.join(PARTIAL_ARCHITECTURE_FILE_NAME)
    }

    pub fn architecture_path(&self) -> PathBuf {
        self.root.join(ARCHITECTURE_FILE_NAME)
    }

    pub fn volume_architecture_path(&self) -> PathBuf {
        self.root.join(VOLUME_ARCHITECTURE_FILE_NAME)
    }

    pub fn blueprint_path(&self) -> PathBuf {
        self.root.join(BLUEPRINT_FILE_NAME)
    }

    pub fn global_summary_path(&self) -> PathBuf {
        self.root.join(GLOBAL_SUMMARY_FILE_NAME)
    }

    pub fn character_dynamics_path(&self) -> PathBuf {
        self.root.join(CHARACTER_DYNAMICS_FILE_NAME)
    }

    pub fn character_state_path(&self) -> PathBuf {
        self.root.join(CHARACTER_STATE_FILE_NAME)
    }

    pub fn plot_arcs_path(&self) -> PathBuf {
        self.root.join(PLOT_ARCS_FILE_NAME)
    }

    pub fn chapters_dir(&self) -> PathBuf {
        self.root.join(CHAPTERS_DIR_NAME)
    }

    pub fn chapter_path(&self, chapter: u32) -> PathBuf {
        self.chapters_dir().join(format!("chapter_{chapter}.txt"))
    }

    pub fn volume_summary_path(&self, volume: u32) -> PathBuf {
        self.root.join(format!("volume_{volume}_summary.txt"))
    }

    pub fn vectorstore_dir(&self) -> PathBuf {
        self.root.join(VECTORSTORE_DIR_NAME)
    }

    pub fn custom_prompts_dir(&self) -> PathBuf {
        self.root.join(CUSTOM_PROMPTS_DIR_NAME)
    }

    pub fn prompts_config_path(&self) -> PathBuf {
        self.root.join(PROMPTS_CONFIG_FILE_NAME)
    }

    pub fn retrieval_stats_path(&self) -> PathBuf {
        self.root.join(RETRIEVAL_STATS_FILE_NAME)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_DIR_NAME).join(LOG_FILE_NAME)
    }

    pub fn read_seed(&self) -> Result<Option<Seed>, ArtifactError> {
        read_json(&self.seed_path())
    }

    /// Persists the seed. Refused once chapter 1 exists on disk.
    pub fn write_seed(&self, seed: &Seed) -> Result<(), ArtifactError> {
        let path = self.seed_path();
        if path.exists() && self.chapter_exists(1) {
            let current = self.read_seed()?;
            if current.as_ref() != Some(seed) {
                return Err(ArtifactError::SeedLocked { path });
            }
            return Ok(());
        }
        write_json(&path, seed)
    }

    pub fn architecture(&self) -> Result<String, ArtifactError> {
        read_optional(&self.architecture_path())
    }

    pub fn volume_architecture(&self) -> Result<String, ArtifactError> {
        read_optional(&self.volume_architecture_path())
    }

    pub fn blueprint_text(&self) -> Result<String, ArtifactError> {
        read_optional(&self.blueprint_path())
    }

    pub fn global_summary(&self) -> Result<String, ArtifactError> {
        read_optional(&self.global_summary_path())
    }

    pub fn write_global_summary(&self, text: &str) -> Result<(), ArtifactError> {
        write_atomic(&self.global_summary_path(), text)
    }

    pub fn character_dynamics(&self) -> Result<String, ArtifactError> {
        read_optional(&self.character_dynamics_path())
    }

    pub fn character_state(&self) -> Result<String, ArtifactError> {
        read_optional(&self.character_state_path())
    }

    pub fn write_character_state(&self, text: &str) -> Result<(), ArtifactError> {
        write_atomic(&self.character_state_path(), text)
    }

    pub fn plot_arcs(&self) -> Result<String, ArtifactError> {
        read_optional(&self.plot_arcs_path())
    }

    pub fn write_plot_arcs(&self, text: &str) -> Result<(), ArtifactError> {
        write_atomic(&self.plot_arcs_path(), text)
    }

    pub fn volume_summary(&self, volume: u32) -> Result<String, ArtifactError> {
        read_optional(&self.volume_summary_path(volume))
    }

    pub fn write_volume_summary(&self, volume: u32, text: &str) -> Result<(), ArtifactError> {
        write_atomic(&self.volume_summary_path(volume), text)
    }

    pub fn chapter_exists(&self, chapter: u32) -> bool {
        self.chapter_path(chapter).is_file()
    }

    /// Chapter text, or `None` when the file does not exist.
    pub fn chapter_text(&self, chapter: u32) -> Result<Option<String>, ArtifactError> {
        let path = self.chapter_path(chapter);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ArtifactError::Read { path, source }),
        }
    }

    pub fn write_chapter(&self, chapter: u32, text: &str) -> Result<PathBuf, ArtifactError> {
        let path = self.chapter_path(chapter);
        write_atomic(&path, text)?;
        Ok(path)
    }

    /// Chapter numbers below `chapter` that have no file on disk.
    pub fn missing_chapters_before(&self, chapter: u32) -> Vec<u32> {
        (1..chapter)
            .filter(|number| !self.chapter_exists(*number))
            .collect()
    }
}

pub(crate) fn ensure_dir(path: &Path) -> Result<(), ArtifactError> {
    fs::create_dir_all(path).map_err(|source| ArtifactError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

/// File contents, or an empty string when the file does not exist.
pub fn read_optional(path: &Path) -> Result<String, ArtifactError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(ArtifactError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn read_required(path: &Path) -> Result<String, ArtifactError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(ArtifactError::Missing {
            path: path.to_path_buf(),
        }),
        Err(source) => Err(ArtifactError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Replaces `path` with `contents` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), ArtifactError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    ensure_dir(&parent)?;

    let write_error = |source: io::Error| ArtifactError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut file = NamedTempFile::new_in(&parent).map_err(write_error)?;
    file.write_all(contents.as_bytes()).map_err(write_error)?;
    file.as_file().sync_all().map_err(write_error)?;
    file.persist(path)
        .map_err(|err| write_error(err.error))?;
    Ok(())
}

pub fn remove_if_exists(path: &Path) -> Result<(), ArtifactError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ArtifactError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ArtifactError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ArtifactError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| ArtifactError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let data = serde_json::to_string_pretty(value).map_err(|source| ArtifactError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_layout() {
        let dir = tempdir().unwrap();
        let project = Project::open(dir.path().join("novel")).unwrap();
        assert!(project.chapters_dir().is_dir());
        assert_eq!(
            project.chapter_path(7),
            project.root().join("chapters").join("chapter_7.txt")
        );
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempdir().unwrap();
        let project = Project::open(dir.path()).unwrap();
        project.write_global_summary("旧摘要").unwrap();
        project.write_global_summary("新摘要").unwrap();
        assert_eq!(project.global_summary().unwrap(), "新摘要");

        let leftovers: Vec<_> = fs::read_dir(project.root())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_optional_artifacts_read_as_empty() {
        let dir = tempdir().unwrap();
        let project = Project::open(dir.path()).unwrap();
        assert_eq!(project.character_state().unwrap(), "");
        assert!(project.chapter_text(3).unwrap().is_none());
        assert!(matches!(
            read_required(&project.architecture_path()),
            Err(ArtifactError::Missing { .. })
        ));
    }

    #[test]
    fn seed_is_locked_once_first_chapter_exists() {
        let dir = tempdir().unwrap();
        let project = Project::open(dir.path()).unwrap();
        let seed = Seed::new("星海", "科幻", 10, 2000);
        project.write_seed(&seed).unwrap();
        project.write_chapter(1, "第一章正文").unwrap();

        let changed = Seed::new("星海", "奇幻", 10, 2000);
        assert!(matches!(
            project.write_seed(&changed),
            Err(ArtifactError::SeedLocked { .. })
        ));
        project.write_seed(&seed).unwrap();
        assert_eq!(project.read_seed().unwrap(), Some(seed));
    }

    #[test]
    fn lists_missing_chapters() {
        let dir = tempdir().unwrap();
        let project = Project::open(dir.path()).unwrap();
        project.write_chapter(1, "一").unwrap();
        project.write_chapter(3, "三").unwrap();
        assert_eq!(project.missing_chapters_before(5), vec![2, 4]);
    }
}
