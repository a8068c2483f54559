//! Skill catalog and per-job materialization.
//!
//! A skill is a named bundle of resources under the catalog directory, with
//! a `skill.yaml` manifest. Non-`auto` tasks get their selected skill copied
//! into `<job_root>/skills/<id>` during prepare; `auto` runs only get the
//! shared catalog linked into `skills_active`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SkillError {
    #[error("skill not found in catalog: {0}")]
    NotFound(String),
    #[error("invalid skill manifest for {id}: {detail}")]
    Manifest { id: String, detail: String },
    #[error("skill materialization failed: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, SkillError>;

/// Manifest at `<catalog>/<id>/skill.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// A skill copied into a job workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedSkill {
    pub id: String,
    pub path: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Directory of locally installed skills.
#[derive(Debug, Clone)]
pub struct SkillCatalog {
    root: PathBuf,
}

impl SkillCatalog {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Default cache root under the user data directory.
    pub fn default_cache_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join("moonmind/skills")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn skill_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Load and validate one skill's manifest.
    pub fn manifest(&self, id: &str) -> Result<SkillManifest> {
        let dir = self.skill_dir(id);
        if !dir.is_dir() {
            return Err(SkillError::NotFound(id.to_string()));
        }
        let manifest_path = dir.join("skill.yaml");
        let raw = std::fs::read_to_string(&manifest_path).map_err(|e| SkillError::Manifest {
            id: id.to_string(),
            detail: e.to_string(),
        })?;
        serde_yaml::from_str(&raw).map_err(|e| SkillError::Manifest {
            id: id.to_string(),
            detail: e.to_string(),
        })
    }

    /// List catalog entries with parseable manifests.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|id| match self.manifest(id) {
                Ok(_) => true,
                Err(error) => {
                    warn!(skill = %id, %error, "skipping unloadable skill");
                    false
                }
            })
            .collect();
        ids.sort();
        ids
    }

    /// Copy the selected skill into `<job_root>/skills/<id>`.
    pub fn materialize(&self, id: &str, job_root: &Path) -> Result<MaterializedSkill> {
        let manifest = self.manifest(id)?;
        let source = self.skill_dir(id);
        let target = job_root.join("skills").join(id);
        copy_tree(&source, &target).map_err(|e| SkillError::Io(e.to_string()))?;
        Ok(MaterializedSkill {
            id: id.to_string(),
            path: target.to_string_lossy().into_owned(),
            name: manifest.name,
            version: manifest.version,
        })
    }

    /// Expose the shared catalog to `auto` runs via `skills_active`.
    pub fn link_shared(&self, skills_active_dir: &Path) -> Result<()> {
        if !self.root.is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(skills_active_dir).map_err(|e| SkillError::Io(e.to_string()))?;
        let link = skills_active_dir.join("shared");
        if link.exists() {
            return Ok(());
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&self.root, &link)
            .map_err(|e| SkillError::Io(e.to_string()))?;
        Ok(())
    }
}

fn copy_tree(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let destination = target.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &destination)?;
        } else {
            std::fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}
