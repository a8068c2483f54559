//! Self-heal reset strategies applied between step attempts.
//!
//! Soft reset discards local modifications in place. Hard reset rebuilds
//! the workspace from scratch: delete the clone, re-clone, re-create the
//! working branch, then replay each previously successful step's patch in
//! order. Replay failure is terminal for the job.

use crate::workspace::{BranchPlan, JobPaths, WorkspaceError, WorkspaceManager};
use moonmind_core::types::WorkdirMode;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum HealError {
    #[error("hard reset replay failed: {0}")]
    Replay(String),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

pub type Result<T> = std::result::Result<T, HealError>;

/// Applies reset strategies against a prepared workspace.
#[derive(Debug, Clone)]
pub struct HealDriver {
    workspace: WorkspaceManager,
}

impl HealDriver {
    pub fn new(workspace: WorkspaceManager) -> Self {
        Self { workspace }
    }

    /// `git reset --hard` plus clean; reuses the existing clone.
    pub async fn soft_reset(
        &self,
        paths: &JobPaths,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(repo = %paths.repo_dir.display(), "soft reset");
        self.workspace
            .soft_reset(&paths.repo_dir, &paths.execute_log, env, cancel)
            .await?;
        Ok(())
    }

    /// Rebuild the clone and replay completed-step patches in order.
    ///
    /// Patches that are missing or empty are skipped; any subprocess
    /// failure during replay is a `Replay` error, which callers treat as
    /// non-retryable.
    pub async fn hard_reset_replay(
        &self,
        repository: &str,
        paths: &JobPaths,
        plan: &BranchPlan,
        env: &BTreeMap<String, String>,
        patch_paths: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(
            repo = %paths.repo_dir.display(),
            patches = patch_paths.len(),
            "hard reset replay"
        );
        self.replay(repository, paths, plan, env, patch_paths, cancel)
            .await
            .map_err(|e| HealError::Replay(e.to_string()))
    }

    async fn replay(
        &self,
        repository: &str,
        paths: &JobPaths,
        plan: &BranchPlan,
        env: &BTreeMap<String, String>,
        patch_paths: &[PathBuf],
        cancel: &CancellationToken,
    ) -> std::result::Result<(), WorkspaceError> {
        self.workspace
            .prepare_repository(paths, repository, WorkdirMode::FreshClone, env, cancel)
            .await?;
        self.workspace
            .ensure_working_branch(&paths.repo_dir, plan, &paths.execute_log, env, cancel)
            .await?;
        for patch in patch_paths {
            let replayable = std::fs::metadata(patch)
                .map(|meta| meta.is_file() && meta.len() > 0)
                .unwrap_or(false);
            if !replayable {
                continue;
            }
            self.workspace
                .apply_patch(&paths.repo_dir, patch, &paths.execute_log, env, cancel)
                .await?;
        }
        Ok(())
    }
}
