//! Workspace preparation: clone, branch resolution, canonical layout.
//!
//! Each job gets `workdir/<job_id>/{repo, artifacts, artifacts/logs, home,
//! skills_active}`. The repository is cloned fresh or reused, the default
//! branch is resolved from the remote, and the working branch is checked
//! out before the execute stage ever runs.

use crate::process::{CommandError, CommandRunner, CommandSpec};
use moonmind_core::artifacts::sha256_text;
use moonmind_core::naming::generate_branch_name;
use moonmind_core::types::WorkdirMode;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("repository URL must not include embedded credentials")]
    EmbeddedCredentials,
    #[error("failed to reset workspace directory: {0}")]
    Layout(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// On-disk layout for one job.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub job_root: PathBuf,
    pub repo_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub home_dir: PathBuf,
    pub skills_active_dir: PathBuf,
    pub prepare_log: PathBuf,
    pub execute_log: PathBuf,
    pub publish_log: PathBuf,
    pub task_context_path: PathBuf,
    pub publish_result_path: PathBuf,
}

impl JobPaths {
    pub fn new(workdir: &Path, job_id: Uuid) -> Self {
        let job_root = workdir.join(job_id.to_string());
        let artifacts_dir = job_root.join("artifacts");
        let logs_dir = artifacts_dir.join("logs");
        Self {
            repo_dir: job_root.join("repo"),
            home_dir: job_root.join("home"),
            skills_active_dir: job_root.join("skills_active"),
            prepare_log: logs_dir.join("prepare.log"),
            execute_log: logs_dir.join("execute.log"),
            publish_log: logs_dir.join("publish.log"),
            task_context_path: artifacts_dir.join("task_context.json"),
            publish_result_path: artifacts_dir.join("publish_result.json"),
            artifacts_dir,
            logs_dir,
            job_root,
        }
    }

    /// Create every directory the stages rely on.
    pub fn create_dirs(&self) -> Result<()> {
        for dir in [
            &self.job_root,
            &self.artifacts_dir,
            &self.logs_dir,
            &self.home_dir,
            &self.skills_active_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| WorkspaceError::Layout(e.to_string()))?;
        }
        Ok(())
    }
}

/// Resolved branch state for a prepared workspace.
#[derive(Debug, Clone)]
pub struct BranchPlan {
    pub default_branch: String,
    pub starting_branch: String,
    pub new_branch: Option<String>,
    pub working_branch: String,
}

/// Derive the clone URL for a repository reference.
///
/// `owner/name` becomes a GitHub HTTPS URL; explicit http(s) URLs are used
/// verbatim but rejected when they embed userinfo; scp-style `git@` remotes
/// pass through. Tokens never ride in URLs: push auth comes from the
/// command environment.
pub fn clone_url(repository: &str) -> Result<String> {
    let repository = repository.trim();
    if repository.starts_with("http://") || repository.starts_with("https://") {
        let after_scheme = repository.split_once("://").map_or("", |(_, rest)| rest);
        let authority = after_scheme.split('/').next().unwrap_or("");
        if authority.contains('@') {
            return Err(WorkspaceError::EmbeddedCredentials);
        }
        return Ok(repository.to_string());
    }
    if repository.starts_with("git@")
        || repository.starts_with("file://")
        || repository.starts_with('/')
    {
        // scp-style remotes and local mirrors pass through untouched.
        return Ok(repository.to_string());
    }
    Ok(format!("https://github.com/{repository}.git"))
}

/// Prepares and manipulates job workspaces through git.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    runner: CommandRunner,
}

impl WorkspaceManager {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    fn git(
        &self,
        args: &[&str],
        cwd: &Path,
        log: &Path,
        env: &BTreeMap<String, String>,
    ) -> CommandSpec {
        let mut command = vec!["git".to_string()];
        command.extend(args.iter().map(ToString::to_string));
        CommandSpec::new(command, cwd, log).with_env(env.clone())
    }

    /// Clone or reuse the repository directory.
    pub async fn prepare_repository(
        &self,
        paths: &JobPaths,
        repository: &str,
        workdir_mode: WorkdirMode,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if workdir_mode == WorkdirMode::FreshClone && paths.repo_dir.exists() {
            std::fs::remove_dir_all(&paths.repo_dir)
                .map_err(|e| WorkspaceError::Layout(e.to_string()))?;
        }

        if !paths.repo_dir.exists() {
            let url = clone_url(repository)?;
            let clone = self.git(
                &["clone", "--", &url, &paths.repo_dir.to_string_lossy()],
                &paths.job_root,
                &paths.prepare_log,
                env,
            );
            self.runner.run(&clone, cancel, None).await?;
        }

        // Refresh remote refs; failures here are tolerable on fresh clones.
        let fetch = self
            .git(
                &["fetch", "--all", "--prune"],
                &paths.repo_dir,
                &paths.prepare_log,
                env,
            )
            .no_check();
        self.runner.run(&fetch, cancel, None).await?;
        Ok(())
    }

    /// Resolve the remote default branch.
    ///
    /// Prefers `git symbolic-ref refs/remotes/origin/HEAD`, falls back to
    /// parsing `git remote show origin`, and finally to `main`.
    pub async fn resolve_default_branch(
        &self,
        repo_dir: &Path,
        log: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let symbolic = self
            .git(
                &["symbolic-ref", "--quiet", "--short", "refs/remotes/origin/HEAD"],
                repo_dir,
                log,
                env,
            )
            .no_check();
        let output = self.runner.run(&symbolic, cancel, None).await?;
        if output.exit_code == 0 {
            let resolved = output.stdout.trim();
            if !resolved.is_empty() {
                return Ok(resolved
                    .strip_prefix("origin/")
                    .unwrap_or(resolved)
                    .to_string());
            }
        }

        let remote_show = self
            .git(&["remote", "show", "origin"], repo_dir, log, env)
            .no_check();
        let output = self.runner.run(&remote_show, cancel, None).await?;
        for line in output.stdout.lines() {
            if let Some(candidate) = line.split("HEAD branch:").nth(1) {
                let candidate = candidate.trim();
                if !candidate.is_empty() {
                    return Ok(candidate.to_string());
                }
            }
        }
        Ok("main".to_string())
    }

    /// Choose starting/new/working branches from payload hints.
    ///
    /// With no hints the worker branches off the default branch under a
    /// synthesized `task/...` name; an explicit starting branch that is not
    /// the default is operated on directly.
    pub fn plan_branches(
        job_id: Uuid,
        default_branch: &str,
        starting_hint: Option<&str>,
        new_hint: Option<&str>,
        skill: Option<&str>,
    ) -> BranchPlan {
        let starting_branch = starting_hint.unwrap_or(default_branch).to_string();
        let new_branch = if let Some(hint) = new_hint {
            Some(hint.to_string())
        } else if starting_branch != default_branch {
            None
        } else {
            Some(generate_branch_name(job_id, chrono::Utc::now(), skill))
        };
        let working_branch = new_branch
            .clone()
            .unwrap_or_else(|| starting_branch.clone());
        BranchPlan {
            default_branch: default_branch.to_string(),
            starting_branch,
            new_branch,
            working_branch,
        }
    }

    /// Check out the starting branch (creating from origin if needed) and
    /// the new working branch on top of it.
    pub async fn ensure_working_branch(
        &self,
        repo_dir: &Path,
        plan: &BranchPlan,
        log: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let checkout = self
            .git(&["checkout", &plan.starting_branch], repo_dir, log, env)
            .no_check();
        let output = self.runner.run(&checkout, cancel, None).await?;
        if output.exit_code != 0 {
            let tracking = format!("origin/{}", plan.starting_branch);
            let create = self.git(
                &["checkout", "-B", &plan.starting_branch, &tracking],
                repo_dir,
                log,
                env,
            );
            self.runner.run(&create, cancel, None).await?;
        }

        if let Some(new_branch) = &plan.new_branch {
            let create = self.git(
                &["checkout", "-B", new_branch, &plan.starting_branch],
                repo_dir,
                log,
                env,
            );
            self.runner.run(&create, cancel, None).await?;
        }
        Ok(())
    }

    /// Discard all local modifications, keeping the clone.
    pub async fn soft_reset(
        &self,
        repo_dir: &Path,
        log: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let reset = self.git(&["reset", "--hard"], repo_dir, log, env);
        self.runner.run(&reset, cancel, None).await?;
        let clean = self.git(&["clean", "-fd"], repo_dir, log, env).no_check();
        self.runner.run(&clean, cancel, None).await?;
        Ok(())
    }

    /// `git status --porcelain`; empty means nothing to publish.
    pub async fn status_porcelain(
        &self,
        repo_dir: &Path,
        log: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let status = self
            .git(&["status", "--porcelain"], repo_dir, log, env)
            .no_check();
        let output = self.runner.run(&status, cancel, None).await?;
        Ok(output.stdout)
    }

    /// Record intent-to-add for untracked files so they show up in diffs.
    pub async fn register_untracked(
        &self,
        repo_dir: &Path,
        log: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let intent = self
            .git(&["add", "-N", "."], repo_dir, log, env)
            .no_check();
        self.runner.run(&intent, cancel, None).await?;
        Ok(())
    }

    /// Unstaged working-tree diff (one step's delta when prior steps are
    /// absorbed into the index).
    pub async fn diff(
        &self,
        repo_dir: &Path,
        log: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let diff = self.git(&["diff"], repo_dir, log, env).no_check();
        let output = self.runner.run(&diff, cancel, None).await?;
        Ok(output.stdout)
    }

    /// Cumulative diff against HEAD, staged and unstaged.
    pub async fn diff_head(
        &self,
        repo_dir: &Path,
        log: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let diff = self.git(&["diff", "HEAD"], repo_dir, log, env).no_check();
        let output = self.runner.run(&diff, cancel, None).await?;
        Ok(output.stdout)
    }

    /// Absorb the current working tree into the index.
    pub async fn stage_all(
        &self,
        repo_dir: &Path,
        log: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let add = self.git(&["add", "-A"], repo_dir, log, env);
        self.runner.run(&add, cancel, None).await?;
        Ok(())
    }

    /// Hash of the cumulative diff, used for no-progress detection.
    pub async fn diff_hash(
        &self,
        repo_dir: &Path,
        log: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.register_untracked(repo_dir, log, env, cancel).await?;
        let diff = self.diff_head(repo_dir, log, env, cancel).await?;
        Ok(sha256_text(&diff))
    }

    /// Apply a previously saved step patch during hard-reset replay.
    pub async fn apply_patch(
        &self,
        repo_dir: &Path,
        patch_path: &Path,
        log: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let apply = self.git(
            &[
                "apply",
                "--allow-empty",
                "--whitespace=nowarn",
                &patch_path.to_string_lossy(),
            ],
            repo_dir,
            log,
            env,
        );
        self.runner.run(&apply, cancel, None).await?;
        Ok(())
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }
}
