//! Stage executor: prepare → execute → publish.
//!
//! Each stage emits paired queue events (`started` then `finished` or
//! `failed`), stages its artifacts, and leaves the workspace in a state the
//! next stage can rely on. Execute drives the runtime adapters (or docker)
//! through the subprocess runner with self-heal between failed attempts;
//! publish turns surviving changes into a branch or PR.

use crate::container::ContainerExecutor;
use crate::heal::{HealDriver, HealError};
use crate::process::{ChunkCallback, CommandError, CommandRunner, CommandSpec, StreamKind};
use crate::queue::QueueClient;
use crate::runtime::RuntimeAdapters;
use crate::skills::{MaterializedSkill, SkillCatalog, SkillError};
use crate::vault::VaultResolver;
use crate::workspace::{BranchPlan, JobPaths, WorkspaceError, WorkspaceManager};
use crate::metrics::WorkerMetrics;
use moonmind_core::artifacts::{
    step_log_name, step_patch_name, ArtifactUpload, CHANGES_PATCH, CONTENT_TYPE_DIFF,
    CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT, EXECUTE_LOG, PREPARE_LOG, PUBLISH_LOG, PUBLISH_RESULT,
    TASK_CONTEXT,
};
use moonmind_core::config::WorkerConfig;
use moonmind_core::contract::{CanonicalTask, TaskStep};
use moonmind_core::events::{
    BranchResolvedPayload, PublishResult, Stage, StageStatus, StepEventPayload,
    CONTAINER_FINISHED, CONTAINER_STARTED, DEFAULT_BRANCH_RESOLVED, STEP_FAILED, STEP_FINISHED,
    STEP_IDLE_TIMEOUT, STEP_STARTED, STEP_WALL_TIMEOUT,
};
use moonmind_core::selfheal::{
    build_failure_signature, classify_command_failure, select_strategy, FailureClass,
    HealStrategy, JobHealState, StepAttemptState,
};
use moonmind_core::types::{EventLevel, ExecutionMeta, PublishMode, RuntimeKind, WorkdirMode};
use moonmind_core::SecretRedactor;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("command cancelled")]
    Cancelled,
    #[error("{purpose} auth resolution failed: {detail}")]
    Auth { purpose: String, detail: String },
    #[error("skill materialization failed: {0}")]
    Skill(#[from] SkillError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Replay(HealError),
    #[error("workspace io error: {0}")]
    Io(String),
}

impl StageError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
            | matches!(self, Self::Command(CommandError::Cancelled))
            | matches!(
                self,
                Self::Workspace(WorkspaceError::Command(CommandError::Cancelled))
            )
    }
}

pub type Result<T> = std::result::Result<T, StageError>;

/// Immutable product of the prepare stage.
#[derive(Debug, Clone)]
pub struct PreparedWorkspace {
    pub paths: JobPaths,
    pub branches: BranchPlan,
    pub workdir_mode: WorkdirMode,
    pub repo_env: BTreeMap<String, String>,
    pub publish_env: BTreeMap<String, String>,
    pub repo_auth_source: String,
    pub publish_auth_source: Option<String>,
    pub materialized_skills: Vec<MaterializedSkill>,
}

/// Result of the execute stage.
#[derive(Debug)]
pub struct ExecuteOutcome {
    pub succeeded: bool,
    pub summary: Option<String>,
    pub error_message: Option<String>,
    pub retryable: bool,
    pub artifacts: Vec<ArtifactUpload>,
}

impl ExecuteOutcome {
    fn success(summary: &str, artifacts: Vec<ArtifactUpload>) -> Self {
        Self {
            succeeded: true,
            summary: Some(summary.to_string()),
            error_message: None,
            retryable: false,
            artifacts,
        }
    }

    fn failure(message: &str, retryable: bool, artifacts: Vec<ArtifactUpload>) -> Self {
        Self {
            succeeded: false,
            summary: None,
            error_message: Some(message.to_string()),
            retryable,
            artifacts,
        }
    }
}

/// Runs the three job stages against one prepared workspace.
pub struct StageExecutor {
    config: Arc<WorkerConfig>,
    queue: QueueClient,
    runner: CommandRunner,
    workspace: WorkspaceManager,
    containers: ContainerExecutor,
    adapters: RuntimeAdapters,
    heal: HealDriver,
    skills: SkillCatalog,
    metrics: Arc<WorkerMetrics>,
    redactor: Arc<SecretRedactor>,
    vault: Option<Arc<VaultResolver>>,
}

impl StageExecutor {
    pub fn new(
        config: Arc<WorkerConfig>,
        queue: QueueClient,
        redactor: Arc<SecretRedactor>,
        metrics: Arc<WorkerMetrics>,
        vault: Option<Arc<VaultResolver>>,
    ) -> Self {
        let runner = CommandRunner::new(Arc::clone(&redactor), config.sigkill_grace);
        let workspace = WorkspaceManager::new(runner.clone());
        let containers = ContainerExecutor::new(
            &config.docker_binary,
            config.container_workspace_volume.as_deref(),
            config.container_timeout_seconds,
            runner.clone(),
        );
        let adapters = RuntimeAdapters::from_config(&config);
        let heal = HealDriver::new(workspace.clone());
        let skills = SkillCatalog::new(&config.skills_dir);
        Self {
            config,
            queue,
            runner,
            workspace,
            containers,
            adapters,
            heal,
            skills,
            metrics,
            redactor,
            vault,
        }
    }

    // --- Event plumbing ---

    /// Best-effort event emission; never blocks or fails the caller.
    async fn emit_event(
        &self,
        job_id: Uuid,
        level: EventLevel,
        message: &str,
        payload: Option<Value>,
    ) {
        let message = self.redactor.scrub(message);
        let payload = payload.map(|value| self.redactor.scrub_value(&value));
        if let Err(error) = self
            .queue
            .append_event(job_id, &self.config.worker_id, level, &message, payload.as_ref())
            .await
        {
            debug!(%error, "event emission failed");
        }
    }

    async fn emit_stage_event(
        &self,
        job_id: Uuid,
        stage: Stage,
        status: StageStatus,
        job_type: &str,
        meta: &ExecutionMeta,
        extra: Value,
    ) {
        let mut payload = json!({
            "stage": stage.event_name(),
            "status": status.as_str(),
            "jobType": job_type,
        });
        merge(&mut payload, &serde_json::to_value(meta).unwrap_or(Value::Null));
        merge(&mut payload, &extra);
        self.emit_event(job_id, status.level(), stage.event_name(), Some(payload))
            .await;
    }

    fn append_stage_log(&self, log_path: &std::path::Path, line: &str) {
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let timestamp = chrono::Utc::now().to_rfc3339();
        let rendered = format!("[{timestamp}] {}\n", self.redactor.scrub(line));
        if let Err(error) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .and_then(|mut file| std::io::Write::write_all(&mut file, rendered.as_bytes()))
        {
            warn!(%error, path = %log_path.display(), "stage log append failed");
        }
    }

    // --- Auth / command environments ---

    /// Minimal command env: PATH/HOME/LANG plus git identity and the token
    /// exposed only as GITHUB_TOKEN / GH_TOKEN.
    fn build_command_env(&self, home: &std::path::Path, token: Option<&str>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()),
        );
        env.insert("HOME".to_string(), home.to_string_lossy().into_owned());
        env.insert(
            "LANG".to_string(),
            std::env::var("LANG").unwrap_or_else(|_| "C.UTF-8".to_string()),
        );
        env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
        env.insert(
            "GIT_AUTHOR_NAME".to_string(),
            self.config.git_user_name.clone(),
        );
        env.insert(
            "GIT_AUTHOR_EMAIL".to_string(),
            self.config.git_user_email.clone(),
        );
        env.insert(
            "GIT_COMMITTER_NAME".to_string(),
            self.config.git_user_name.clone(),
        );
        env.insert(
            "GIT_COMMITTER_EMAIL".to_string(),
            self.config.git_user_email.clone(),
        );
        if let Some(token) = token {
            env.insert("GITHUB_TOKEN".to_string(), token.to_string());
            env.insert("GH_TOKEN".to_string(), token.to_string());
        }
        env
    }

    /// Resolve one auth reference: Vault first, env fallback, else none.
    async fn resolve_token(
        &self,
        auth_ref: Option<&str>,
        purpose: &str,
    ) -> Result<(Option<String>, String)> {
        if let Some(reference) = auth_ref {
            let Some(vault) = &self.vault else {
                return Err(StageError::Auth {
                    purpose: purpose.to_string(),
                    detail: "auth ref was provided but Vault resolver is not configured"
                        .to_string(),
                });
            };
            let resolved = vault.resolve_github_auth(reference).await.map_err(|e| {
                StageError::Auth {
                    purpose: purpose.to_string(),
                    detail: e.to_string(),
                }
            })?;
            self.redactor.register(&resolved.token);
            return Ok((Some(resolved.token), format!("vault:{}", resolved.source_ref)));
        }

        match std::env::var("GITHUB_TOKEN") {
            Ok(token) if !token.trim().is_empty() => {
                let token = token.trim().to_string();
                self.redactor.register(&token);
                Ok((Some(token), "env:GITHUB_TOKEN".to_string()))
            }
            _ => Ok((None, "none".to_string())),
        }
    }

    // --- Prepare ---

    pub async fn prepare(
        &self,
        job_id: Uuid,
        job_type: &str,
        task: &CanonicalTask,
        meta: &ExecutionMeta,
        cancel: &CancellationToken,
    ) -> Result<PreparedWorkspace> {
        self.emit_stage_event(
            job_id,
            Stage::Prepare,
            StageStatus::Started,
            job_type,
            meta,
            Value::Null,
        )
        .await;

        match self.prepare_inner(job_id, task, meta, cancel).await {
            Ok(prepared) => {
                self.emit_stage_event(
                    job_id,
                    Stage::Prepare,
                    StageStatus::Finished,
                    job_type,
                    meta,
                    json!({
                        "defaultBranch": prepared.branches.default_branch,
                        "startingBranch": prepared.branches.starting_branch,
                        "newBranch": prepared.branches.new_branch,
                        "workingBranch": prepared.branches.working_branch,
                    }),
                )
                .await;
                Ok(prepared)
            }
            Err(error) => {
                self.emit_stage_event(
                    job_id,
                    Stage::Prepare,
                    StageStatus::Failed,
                    job_type,
                    meta,
                    json!({"error": error.to_string()}),
                )
                .await;
                Err(error)
            }
        }
    }

    async fn prepare_inner(
        &self,
        job_id: Uuid,
        task: &CanonicalTask,
        meta: &ExecutionMeta,
        cancel: &CancellationToken,
    ) -> Result<PreparedWorkspace> {
        let paths = JobPaths::new(&self.config.workdir, job_id);
        paths
            .create_dirs()
            .map_err(|e| StageError::Io(e.to_string()))?;

        // Materialize every non-auto skill named by the task or its steps.
        let mut materialized = Vec::new();
        let mut wanted: Vec<&str> = Vec::new();
        if !task.skill.is_auto() {
            wanted.push(task.skill.id.as_str());
        }
        for step in &task.steps {
            if !step.skill.is_auto() && !wanted.contains(&step.skill.id.as_str()) {
                wanted.push(step.skill.id.as_str());
            }
        }
        if wanted.is_empty() {
            if let Err(error) = self.skills.link_shared(&paths.skills_active_dir) {
                self.append_stage_log(
                    &paths.prepare_log,
                    &format!("skill-link setup warning: {error}"),
                );
            }
        } else {
            for id in wanted {
                let skill = self.skills.materialize(id, &paths.job_root)?;
                self.append_stage_log(
                    &paths.prepare_log,
                    &format!("materialized skill workspace: {id}"),
                );
                materialized.push(skill);
            }
        }

        let (repo_token, repo_source) = self
            .resolve_token(task.auth.repo_auth_ref.as_deref(), "repository")
            .await?;
        self.append_stage_log(&paths.prepare_log, &format!("repo auth source: {repo_source}"));

        let repo_env = self.build_command_env(&paths.home_dir, repo_token.as_deref());

        let (publish_env, publish_source) = if task.publish.mode == PublishMode::None {
            (repo_env.clone(), None)
        } else {
            let reference = task
                .auth
                .publish_auth_ref
                .as_deref()
                .or(task.auth.repo_auth_ref.as_deref());
            let (publish_token, source) = self.resolve_token(reference, "publish").await?;
            self.append_stage_log(&paths.prepare_log, &format!("publish auth source: {source}"));
            match publish_token {
                Some(token) => (
                    self.build_command_env(&paths.home_dir, Some(&token)),
                    Some(source),
                ),
                None => (repo_env.clone(), Some(repo_source.clone())),
            }
        };

        self.workspace
            .prepare_repository(&paths, &task.repository, task.workdir_mode, &repo_env, cancel)
            .await?;

        let default_branch = self
            .workspace
            .resolve_default_branch(&paths.repo_dir, &paths.prepare_log, &repo_env, cancel)
            .await?;
        let skill_suffix = if task.skill.is_auto() {
            None
        } else {
            Some(task.skill.id.as_str())
        };
        let branches = WorkspaceManager::plan_branches(
            job_id,
            &default_branch,
            task.git.starting_branch.as_deref(),
            task.git.new_branch.as_deref(),
            skill_suffix,
        );
        self.workspace
            .ensure_working_branch(&paths.repo_dir, &branches, &paths.prepare_log, &repo_env, cancel)
            .await?;

        self.write_task_context(task, meta, &paths, &branches, &repo_source, publish_source.as_deref(), &materialized)?;

        self.emit_event(
            job_id,
            EventLevel::Info,
            DEFAULT_BRANCH_RESOLVED,
            Some(
                serde_json::to_value(BranchResolvedPayload {
                    default_branch: branches.default_branch.clone(),
                    starting_branch: branches.starting_branch.clone(),
                    new_branch: branches.new_branch.clone(),
                    working_branch: branches.working_branch.clone(),
                })
                .unwrap_or(Value::Null),
            ),
        )
        .await;

        Ok(PreparedWorkspace {
            paths,
            branches,
            workdir_mode: task.workdir_mode,
            repo_env,
            publish_env,
            repo_auth_source: repo_source,
            publish_auth_source: publish_source,
            materialized_skills: materialized,
        })
    }

    /// Write the redacted prepare snapshot, once.
    fn write_task_context(
        &self,
        task: &CanonicalTask,
        meta: &ExecutionMeta,
        paths: &JobPaths,
        branches: &BranchPlan,
        repo_source: &str,
        publish_source: Option<&str>,
        materialized: &[MaterializedSkill],
    ) -> Result<()> {
        let mut context = json!({
            "repository": task.repository,
            "runtime": task.target_runtime.as_str(),
            "skill": {
                "id": meta.selected_skill,
                "args": Value::Object(task.skill.args.clone()),
            },
            "workdirMode": task.workdir_mode.as_str(),
            "publishMode": task.publish.mode.as_str(),
            "auth": {
                "repoAuthRef": task.auth.repo_auth_ref,
                "publishAuthRef": task.auth.publish_auth_ref,
                "repoAuthSource": repo_source,
                "publishAuthSource": publish_source,
            },
            "resolved": {
                "defaultBranch": branches.default_branch,
                "startingBranch": branches.starting_branch,
                "newBranch": branches.new_branch,
                "workingBranch": branches.working_branch,
            },
            "workspace": {
                "jobRoot": paths.job_root.to_string_lossy(),
                "repo": paths.repo_dir.to_string_lossy(),
                "home": paths.home_dir.to_string_lossy(),
                "skillsActive": paths.skills_active_dir.to_string_lossy(),
                "artifacts": paths.artifacts_dir.to_string_lossy(),
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if !materialized.is_empty() {
            context["skillsMaterialized"] =
                serde_json::to_value(materialized).unwrap_or(Value::Null);
        }
        let redacted = self.redactor.scrub_value(&context);
        let rendered = serde_json::to_string_pretty(&redacted)
            .map_err(|e| StageError::Io(e.to_string()))?;
        std::fs::write(&paths.task_context_path, format!("{rendered}\n"))
            .map_err(|e| StageError::Io(e.to_string()))
    }

    pub fn prepare_artifacts(&self, prepared: &PreparedWorkspace) -> Vec<ArtifactUpload> {
        vec![
            ArtifactUpload::new(&prepared.paths.prepare_log, PREPARE_LOG, CONTENT_TYPE_TEXT),
            ArtifactUpload::new(
                &prepared.paths.task_context_path,
                TASK_CONTEXT,
                CONTENT_TYPE_JSON,
            ),
        ]
    }

    // --- Execute ---

    pub async fn execute(
        &self,
        job_id: Uuid,
        job_type: &str,
        task: &CanonicalTask,
        meta: &ExecutionMeta,
        prepared: &PreparedWorkspace,
        cancel: &CancellationToken,
    ) -> Result<ExecuteOutcome> {
        self.emit_stage_event(
            job_id,
            Stage::Execute,
            StageStatus::Started,
            job_type,
            meta,
            Value::Null,
        )
        .await;

        let result = if task.container.is_some() {
            self.execute_container(job_id, task, prepared, cancel).await
        } else {
            self.execute_agent(job_id, task, prepared, cancel).await
        };

        match &result {
            Ok(outcome) => {
                let status = if outcome.succeeded {
                    StageStatus::Finished
                } else {
                    StageStatus::Failed
                };
                self.emit_stage_event(
                    job_id,
                    Stage::Execute,
                    status,
                    job_type,
                    meta,
                    json!({
                        "summary": outcome.summary,
                        "error": outcome.error_message,
                    }),
                )
                .await;
            }
            Err(error) if !error.is_cancelled() => {
                self.emit_stage_event(
                    job_id,
                    Stage::Execute,
                    StageStatus::Failed,
                    job_type,
                    meta,
                    json!({"error": error.to_string()}),
                )
                .await;
            }
            Err(_) => {}
        }
        result
    }

    async fn execute_container(
        &self,
        job_id: Uuid,
        task: &CanonicalTask,
        prepared: &PreparedWorkspace,
        cancel: &CancellationToken,
    ) -> Result<ExecuteOutcome> {
        let Some(spec) = task.container.as_ref() else {
            return Err(StageError::Io(
                "container execution requested without a container spec".to_string(),
            ));
        };

        self.emit_event(
            job_id,
            EventLevel::Info,
            CONTAINER_STARTED,
            Some(json!({
                "image": spec.image,
                "pullMode": spec.pull.as_str(),
                "timeoutSeconds": spec.timeout_seconds,
            })),
        )
        .await;

        let outcome = self
            .containers
            .execute(
                job_id,
                &task.repository,
                &self.config.workdir,
                &prepared.paths,
                spec,
                &prepared.repo_env,
                cancel,
            )
            .await
            .map_err(|e| match e {
                crate::container::ContainerError::Command(CommandError::Cancelled) => {
                    StageError::Cancelled
                }
                other => StageError::Io(other.to_string()),
            })?;

        self.emit_event(
            job_id,
            if outcome.succeeded {
                EventLevel::Info
            } else {
                EventLevel::Error
            },
            CONTAINER_FINISHED,
            Some(json!({
                "containerName": ContainerExecutor::container_name(job_id),
                "image": spec.image,
                "timedOut": outcome.timed_out,
                "exitCode": outcome.exit_code,
                "artifactsSubdir": spec.artifacts_subdir,
            })),
        )
        .await;

        let artifacts = vec![
            ArtifactUpload::new(&prepared.paths.execute_log, EXECUTE_LOG, CONTENT_TYPE_TEXT),
            outcome.record_artifact.clone(),
        ];

        if outcome.succeeded {
            Ok(ExecuteOutcome::success(
                "container task execution completed",
                artifacts,
            ))
        } else {
            let message = outcome
                .error
                .unwrap_or_else(|| "container command failed".to_string());
            // Timeouts are transient from the queue's perspective.
            Ok(ExecuteOutcome::failure(&message, outcome.timed_out, artifacts))
        }
    }

    /// Compose the instruction handed to the runtime CLI.
    ///
    /// Non-auto skills get their identity and arguments prepended so the
    /// agent executes with the skill's semantics.
    fn compose_instruction(task: &CanonicalTask, step: &TaskStep, runtime: RuntimeKind) -> String {
        if step.skill.is_auto() {
            return step.instructions.clone();
        }
        let args = serde_json::to_string_pretty(&Value::Object(step.skill.args.clone()))
            .unwrap_or_else(|_| "{}".to_string());
        format!(
            "Selected skill: {}\nRuntime adapter: {}\nSkill arguments:\n{}\n\nExecute the user task with the selected skill semantics:\n{}",
            step.skill.id,
            runtime.as_str(),
            args,
            step.instructions,
        )
    }

    fn synthetic_step(task: &CanonicalTask) -> TaskStep {
        TaskStep {
            id: "task".to_string(),
            instructions: task.instructions.clone(),
            skill: task.skill.clone(),
            runtime: task.runtime.clone(),
        }
    }

    async fn execute_agent(
        &self,
        job_id: Uuid,
        task: &CanonicalTask,
        prepared: &PreparedWorkspace,
        cancel: &CancellationToken,
    ) -> Result<ExecuteOutcome> {
        let multi_step = !task.steps.is_empty();
        let steps: Vec<TaskStep> = if multi_step {
            task.steps.clone()
        } else {
            vec![Self::synthetic_step(task)]
        };

        let mut job_heal = JobHealState::default();
        let mut artifacts: Vec<ArtifactUpload> = Vec::new();
        let mut successful_patches: Vec<PathBuf> = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            let step_number = index + 1;
            let log_path = if multi_step {
                prepared
                    .paths
                    .artifacts_dir
                    .join(step_log_name(step_number))
            } else {
                prepared.paths.execute_log.clone()
            };

            let step_result = self
                .run_step_with_heal(
                    job_id,
                    task,
                    prepared,
                    step,
                    index,
                    multi_step,
                    &log_path,
                    &mut job_heal,
                    &successful_patches,
                    cancel,
                )
                .await?;

            if multi_step {
                artifacts.push(ArtifactUpload::new(
                    &log_path,
                    step_log_name(step_number),
                    CONTENT_TYPE_TEXT,
                ));
            }

            match step_result {
                StepLoopOutcome::Succeeded => {
                    if multi_step {
                        let patch_path = prepared
                            .paths
                            .artifacts_dir
                            .join(step_patch_name(step_number));
                        // Intent-to-add makes this step's new files diffable.
                        self.workspace
                            .register_untracked(
                                &prepared.paths.repo_dir,
                                &log_path,
                                &prepared.repo_env,
                                cancel,
                            )
                            .await?;
                        let patch = self
                            .workspace
                            .diff(&prepared.paths.repo_dir, &log_path, &prepared.repo_env, cancel)
                            .await?;
                        if let Some(parent) = patch_path.parent() {
                            std::fs::create_dir_all(parent)
                                .map_err(|e| StageError::Io(e.to_string()))?;
                        }
                        std::fs::write(&patch_path, &patch)
                            .map_err(|e| StageError::Io(e.to_string()))?;
                        artifacts.push(ArtifactUpload::new(
                            &patch_path,
                            step_patch_name(step_number),
                            CONTENT_TYPE_DIFF,
                        ));
                        successful_patches.push(patch_path);
                        // Absorb this step's delta so the next step's diff is
                        // its own.
                        self.workspace
                            .stage_all(&prepared.paths.repo_dir, &log_path, &prepared.repo_env, cancel)
                            .await?;
                    }
                }
                StepLoopOutcome::Failed { message, retryable } => {
                    // Fail fast: later steps never start.
                    artifacts.push(ArtifactUpload::new(
                        &prepared.paths.execute_log,
                        EXECUTE_LOG,
                        CONTENT_TYPE_TEXT,
                    ));
                    return Ok(ExecuteOutcome::failure(&message, retryable, artifacts));
                }
            }
        }

        // Cumulative patch of everything the agent changed.
        self.workspace
            .register_untracked(
                &prepared.paths.repo_dir,
                &prepared.paths.execute_log,
                &prepared.repo_env,
                cancel,
            )
            .await?;
        let patch = self
            .workspace
            .diff_head(
                &prepared.paths.repo_dir,
                &prepared.paths.execute_log,
                &prepared.repo_env,
                cancel,
            )
            .await?;
        let patch_path = prepared.paths.artifacts_dir.join("patches/changes.patch");
        if let Some(parent) = patch_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StageError::Io(e.to_string()))?;
        }
        std::fs::write(&patch_path, &patch).map_err(|e| StageError::Io(e.to_string()))?;

        artifacts.push(ArtifactUpload::new(
            &prepared.paths.execute_log,
            EXECUTE_LOG,
            CONTENT_TYPE_TEXT,
        ));
        artifacts.push(ArtifactUpload::new(&patch_path, CHANGES_PATCH, CONTENT_TYPE_DIFF));

        let summary = format!("{} task execution completed", task.target_runtime.as_str());
        Ok(ExecuteOutcome::success(&summary, artifacts))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step_with_heal(
        &self,
        job_id: Uuid,
        task: &CanonicalTask,
        prepared: &PreparedWorkspace,
        step: &TaskStep,
        step_index: usize,
        multi_step: bool,
        log_path: &std::path::Path,
        job_heal: &mut JobHealState,
        successful_patches: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<StepLoopOutcome> {
        let heal_config = &self.config.heal;
        let mut state = StepAttemptState::new(&step.id, step_index);
        let skill_id = if step.skill.is_auto() {
            None
        } else {
            Some(step.skill.id.as_str())
        };

        let (model, effort) = self.adapters.resolve_overrides(
            task.target_runtime,
            &task.runtime,
            if multi_step { Some(&step.runtime) } else { None },
        );
        let instruction = Self::compose_instruction(task, step, task.target_runtime);
        let command = self.adapters.build_command(
            task.target_runtime,
            &instruction,
            model.as_deref(),
            effort.as_deref(),
        );

        let mut env = prepared.repo_env.clone();
        self.adapters.adjust_env(task.target_runtime, &mut env);

        loop {
            let attempt = match state.next_attempt(heal_config.step_max_attempts) {
                Ok(attempt) => attempt,
                Err(error) => {
                    self.metrics
                        .record_self_heal_exhausted(step_index, state.attempts);
                    return Ok(StepLoopOutcome::Failed {
                        message: error.to_string(),
                        retryable: false,
                    });
                }
            };

            if multi_step {
                self.emit_event(
                    job_id,
                    EventLevel::Info,
                    STEP_STARTED,
                    Some(step_payload(&step.id, step_index, attempt, None, None)),
                )
                .await;
            }

            let spec = CommandSpec {
                command: command.clone(),
                cwd: prepared.paths.repo_dir.clone(),
                env: env.clone(),
                log_path: log_path.to_path_buf(),
                wall_timeout: Some(std::time::Duration::from_secs(
                    heal_config.step_timeout_seconds,
                )),
                idle_timeout: Some(std::time::Duration::from_secs(
                    heal_config.step_idle_timeout_seconds,
                )),
                check: true,
            };

            let live = self.live_output_sink(job_id, &step.id, step_index);
            let started = std::time::Instant::now();
            let run_result = self.runner.run(&spec, cancel, Some(live)).await;
            self.metrics.record_step_duration(
                step_index,
                attempt,
                started.elapsed().as_secs_f64(),
            );

            let (failure_hint, exit_code, message) = match run_result {
                Ok(_) => {
                    state.reset_after_success();
                    if attempt > 1 {
                        self.metrics.record_self_heal_recovered(step_index, attempt);
                    }
                    if multi_step {
                        self.emit_event(
                            job_id,
                            EventLevel::Info,
                            STEP_FINISHED,
                            Some(step_payload(&step.id, step_index, attempt, Some(0), None)),
                        )
                        .await;
                    }
                    return Ok(StepLoopOutcome::Succeeded);
                }
                Err(CommandError::Cancelled) => return Err(StageError::Cancelled),
                Err(CommandError::WallTimeout(seconds)) => {
                    self.metrics.record_wall_timeout(step_index, attempt);
                    self.emit_event(
                        job_id,
                        EventLevel::Warn,
                        STEP_WALL_TIMEOUT,
                        Some(step_payload(&step.id, step_index, attempt, None, None)),
                    )
                    .await;
                    (
                        "wall_timeout",
                        None,
                        format!("step exceeded wall-clock timeout after {seconds} seconds"),
                    )
                }
                Err(CommandError::IdleTimeout(seconds)) => {
                    self.metrics.record_idle_timeout(step_index, attempt);
                    self.emit_event(
                        job_id,
                        EventLevel::Warn,
                        STEP_IDLE_TIMEOUT,
                        Some(step_payload(&step.id, step_index, attempt, None, None)),
                    )
                    .await;
                    (
                        "idle_timeout",
                        None,
                        format!("step produced no output for {seconds} seconds"),
                    )
                }
                Err(CommandError::Failed {
                    exit_code,
                    stderr_tail,
                    ..
                }) => (
                    "command_failed",
                    Some(exit_code),
                    format!("command failed ({exit_code}){stderr_tail}"),
                ),
                Err(other) => ("runtime_error", None, other.to_string()),
            };

            if multi_step {
                self.emit_event(
                    job_id,
                    EventLevel::Error,
                    STEP_FAILED,
                    Some(step_payload(
                        &step.id,
                        step_index,
                        attempt,
                        exit_code,
                        Some(&message),
                    )),
                )
                .await;
            }

            // Fingerprint the failure for no-progress detection.
            let signature = build_failure_signature(
                &self.redactor,
                Some(&step.id),
                skill_id,
                exit_code,
                Some(failure_hint),
                Some(&message),
            );
            let diff_hash = self
                .workspace
                .diff_hash(&prepared.paths.repo_dir, log_path, &prepared.repo_env, cancel)
                .await
                .ok();
            let matched = state.record_failure(signature, diff_hash);
            if matched {
                self.metrics.record_no_progress(step_index, attempt);
            }

            let mut class = classify_command_failure(&message);
            if state.consecutive_no_progress >= heal_config.step_no_progress_limit {
                class = FailureClass::StuckNoProgress;
            }

            let strategy = select_strategy(class, &state, job_heal, heal_config);
            self.metrics
                .record_self_heal_attempt(step_index, attempt, strategy.as_str());

            match strategy {
                HealStrategy::SoftReset => {
                    self.heal
                        .soft_reset(&prepared.paths, &prepared.repo_env, cancel)
                        .await
                        .map_err(|e| StageError::Io(e.to_string()))?;
                    self.restore_completed_steps(prepared, successful_patches, log_path, cancel)
                        .await?;
                }
                HealStrategy::HardReset => {
                    if job_heal
                        .reserve_hard_reset(heal_config.job_max_resets)
                        .is_err()
                    {
                        self.metrics.record_self_heal_exhausted(step_index, attempt);
                        return Ok(StepLoopOutcome::Failed {
                            message,
                            retryable: true,
                        });
                    }
                    self.heal
                        .hard_reset_replay(
                            &task.repository,
                            &prepared.paths,
                            &prepared.branches,
                            &prepared.repo_env,
                            successful_patches,
                            cancel,
                        )
                        .await
                        .map_err(StageError::Replay)?;
                    self.restage_after_replay(prepared, log_path, cancel).await?;
                }
                HealStrategy::QueueRetry => {
                    self.metrics.record_self_heal_exhausted(step_index, attempt);
                    return Ok(StepLoopOutcome::Failed {
                        message,
                        retryable: true,
                    });
                }
                HealStrategy::OperatorRequest | HealStrategy::None => {
                    self.metrics.record_self_heal_exhausted(step_index, attempt);
                    return Ok(StepLoopOutcome::Failed {
                        message,
                        retryable: false,
                    });
                }
            }
        }
    }

    /// Re-apply completed-step patches after an in-place reset.
    async fn restore_completed_steps(
        &self,
        prepared: &PreparedWorkspace,
        patches: &[PathBuf],
        log_path: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for patch in patches {
            let replayable = std::fs::metadata(patch)
                .map(|meta| meta.len() > 0)
                .unwrap_or(false);
            if replayable {
                self.workspace
                    .apply_patch(&prepared.paths.repo_dir, patch, log_path, &prepared.repo_env, cancel)
                    .await?;
            }
        }
        if !patches.is_empty() {
            self.workspace
                .stage_all(&prepared.paths.repo_dir, log_path, &prepared.repo_env, cancel)
                .await?;
        }
        Ok(())
    }

    async fn restage_after_replay(
        &self,
        prepared: &PreparedWorkspace,
        log_path: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.workspace
            .stage_all(&prepared.paths.repo_dir, log_path, &prepared.repo_env, cancel)
            .await?;
        Ok(())
    }

    /// Forward scrubbed output chunks to the control plane, best-effort.
    fn live_output_sink(
        &self,
        job_id: Uuid,
        step_id: &str,
        step_index: usize,
    ) -> Arc<ChunkCallback> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(StreamKind, String)>();
        let queue = self.queue.clone();
        let worker_id = self.config.worker_id.clone();
        let step_id = step_id.to_string();
        tokio::spawn(async move {
            while let Some((stream, chunk)) = rx.recv().await {
                let payload = json!({
                    "stepId": step_id,
                    "stepIndex": step_index,
                    "stream": stream.as_str(),
                    "chunk": chunk,
                });
                if queue
                    .append_event(job_id, &worker_id, EventLevel::Info, "task.step.output", Some(&payload))
                    .await
                    .is_err()
                {
                    // Live log loss is acceptable; the stage log artifact is
                    // the durable copy.
                    break;
                }
            }
        });
        Arc::new(move |stream: StreamKind, chunk: &str| {
            let _ = tx.send((stream, chunk.to_string()));
        })
    }

    // --- Publish ---

    pub async fn publish(
        &self,
        job_id: Uuid,
        job_type: &str,
        task: &CanonicalTask,
        meta: &ExecutionMeta,
        prepared: &PreparedWorkspace,
        artifacts: &mut Vec<ArtifactUpload>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let mode = task.publish.mode;
        if mode == PublishMode::None {
            let result = PublishResult::skipped(
                mode.as_str(),
                &prepared.branches.working_branch,
                "publish mode is none",
            );
            self.write_publish_result(prepared, &result)?;
            artifacts.push(ArtifactUpload::new(
                &prepared.paths.publish_result_path,
                PUBLISH_RESULT,
                CONTENT_TYPE_JSON,
            ));
            self.emit_stage_event(
                job_id,
                Stage::Publish,
                StageStatus::Skipped,
                job_type,
                meta,
                json!({"reason": "publish mode is none"}),
            )
            .await;
            return Ok(None);
        }

        self.emit_stage_event(
            job_id,
            Stage::Publish,
            StageStatus::Started,
            job_type,
            meta,
            json!({"mode": mode.as_str()}),
        )
        .await;

        match self
            .publish_inner(job_id, task, prepared, artifacts, cancel)
            .await
        {
            Ok((note, payload)) => {
                self.emit_stage_event(
                    job_id,
                    Stage::Publish,
                    StageStatus::Finished,
                    job_type,
                    meta,
                    payload,
                )
                .await;
                Ok(note)
            }
            Err(error) => {
                if !error.is_cancelled() {
                    self.emit_stage_event(
                        job_id,
                        Stage::Publish,
                        StageStatus::Failed,
                        job_type,
                        meta,
                        json!({"error": error.to_string()}),
                    )
                    .await;
                }
                Err(error)
            }
        }
    }

    async fn publish_inner(
        &self,
        job_id: Uuid,
        task: &CanonicalTask,
        prepared: &PreparedWorkspace,
        artifacts: &mut Vec<ArtifactUpload>,
        cancel: &CancellationToken,
    ) -> Result<(Option<String>, Value)> {
        let mode = task.publish.mode;
        let paths = &prepared.paths;
        let env = &prepared.publish_env;
        self.append_stage_log(&paths.publish_log, &format!("publish mode: {}", mode.as_str()));
        self.append_stage_log(
            &paths.publish_log,
            &format!("working branch: {}", prepared.branches.working_branch),
        );

        let status = self
            .workspace
            .status_porcelain(&paths.repo_dir, &paths.publish_log, env, cancel)
            .await?;
        if status.trim().is_empty() {
            let result = PublishResult::skipped(
                mode.as_str(),
                &prepared.branches.working_branch,
                "no local changes",
            );
            self.write_publish_result(prepared, &result)?;
            artifacts.push(ArtifactUpload::new(
                &paths.publish_log,
                PUBLISH_LOG,
                CONTENT_TYPE_TEXT,
            ));
            artifacts.push(ArtifactUpload::new(
                &paths.publish_result_path,
                PUBLISH_RESULT,
                CONTENT_TYPE_JSON,
            ));
            return Ok((
                Some("publish skipped: no local changes".to_string()),
                json!({"skipped": true, "reason": "no local changes"}),
            ));
        }

        let working_branch = prepared.branches.working_branch.clone();
        for args in [
            vec!["checkout".to_string(), working_branch.clone()],
            vec!["add".to_string(), "-A".to_string()],
        ] {
            let mut command = vec!["git".to_string()];
            command.extend(args);
            let spec = CommandSpec::new(command, &paths.repo_dir, &paths.publish_log)
                .with_env(env.clone());
            self.runner.run(&spec, cancel, None).await?;
        }

        let commit_message = task
            .publish
            .commit_message
            .clone()
            .unwrap_or_else(|| format!("MoonMind task result for job {job_id}"));
        let commit = CommandSpec::new(
            vec![
                "git".to_string(),
                "commit".to_string(),
                "-m".to_string(),
                commit_message,
            ],
            &paths.repo_dir,
            &paths.publish_log,
        )
        .with_env(env.clone());
        self.runner.run(&commit, cancel, None).await?;

        let push = CommandSpec::new(
            vec![
                "git".to_string(),
                "push".to_string(),
                "-u".to_string(),
                "origin".to_string(),
                working_branch.clone(),
            ],
            &paths.repo_dir,
            &paths.publish_log,
        )
        .with_env(env.clone());
        self.runner.run(&push, cancel, None).await?;

        let mut pr_url: Option<String> = None;
        let mut note = format!("published branch {working_branch}");
        if mode == PublishMode::Pr {
            let base = task
                .publish
                .pr_base_branch
                .clone()
                .unwrap_or_else(|| prepared.branches.starting_branch.clone());
            let title = task
                .publish
                .pr_title
                .clone()
                .unwrap_or_else(|| format!("MoonMind task result for job {job_id}"));
            let body = task
                .publish
                .pr_body
                .clone()
                .unwrap_or_else(|| "Automated PR generated by moonmind-worker.".to_string());
            let pr = CommandSpec::new(
                vec![
                    "gh".to_string(),
                    "pr".to_string(),
                    "create".to_string(),
                    "--base".to_string(),
                    base,
                    "--head".to_string(),
                    working_branch.clone(),
                    "--title".to_string(),
                    title,
                    "--body".to_string(),
                    body,
                ],
                &paths.repo_dir,
                &paths.publish_log,
            )
            .with_env(env.clone());
            let output = self.runner.run(&pr, cancel, None).await?;
            pr_url = extract_pr_url(&output.stdout);
            note = match &pr_url {
                Some(url) => format!("published PR {url}"),
                None => format!("published PR from {working_branch}"),
            };
        }

        let result = PublishResult::published(
            mode.as_str(),
            &working_branch,
            &prepared.branches.starting_branch,
            pr_url.clone(),
        );
        self.write_publish_result(prepared, &result)?;
        artifacts.push(ArtifactUpload::new(
            &paths.publish_log,
            PUBLISH_LOG,
            CONTENT_TYPE_TEXT,
        ));
        artifacts.push(ArtifactUpload::new(
            &paths.publish_result_path,
            PUBLISH_RESULT,
            CONTENT_TYPE_JSON,
        ));

        Ok((
            Some(note),
            json!({
                "mode": mode.as_str(),
                "workingBranch": working_branch,
                "prUrl": pr_url,
                "skipped": false,
            }),
        ))
    }

    fn write_publish_result(
        &self,
        prepared: &PreparedWorkspace,
        result: &PublishResult,
    ) -> Result<()> {
        let value = serde_json::to_value(result).map_err(|e| StageError::Io(e.to_string()))?;
        let redacted = self.redactor.scrub_value(&value);
        let rendered = serde_json::to_string_pretty(&redacted)
            .map_err(|e| StageError::Io(e.to_string()))?;
        std::fs::write(
            &prepared.paths.publish_result_path,
            format!("{rendered}\n"),
        )
        .map_err(|e| StageError::Io(e.to_string()))
    }

}

/// Map legacy execute-log names onto the canonical artifact set.
///
/// `logs/codex_exec.log` is copied (never moved) to `logs/execute.log`.
pub fn normalize_execute_artifacts(
    artifacts: Vec<ArtifactUpload>,
    execute_log: &std::path::Path,
) -> Vec<ArtifactUpload> {
    let mut normalized = Vec::with_capacity(artifacts.len());
    let mut has_execute_log = false;
    for artifact in artifacts {
        if artifact.name == moonmind_core::artifacts::LEGACY_EXECUTE_LOG {
            if artifact.path.exists() {
                if let Some(parent) = execute_log.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if artifact.path != execute_log
                    && std::fs::copy(&artifact.path, execute_log).is_err()
                {
                    continue;
                }
                has_execute_log = true;
                normalized.push(ArtifactUpload::new(
                    execute_log,
                    EXECUTE_LOG,
                    CONTENT_TYPE_TEXT,
                ));
            }
            continue;
        }
        if artifact.name == EXECUTE_LOG {
            has_execute_log = true;
        }
        normalized.push(artifact);
    }
    if !has_execute_log && execute_log.exists() {
        normalized.push(ArtifactUpload::new(
            execute_log,
            EXECUTE_LOG,
            CONTENT_TYPE_TEXT,
        ));
    }
    normalized
}

enum StepLoopOutcome {
    Succeeded,
    Failed { message: String, retryable: bool },
}

fn step_payload(
    step_id: &str,
    step_index: usize,
    attempt: u32,
    exit_code: Option<i32>,
    error: Option<&str>,
) -> Value {
    serde_json::to_value(StepEventPayload {
        step_id: step_id.to_string(),
        step_index,
        attempt,
        exit_code,
        error: error.map(ToString::to_string),
    })
    .unwrap_or(Value::Null)
}

fn extract_pr_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("http://") || line.starts_with("https://"))
        .map(ToString::to_string)
}

fn merge(target: &mut Value, extra: &Value) {
    if let (Value::Object(target), Value::Object(extra)) = (target, extra) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonmind_core::contract::{normalize, SkillSelector};
    use serde_json::json;

    fn task_with_skill(skill: &str) -> CanonicalTask {
        let payload = json!({
            "repository": "Owner/Repo",
            "targetRuntime": "codex",
            "requiredCapabilities": ["codex", "git"],
            "task": {
                "instructions": "add readme",
                "skill": {"id": skill, "args": {"stage": "plan"}}
            }
        });
        normalize("task", &payload).unwrap()
    }

    #[test]
    fn compose_instruction_passthrough_for_auto() {
        let task = task_with_skill("auto");
        let step = StageExecutor::synthetic_step(&task);
        let instruction =
            StageExecutor::compose_instruction(&task, &step, RuntimeKind::Codex);
        assert_eq!(instruction, "add readme");
    }

    #[test]
    fn compose_instruction_wraps_skill_context() {
        let task = task_with_skill("speckit");
        let step = StageExecutor::synthetic_step(&task);
        let instruction =
            StageExecutor::compose_instruction(&task, &step, RuntimeKind::Codex);
        assert!(instruction.contains("Selected skill: speckit"));
        assert!(instruction.contains("Runtime adapter: codex"));
        assert!(instruction.contains("\"stage\": \"plan\""));
        assert!(instruction.ends_with("add readme"));
    }

    #[test]
    fn synthetic_step_mirrors_task_fields() {
        let task = task_with_skill("speckit");
        let step = StageExecutor::synthetic_step(&task);
        assert_eq!(step.id, "task");
        assert_eq!(step.instructions, task.instructions);
        assert_eq!(step.skill, task.skill);
    }

    #[test]
    fn extract_pr_url_finds_first_http_line() {
        let stdout = "Creating pull request...\n  \nhttps://github.com/o/r/pull/7\nextra";
        assert_eq!(
            extract_pr_url(stdout).as_deref(),
            Some("https://github.com/o/r/pull/7")
        );
        assert!(extract_pr_url("no links here").is_none());
    }

    #[test]
    fn merge_overlays_objects() {
        let mut target = json!({"a": 1, "keep": true});
        merge(&mut target, &json!({"a": 2, "b": 3}));
        assert_eq!(target["a"], 2);
        assert_eq!(target["b"], 3);
        assert_eq!(target["keep"], true);
    }

    #[test]
    fn step_payload_shape() {
        let payload = step_payload("build", 2, 3, Some(1), Some("boom"));
        assert_eq!(payload["stepId"], "build");
        assert_eq!(payload["stepIndex"], 2);
        assert_eq!(payload["attempt"], 3);
        assert_eq!(payload["exitCode"], 1);
        assert_eq!(payload["error"], "boom");
    }

    #[test]
    fn skill_selector_auto_detection() {
        assert!(SkillSelector::auto().is_auto());
        let task = task_with_skill("speckit");
        assert!(!task.skill.is_auto());
    }

    fn test_executor() -> StageExecutor {
        let config = Arc::new(
            WorkerConfig::from_lookup(&|key: &str| match key {
                "MOONMIND_URL" => Some("http://127.0.0.1:1".to_string()),
                _ => None,
            })
            .unwrap(),
        );
        StageExecutor::new(
            config,
            QueueClient::new("http://127.0.0.1:1", None),
            Arc::new(SecretRedactor::new(Vec::<String>::new(), "[REDACTED]")),
            Arc::new(WorkerMetrics::new()),
            None,
        )
    }

    #[test]
    fn command_env_exposes_token_only_via_github_vars() {
        let executor = test_executor();
        let env =
            executor.build_command_env(std::path::Path::new("/job/home"), Some("tok-123"));
        let token_keys: Vec<&String> = env
            .iter()
            .filter(|(_, value)| value.contains("tok-123"))
            .map(|(key, _)| key)
            .collect();
        assert_eq!(token_keys, ["GH_TOKEN", "GITHUB_TOKEN"]);
        assert_eq!(env["GIT_TERMINAL_PROMPT"], "0");
        assert_eq!(env["HOME"], "/job/home");
        assert!(env.contains_key("PATH"));
        assert!(env.contains_key("LANG"));
        assert!(env.contains_key("GIT_AUTHOR_NAME"));
        assert!(env.contains_key("GIT_COMMITTER_EMAIL"));
    }

    #[test]
    fn command_env_without_token_has_no_token_vars() {
        let executor = test_executor();
        let env = executor.build_command_env(std::path::Path::new("/job/home"), None);
        assert!(!env.contains_key("GITHUB_TOKEN"));
        assert!(!env.contains_key("GH_TOKEN"));
    }

    #[test]
    fn legacy_execute_log_is_copied_not_moved() {
        let dir = tempfile::TempDir::new().unwrap();
        let legacy = dir.path().join("codex_exec.log");
        std::fs::write(&legacy, "legacy output\n").unwrap();
        let execute_log = dir.path().join("logs/execute.log");

        let normalized = normalize_execute_artifacts(
            vec![ArtifactUpload::new(
                &legacy,
                moonmind_core::artifacts::LEGACY_EXECUTE_LOG,
                CONTENT_TYPE_TEXT,
            )],
            &execute_log,
        );

        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].name, EXECUTE_LOG);
        // The legacy file stays in place.
        assert!(legacy.exists());
        assert_eq!(
            std::fs::read_to_string(&execute_log).unwrap(),
            "legacy output\n"
        );
    }

    #[test]
    fn existing_execute_log_is_appended_when_absent_from_result() {
        let dir = tempfile::TempDir::new().unwrap();
        let execute_log = dir.path().join("logs/execute.log");
        std::fs::create_dir_all(execute_log.parent().unwrap()).unwrap();
        std::fs::write(&execute_log, "output\n").unwrap();

        let normalized = normalize_execute_artifacts(Vec::new(), &execute_log);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].name, EXECUTE_LOG);
    }
}
