//! moonmind-worker - queue worker daemon for MoonMind coding-agent tasks.
//!
//! A single worker process owns at most one claimed job at a time. Each
//! cycle claims, validates, gates on policy, runs the stage plan, uploads
//! artifacts, and issues exactly one terminal transition.

pub mod container;
pub mod heal;
pub mod metrics;
pub mod preflight;
pub mod process;
pub mod queue;
pub mod runtime;
pub mod skills;
pub mod stages;
pub mod vault;
pub mod workspace;

use crate::metrics::WorkerMetrics;
use crate::queue::{QueueClient, QueueError};
use crate::stages::{normalize_execute_artifacts, PreparedWorkspace, StageExecutor};
use crate::vault::VaultResolver;
use moonmind_core::contract::{normalize, CanonicalTask};
use moonmind_core::events::WORKER_CLAIMED;
use moonmind_core::types::{ClaimedJob, EventLevel, ExecutionMeta, SkillPolicyMode};
use moonmind_core::{ArtifactUpload, SecretRedactor, WorkerConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Type alias for application-level errors with context.
pub type AppResult<T> = eyre::Result<T>;

/// Terminal disposition of one processed job.
#[derive(Debug)]
enum JobOutcome {
    Completed { summary: Option<String> },
    Failed { message: String, retryable: bool },
    Cancelled,
}

/// The worker daemon: claim loop, policy gates, stage plan, terminal
/// transitions.
pub struct Worker {
    config: Arc<WorkerConfig>,
    queue: QueueClient,
    executor: StageExecutor,
    redactor: Arc<SecretRedactor>,
    metrics: Arc<WorkerMetrics>,
    stop: CancellationToken,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        let config = Arc::new(config);
        let redactor = Arc::new(SecretRedactor::from_env());
        let metrics = Arc::new(WorkerMetrics::new());
        let queue = QueueClient::new(&config.base_url, config.worker_token.as_deref());
        let vault = config
            .vault
            .clone()
            .map(|vault_config| Arc::new(VaultResolver::new(vault_config)));
        let executor = StageExecutor::new(
            Arc::clone(&config),
            queue.clone(),
            Arc::clone(&redactor),
            Arc::clone(&metrics),
            vault,
        );
        Self {
            config,
            queue,
            executor,
            redactor,
            metrics,
            stop: CancellationToken::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Request a clean stop of the claim loop.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Claim and process jobs until shutdown. Unhandled errors back off and
    /// never crash the daemon.
    pub async fn run_forever(&self) -> AppResult<()> {
        info!(
            worker_id = %self.config.worker_id,
            runtime = self.config.worker_runtime.as_str(),
            url = %self.queue.addr(),
            "worker started"
        );
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            let claimed = match self.run_once().await {
                Ok(claimed) => claimed,
                Err(error) => {
                    error!(%error, "unhandled worker error; backing off");
                    false
                }
            };
            if claimed {
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                () = self.stop.cancelled() => break,
            }
        }
        info!("worker stopped");
        Ok(())
    }

    /// One claim cycle. Returns false when the queue had nothing for us.
    pub async fn run_once(&self) -> AppResult<bool> {
        let job = self
            .queue
            .claim(
                &self.config.worker_id,
                self.config.lease_seconds,
                &self.config.allowed_types,
                &self.config.worker_capabilities,
                None,
            )
            .await?;
        let Some(job) = job else {
            return Ok(false);
        };

        // Local type gate, fail-closed even though claim filters server-side.
        if !self.config.allowed_types.iter().any(|t| t == &job.job_type) {
            self.emit_event(
                job.id,
                EventLevel::Error,
                "Unsupported job type",
                Some(json!({"jobType": job.job_type})),
            )
            .await;
            self.fail_job(job.id, &format!("unsupported job type: {}", job.job_type), false)
                .await;
            return Ok(true);
        }

        let task = match normalize(&job.job_type, &job.payload) {
            Ok(task) => task,
            Err(error) => {
                self.emit_event(
                    job.id,
                    EventLevel::Error,
                    "Job payload failed task-contract normalization",
                    Some(json!({"jobType": job.job_type, "error": error.to_string()})),
                )
                .await;
                self.fail_job(job.id, &format!("invalid job payload: {error}"), false)
                    .await;
                return Ok(true);
            }
        };

        let meta = task.execution_meta(&self.config.default_skill);
        if let Err(policy_error) = self.validate_policy(&task, &meta) {
            self.emit_event(
                job.id,
                EventLevel::Error,
                "Task rejected by worker policy requirements",
                Some(json!({
                    "jobType": job.job_type,
                    "targetRuntime": task.target_runtime.as_str(),
                    "error": policy_error,
                })),
            )
            .await;
            self.fail_job(job.id, &policy_error, false).await;
            return Ok(true);
        }

        let mut claimed_payload = json!({
            "jobType": job.job_type,
            "targetRuntime": task.target_runtime.as_str(),
        });
        if let (Value::Object(target), Ok(Value::Object(meta_map))) = (
            &mut claimed_payload,
            serde_json::to_value(&meta),
        ) {
            for (key, value) in meta_map {
                target.insert(key, value);
            }
        }
        self.emit_event(job.id, EventLevel::Info, WORKER_CLAIMED, Some(claimed_payload))
            .await;

        // Lease renewal runs beside the job; a cancel request flips the
        // shared token.
        let cancel = CancellationToken::new();
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(job.id, cancel.clone(), heartbeat_stop.clone());

        let mut staged: Vec<ArtifactUpload> = Vec::new();
        let outcome = self
            .process_job(&job, &task, &meta, &cancel, &mut staged)
            .await;

        match outcome {
            JobOutcome::Completed { summary } => {
                match self.upload_artifacts(job.id, &staged).await {
                    Ok(()) => {
                        if let Err(error) = self
                            .queue
                            .complete(job.id, &self.config.worker_id, summary.as_deref())
                            .await
                        {
                            error!(%error, job_id = %job.id, "complete transition failed");
                        } else {
                            self.emit_event(
                                job.id,
                                EventLevel::Info,
                                "Job completed",
                                Some(json!({"summary": summary, "jobType": job.job_type})),
                            )
                            .await;
                        }
                    }
                    Err(upload_error) => {
                        // Upload failure on the success path converts the
                        // job to a failure.
                        let message = self.redactor.scrub(&upload_error.to_string());
                        self.fail_job(job.id, &message, false).await;
                    }
                }
            }
            JobOutcome::Cancelled => {
                if let Err(error) = self.upload_artifacts(job.id, &staged).await {
                    warn!(%error, job_id = %job.id, "best-effort artifact upload failed during cancel");
                }
                if let Err(error) = self
                    .queue
                    .ack_cancel(job.id, &self.config.worker_id, Some("cancelled by server request"))
                    .await
                {
                    error!(%error, job_id = %job.id, "ack-cancel transition failed");
                }
            }
            JobOutcome::Failed { message, retryable } => {
                if let Err(error) = self.upload_artifacts(job.id, &staged).await {
                    warn!(%error, job_id = %job.id, "best-effort artifact upload failed during failure path");
                }
                self.fail_job(job.id, &message, retryable).await;
                self.emit_event(
                    job.id,
                    EventLevel::Error,
                    "Job failed",
                    Some(json!({"error": message, "jobType": job.job_type, "retryable": retryable})),
                )
                .await;
            }
        }

        heartbeat_stop.cancel();
        let _ = heartbeat.await;
        Ok(true)
    }

    /// Fail-closed policy gate; returns the first violated requirement.
    fn validate_policy(
        &self,
        task: &CanonicalTask,
        meta: &ExecutionMeta,
    ) -> std::result::Result<(), String> {
        if !self
            .config
            .worker_runtime
            .can_execute(task.target_runtime)
        {
            return Err(format!(
                "unsupported task runtime for worker ({}): {}",
                self.config.worker_runtime.as_str(),
                task.target_runtime.as_str()
            ));
        }

        let available: Vec<String> = self
            .config
            .worker_capabilities
            .iter()
            .map(|c| c.to_lowercase())
            .collect();
        let missing: Vec<String> = task
            .required_capabilities
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty() && !available.contains(c))
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "worker is missing required capabilities: {}",
                missing.join(", ")
            ));
        }

        if meta.used_skills
            && self.config.skill_policy_mode == SkillPolicyMode::Allowlist
            && !self
                .config
                .allowed_skills
                .iter()
                .any(|skill| skill == &meta.selected_skill)
        {
            return Err(format!("skill not allowlisted: {}", meta.selected_skill));
        }
        Ok(())
    }

    /// Run the stage plan; translate stage errors into a terminal outcome.
    async fn process_job(
        &self,
        job: &ClaimedJob,
        task: &CanonicalTask,
        meta: &ExecutionMeta,
        cancel: &CancellationToken,
        staged: &mut Vec<ArtifactUpload>,
    ) -> JobOutcome {
        let plan = task.stage_plan();
        self.emit_event(
            job.id,
            EventLevel::Info,
            "moonmind.task.plan",
            Some(json!({
                "jobType": job.job_type,
                "stages": plan
                    .stages
                    .iter()
                    .map(|planned| json!({
                        "stage": planned.stage.as_str(),
                        "noop": planned.noop,
                    }))
                    .collect::<Vec<_>>(),
            })),
        )
        .await;

        let prepared: PreparedWorkspace = match self
            .executor
            .prepare(job.id, &job.job_type, task, meta, cancel)
            .await
        {
            Ok(prepared) => prepared,
            Err(error) => return self.outcome_from_stage_error(error),
        };
        staged.extend(self.executor.prepare_artifacts(&prepared));

        if cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        let execute = match self
            .executor
            .execute(job.id, &job.job_type, task, meta, &prepared, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => return self.outcome_from_stage_error(error),
        };
        staged.extend(normalize_execute_artifacts(
            execute.artifacts,
            &prepared.paths.execute_log,
        ));

        if !execute.succeeded {
            let message = self
                .redactor
                .scrub(execute.error_message.as_deref().unwrap_or("task execution failed"));
            return JobOutcome::Failed {
                message,
                retryable: execute.retryable,
            };
        }

        if cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        let mut summary = execute.summary.unwrap_or_else(|| "task completed".to_string());
        match self
            .executor
            .publish(job.id, &job.job_type, task, meta, &prepared, staged, cancel)
            .await
        {
            Ok(Some(note)) => summary = format!("{summary}; {note}"),
            Ok(None) => {}
            Err(error) => return self.outcome_from_stage_error(error),
        }

        JobOutcome::Completed {
            summary: Some(summary),
        }
    }

    fn outcome_from_stage_error(&self, error: crate::stages::StageError) -> JobOutcome {
        if error.is_cancelled() {
            return JobOutcome::Cancelled;
        }
        JobOutcome::Failed {
            message: self.redactor.scrub(&error.to_string()),
            retryable: false,
        }
    }

    /// Renew the lease every third of its window; cancel requests flip the
    /// shared token, failures only warn.
    fn spawn_heartbeat(
        &self,
        job_id: Uuid,
        cancel: CancellationToken,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let worker_id = self.config.worker_id.clone();
        let lease_seconds = self.config.lease_seconds;
        let interval = self.config.heartbeat_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = stop.cancelled() => return,
                }
                match queue.heartbeat(job_id, &worker_id, lease_seconds).await {
                    Ok(response) => {
                        if response.cancel_requested_at.is_some() && !cancel.is_cancelled() {
                            info!(%job_id, "server requested cancellation");
                            cancel.cancel();
                        }
                    }
                    Err(error) => {
                        warn!(%error, %job_id, "heartbeat failed");
                    }
                }
            }
        })
    }

    /// Upload staged artifacts, skipping empty files; one retry per artifact.
    async fn upload_artifacts(
        &self,
        job_id: Uuid,
        staged: &[ArtifactUpload],
    ) -> std::result::Result<(), QueueError> {
        for artifact in staged {
            if !artifact.is_uploadable() {
                continue;
            }
            match self
                .queue
                .upload_artifact(job_id, &self.config.worker_id, artifact)
                .await
            {
                Ok(()) => {}
                Err(first_error) => {
                    warn!(%first_error, name = %artifact.name, "artifact upload failed; retrying once");
                    self.queue
                        .upload_artifact(job_id, &self.config.worker_id, artifact)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Best-effort terminal failure with a redacted single-line message.
    async fn fail_job(&self, job_id: Uuid, message: &str, retryable: bool) {
        let message = self.redactor.scrub(message);
        let message = message.lines().next().unwrap_or("job failed").to_string();
        if let Err(error) = self
            .queue
            .fail(job_id, &self.config.worker_id, &message, retryable)
            .await
        {
            error!(%error, %job_id, "fail transition failed");
        }
    }

    /// Best-effort event emission; failures never block the job.
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
            tracing::debug!(%error, "event emission failed");
        }
    }
}
