//! Container-mode execution: one `docker run` per task.
//!
//! The workspace is mounted into the container (bind mount by default, or a
//! named volume when the worker itself runs containerized), declared cache
//! volumes are attached, and the run is wall-clock bounded. A
//! `metadata/run.json` record is written under the task's artifacts subdir
//! whether the run succeeds, fails, or times out.

use crate::process::{CommandError, CommandRunner, CommandSpec};
use crate::workspace::JobPaths;
use moonmind_core::artifacts::{container_run_record_name, ArtifactUpload, CONTENT_TYPE_JSON};
use moonmind_core::contract::ContainerSpec;
use moonmind_core::events::ContainerRunRecord;
use moonmind_core::types::PullMode;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("workdir must be an absolute path for container execution")]
    RelativeWorkdir,
    #[error("failed to write container run record: {0}")]
    RecordWrite(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type Result<T> = std::result::Result<T, ContainerError>;

const COMMAND_SUMMARY_LIMIT: usize = 320;

/// Exit code recorded when the wall clock expires, mirroring `timeout(1)`.
const TIMEOUT_EXIT_CODE: i32 = 124;

fn command_summary(command: &[String]) -> String {
    let rendered = command.join(" ");
    if rendered.len() <= COMMAND_SUMMARY_LIMIT {
        rendered
    } else {
        format!("{}...", &rendered[..COMMAND_SUMMARY_LIMIT - 3])
    }
}

/// Outcome of one container execution.
#[derive(Debug)]
pub struct ContainerRunOutcome {
    pub succeeded: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub error: Option<String>,
    pub record_artifact: ArtifactUpload,
}

/// Drives docker for container-mode tasks.
#[derive(Debug, Clone)]
pub struct ContainerExecutor {
    docker_binary: String,
    workspace_volume: Option<String>,
    default_timeout_seconds: u64,
    runner: CommandRunner,
}

impl ContainerExecutor {
    pub fn new(
        docker_binary: &str,
        workspace_volume: Option<&str>,
        default_timeout_seconds: u64,
        runner: CommandRunner,
    ) -> Self {
        Self {
            docker_binary: docker_binary.to_string(),
            workspace_volume: workspace_volume.map(String::from),
            default_timeout_seconds,
            runner,
        }
    }

    pub fn container_name(job_id: Uuid) -> String {
        format!("mm-task-{job_id}")
    }

    fn docker(
        &self,
        args: Vec<String>,
        cwd: &Path,
        log: &Path,
        env: &BTreeMap<String, String>,
    ) -> CommandSpec {
        let mut command = vec![self.docker_binary.clone()];
        command.extend(args);
        CommandSpec::new(command, cwd, log).with_env(env.clone())
    }

    /// Pull the image when the policy requires it or the local cache misses.
    pub async fn ensure_image(
        &self,
        spec: &ContainerSpec,
        cwd: &Path,
        log: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if spec.pull == PullMode::Always {
            let pull = self.docker(
                vec!["pull".to_string(), spec.image.clone()],
                cwd,
                log,
                env,
            );
            self.runner.run(&pull, cancel, None).await?;
            return Ok(());
        }

        let inspect = self
            .docker(
                vec![
                    "image".to_string(),
                    "inspect".to_string(),
                    spec.image.clone(),
                ],
                cwd,
                log,
                env,
            )
            .no_check();
        let output = self.runner.run(&inspect, cancel, None).await?;
        if output.exit_code == 0 {
            return Ok(());
        }
        let pull = self.docker(
            vec!["pull".to_string(), spec.image.clone()],
            cwd,
            log,
            env,
        );
        self.runner.run(&pull, cancel, None).await?;
        Ok(())
    }

    /// Assemble the `docker run` invocation.
    ///
    /// Returns the command plus the artifact directory path as seen inside
    /// the container (the workspace mount target mirrors the host layout).
    pub fn build_run_command(
        &self,
        job_id: Uuid,
        repository: &str,
        workdir_root: &Path,
        paths: &JobPaths,
        spec: &ContainerSpec,
    ) -> Result<(Vec<String>, String)> {
        if !workdir_root.is_absolute() {
            return Err(ContainerError::RelativeWorkdir);
        }
        let mount_target = workdir_root.to_string_lossy().into_owned();
        let artifact_dir = paths
            .artifacts_dir
            .join(&spec.artifacts_subdir)
            .to_string_lossy()
            .into_owned();
        let container_workdir = spec
            .workdir
            .clone()
            .unwrap_or_else(|| paths.repo_dir.to_string_lossy().into_owned());

        let mut command = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            Self::container_name(job_id),
            "--label".to_string(),
            format!("moonmind.job_id={job_id}"),
            "--label".to_string(),
            format!("moonmind.repository={repository}"),
            "--label".to_string(),
            "moonmind.runtime=container".to_string(),
        ];

        let workspace_mount = match &self.workspace_volume {
            Some(volume) => format!("type=volume,src={volume},dst={mount_target}"),
            None => format!("type=bind,src={mount_target},dst={mount_target}"),
        };
        command.push("--mount".to_string());
        command.push(workspace_mount);

        for cache in &spec.cache_volumes {
            command.push("--mount".to_string());
            command.push(format!(
                "type=volume,src={},dst={}",
                cache.name, cache.target
            ));
        }

        if let Some(cpus) = &spec.cpus {
            command.push("--cpus".to_string());
            command.push(cpus.clone());
        }
        if let Some(memory) = &spec.memory {
            command.push("--memory".to_string());
            command.push(memory.clone());
        }

        command.push("--workdir".to_string());
        command.push(container_workdir);

        let mut run_env: BTreeMap<String, String> = BTreeMap::new();
        run_env.insert("ARTIFACT_DIR".to_string(), artifact_dir.clone());
        run_env.insert("JOB_ID".to_string(), job_id.to_string());
        run_env.insert("REPOSITORY".to_string(), repository.to_string());
        for (key, value) in &spec.env {
            run_env.insert(key.clone(), value.clone());
        }
        for (key, value) in &run_env {
            command.push("-e".to_string());
            command.push(format!("{key}={value}"));
        }

        command.push(spec.image.clone());
        command.extend(spec.command.iter().cloned());

        let mut full = vec![self.docker_binary.clone()];
        full.extend(command);
        Ok((full, artifact_dir))
    }

    /// Run the container to completion and record the outcome.
    pub async fn execute(
        &self,
        job_id: Uuid,
        repository: &str,
        workdir_root: &Path,
        paths: &JobPaths,
        spec: &ContainerSpec,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ContainerRunOutcome> {
        let timeout_seconds = spec.timeout_seconds.unwrap_or(self.default_timeout_seconds);
        let started_at = chrono::Utc::now();

        let ensure = self
            .ensure_image(spec, &paths.repo_dir, &paths.execute_log, env, cancel)
            .await;

        let mut timed_out = false;
        let mut exit_code: Option<i32> = None;
        let mut error: Option<String> = None;
        let mut artifact_dir = paths
            .artifacts_dir
            .join(&spec.artifacts_subdir)
            .to_string_lossy()
            .into_owned();

        match ensure {
            Err(ContainerError::Command(CommandError::Cancelled)) => {
                return Err(ContainerError::Command(CommandError::Cancelled));
            }
            Err(e) => error = Some(e.to_string()),
            Ok(()) => {
                let (command, dir) =
                    self.build_run_command(job_id, repository, workdir_root, paths, spec)?;
                artifact_dir = dir;

                let run_spec = CommandSpec {
                    command,
                    cwd: paths.repo_dir.clone(),
                    env: env.clone(),
                    log_path: paths.execute_log.clone(),
                    wall_timeout: Some(Duration::from_secs(timeout_seconds)),
                    idle_timeout: None,
                    check: false,
                };
                match self.runner.run(&run_spec, cancel, None).await {
                    Ok(output) => {
                        exit_code = Some(output.exit_code);
                        if output.exit_code != 0 {
                            let tail = output.stderr_tail().unwrap_or_default().to_string();
                            error = Some(if tail.is_empty() {
                                format!("container command failed ({})", output.exit_code)
                            } else {
                                format!(
                                    "container command failed ({}): {tail}",
                                    output.exit_code
                                )
                            });
                        }
                    }
                    Err(CommandError::WallTimeout(_)) => {
                        timed_out = true;
                        exit_code = Some(TIMEOUT_EXIT_CODE);
                        error = Some(format!(
                            "container execution timed out after {timeout_seconds}s"
                        ));
                        self.stop_container(job_id, paths, env).await;
                    }
                    Err(CommandError::Cancelled) => {
                        self.stop_container(job_id, paths, env).await;
                        return Err(ContainerError::Command(CommandError::Cancelled));
                    }
                    Err(e) => error = Some(e.to_string()),
                }
            }
        }

        let finished_at = chrono::Utc::now();
        let succeeded = !timed_out && exit_code == Some(0) && error.is_none();

        let record = ContainerRunRecord {
            job_id,
            repository: repository.to_string(),
            container_name: Self::container_name(job_id),
            image: spec.image.clone(),
            command: spec.command.clone(),
            command_summary: command_summary(&spec.command),
            pull_mode: spec.pull.as_str().to_string(),
            workdir: spec
                .workdir
                .clone()
                .unwrap_or_else(|| paths.repo_dir.to_string_lossy().into_owned()),
            artifact_dir,
            timeout_seconds,
            timed_out,
            exit_code,
            started_at,
            finished_at,
            duration_seconds: (finished_at - started_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64(),
            error: error.clone(),
        };
        let record_path = self.write_record(paths, spec, &record)?;

        Ok(ContainerRunOutcome {
            succeeded,
            exit_code,
            timed_out,
            error,
            record_artifact: ArtifactUpload::new(
                record_path,
                container_run_record_name(&spec.artifacts_subdir),
                CONTENT_TYPE_JSON,
            ),
        })
    }

    async fn stop_container(&self, job_id: Uuid, paths: &JobPaths, env: &BTreeMap<String, String>) {
        let stop = self
            .docker(
                vec!["stop".to_string(), Self::container_name(job_id)],
                &paths.job_root,
                &paths.execute_log,
                env,
            )
            .no_check();
        let _ = self
            .runner
            .run(&stop, &CancellationToken::new(), None)
            .await;
    }

    fn write_record(
        &self,
        paths: &JobPaths,
        spec: &ContainerSpec,
        record: &ContainerRunRecord,
    ) -> Result<PathBuf> {
        let metadata_dir = paths
            .artifacts_dir
            .join(&spec.artifacts_subdir)
            .join("metadata");
        std::fs::create_dir_all(&metadata_dir)
            .map_err(|e| ContainerError::RecordWrite(e.to_string()))?;
        let record_path = metadata_dir.join("run.json");
        let rendered = serde_json::to_string_pretty(record)
            .map_err(|e| ContainerError::RecordWrite(e.to_string()))?;
        std::fs::write(&record_path, format!("{rendered}\n"))
            .map_err(|e| ContainerError::RecordWrite(e.to_string()))?;
        Ok(record_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonmind_core::SecretRedactor;
    use std::sync::Arc;

    fn executor(volume: Option<&str>) -> ContainerExecutor {
        ContainerExecutor::new(
            "docker",
            volume,
            3600,
            CommandRunner::new(
                Arc::new(SecretRedactor::new(Vec::<String>::new(), "[REDACTED]")),
                Duration::from_millis(200),
            ),
        )
    }

    fn job_id() -> Uuid {
        Uuid::parse_str("0191f2a0-2f2f-7cc0-b1aa-0123456789ab").unwrap()
    }

    fn container_spec() -> ContainerSpec {
        ContainerSpec {
            image: "alpine:3".to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()],
            workdir: None,
            env: BTreeMap::from([("BUILD_MODE".to_string(), "release".to_string())]),
            artifacts_subdir: "container".to_string(),
            timeout_seconds: Some(60),
            pull: PullMode::IfMissing,
            cpus: Some("2".to_string()),
            memory: Some("1g".to_string()),
            cache_volumes: vec![moonmind_core::contract::CacheVolume {
                name: "cargo-cache".to_string(),
                target: "/root/.cargo".to_string(),
            }],
        }
    }

    #[test]
    fn run_command_contains_required_pieces() {
        let executor = executor(None);
        let paths = JobPaths::new(Path::new("/work"), job_id());
        let (command, artifact_dir) = executor
            .build_run_command(
                job_id(),
                "Owner/Repo",
                Path::new("/work"),
                &paths,
                &container_spec(),
            )
            .unwrap();

        let rendered = command.join(" ");
        assert!(rendered.starts_with("docker run --rm --name mm-task-0191f2a0"));
        assert!(rendered.contains("--label moonmind.job_id=0191f2a0-2f2f-7cc0-b1aa-0123456789ab"));
        assert!(rendered.contains("--label moonmind.repository=Owner/Repo"));
        assert!(rendered.contains("type=bind,src=/work,dst=/work"));
        assert!(rendered.contains("type=volume,src=cargo-cache,dst=/root/.cargo"));
        assert!(rendered.contains("--cpus 2"));
        assert!(rendered.contains("--memory 1g"));
        assert!(rendered.contains("-e ARTIFACT_DIR="));
        assert!(rendered.contains("-e JOB_ID=0191f2a0-2f2f-7cc0-b1aa-0123456789ab"));
        assert!(rendered.contains("-e REPOSITORY=Owner/Repo"));
        assert!(rendered.contains("-e BUILD_MODE=release"));
        assert!(rendered.ends_with("alpine:3 sh -c echo hi"));
        assert!(artifact_dir.ends_with("artifacts/container"));
    }

    #[test]
    fn named_volume_replaces_bind_mount() {
        let executor = executor(Some("moonmind-workspace"));
        let paths = JobPaths::new(Path::new("/work"), job_id());
        let (command, _) = executor
            .build_run_command(
                job_id(),
                "Owner/Repo",
                Path::new("/work"),
                &paths,
                &container_spec(),
            )
            .unwrap();
        let rendered = command.join(" ");
        assert!(rendered.contains("type=volume,src=moonmind-workspace,dst=/work"));
        assert!(!rendered.contains("type=bind"));
    }

    #[test]
    fn relative_workdir_is_rejected() {
        let executor = executor(None);
        let paths = JobPaths::new(Path::new("var/worker"), job_id());
        let err = executor
            .build_run_command(
                job_id(),
                "Owner/Repo",
                Path::new("var/worker"),
                &paths,
                &container_spec(),
            )
            .unwrap_err();
        assert!(matches!(err, ContainerError::RelativeWorkdir));
    }

    #[test]
    fn command_summary_truncates() {
        let long: Vec<String> = (0..100).map(|i| format!("arg-{i}")).collect();
        let summary = command_summary(&long);
        assert_eq!(summary.len(), COMMAND_SUMMARY_LIMIT);
        assert!(summary.ends_with("..."));

        let short = command_summary(&["echo".to_string(), "hi".to_string()]);
        assert_eq!(short, "echo hi");
    }

    #[test]
    fn container_name_is_stable() {
        assert_eq!(
            ContainerExecutor::container_name(job_id()),
            "mm-task-0191f2a0-2f2f-7cc0-b1aa-0123456789ab"
        );
    }
}
