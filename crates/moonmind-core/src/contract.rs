//! Task contract normalization.
//!
//! Inbound queue payloads are loosely-typed JSON in one of three shapes:
//! the canonical `task` type or the legacy `codex_exec` / `codex_skill`
//! types. Normalization produces a single [`CanonicalTask`] view and fails
//! closed on anything malformed. `normalize` is idempotent over the
//! canonical rendering: `normalize(to_payload(t)) == t`.

use crate::events::Stage;
use crate::types::{ExecutionMeta, ExecutionPath, PublishMode, PullMode, RuntimeKind, WorkdirMode};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskContractError {
    #[error("unsupported job type: {0}")]
    UnsupportedJobType(String),
    #[error("repository is required")]
    MissingRepository,
    #[error("repository URL must not include embedded credentials")]
    EmbeddedCredentials,
    #[error("task.instructions is required unless a container command is provided")]
    MissingInstructions,
    #[error("publish.mode must be one of none, branch, pr; got '{0}'")]
    InvalidPublishMode(String),
    #[error("workdirMode must be fresh_clone or reuse; got '{0}'")]
    InvalidWorkdirMode(String),
    #[error("unsupported task runtime: {0}")]
    UnknownRuntime(String),
    #[error("requiredCapabilities must include at least one capability")]
    MissingCapabilities,
    #[error("task.container and task.steps are mutually exclusive")]
    ContainerAndSteps,
    #[error("task.container.image is required when task.container.enabled=true")]
    MissingContainerImage,
    #[error("task.container.command is required when task.container.enabled=true")]
    EmptyContainerCommand,
    #[error("task.container.pull must be if-missing or always; got '{0}'")]
    InvalidPullMode(String),
    #[error("task.container.timeoutSeconds must be >= 1")]
    InvalidContainerTimeout,
    #[error("task.container.artifactsSubdir may not contain '..'")]
    InvalidArtifactsSubdir,
    #[error("step id must be non-empty")]
    EmptyStepId,
    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),
    #[error("step instructions must be non-empty for step {0}")]
    EmptyStepInstructions(String),
    #[error("affinityKey must match [A-Za-z0-9._:-] and be at most 128 characters")]
    InvalidAffinityKey,
}

pub type Result<T> = std::result::Result<T, TaskContractError>;

pub const CANONICAL_JOB_TYPE: &str = "task";
pub const LEGACY_JOB_TYPES: [&str; 2] = ["codex_exec", "codex_skill"];

/// Skill selection for a task or step. `auto` means no skill.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SkillSelector {
    pub id: String,
    pub args: Map<String, Value>,
}

impl SkillSelector {
    pub fn auto() -> Self {
        Self {
            id: "auto".to_string(),
            args: Map::new(),
        }
    }

    pub fn is_auto(&self) -> bool {
        self.id == "auto"
    }
}

/// Model/effort overrides at task or step granularity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeOverrides {
    pub model: Option<String>,
    pub effort: Option<String>,
}

/// Branch hints from the task payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GitBranches {
    pub starting_branch: Option<String>,
    pub new_branch: Option<String>,
}

/// Publish policy for the job.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishSpec {
    pub mode: PublishMode,
    pub pr_base_branch: Option<String>,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub commit_message: Option<String>,
}

/// Vault references for repository and publish credentials.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthRefs {
    pub repo_auth_ref: Option<String>,
    pub publish_auth_ref: Option<String>,
}

/// Named cache volume mounted into a container run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVolume {
    pub name: String,
    pub target: String,
}

/// Normalized `task.container` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub artifacts_subdir: String,
    pub timeout_seconds: Option<u64>,
    pub pull: PullMode,
    pub cpus: Option<String>,
    pub memory: Option<String>,
    pub cache_volumes: Vec<CacheVolume>,
}

/// One entry of `task.steps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStep {
    pub id: String,
    pub instructions: String,
    pub skill: SkillSelector,
    pub runtime: RuntimeOverrides,
}

/// The single canonical view every accepted payload reduces to.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalTask {
    pub repository: String,
    pub target_runtime: RuntimeKind,
    pub required_capabilities: Vec<String>,
    pub auth: AuthRefs,
    pub instructions: String,
    pub skill: SkillSelector,
    pub runtime: RuntimeOverrides,
    pub git: GitBranches,
    pub publish: PublishSpec,
    pub container: Option<ContainerSpec>,
    pub steps: Vec<TaskStep>,
    pub workdir_mode: WorkdirMode,
    pub affinity_key: Option<String>,
}

/// The ordered stage plan for a task.
///
/// Publish is always present; with `publish.mode=none` it is marked as a
/// no-op that still records a skipped `publish_result.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub stages: Vec<PlannedStage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedStage {
    pub stage: Stage,
    pub noop: bool,
}

impl CanonicalTask {
    /// Derive the stage plan for this task.
    pub fn stage_plan(&self) -> StagePlan {
        StagePlan {
            stages: vec![
                PlannedStage {
                    stage: Stage::Prepare,
                    noop: false,
                },
                PlannedStage {
                    stage: Stage::Execute,
                    noop: false,
                },
                PlannedStage {
                    stage: Stage::Publish,
                    noop: self.publish.mode == PublishMode::None,
                },
            ],
        }
    }

    /// Skill execution metadata echoed on job events.
    ///
    /// A non-`auto` skill other than the worker default executes on the
    /// direct-fallback path.
    pub fn execution_meta(&self, default_skill: &str) -> ExecutionMeta {
        let selected = if self.skill.id.is_empty() {
            "auto".to_string()
        } else {
            self.skill.id.clone()
        };
        let used_skills = selected != "auto";
        let (execution_path, used_fallback) = if !used_skills {
            (ExecutionPath::DirectOnly, false)
        } else if selected == default_skill {
            (ExecutionPath::Skill, false)
        } else {
            (ExecutionPath::DirectFallback, true)
        };
        ExecutionMeta {
            selected_skill: selected,
            execution_path,
            used_skills,
            used_fallback,
            runtime_model: self.runtime.model.clone(),
            runtime_effort: self.runtime.effort.clone(),
        }
    }

    /// Render the canonical payload shape back out.
    pub fn to_payload(&self) -> Value {
        let mut task = Map::new();
        task.insert("instructions".into(), json!(self.instructions));
        task.insert(
            "skill".into(),
            json!({"id": self.skill.id, "args": Value::Object(self.skill.args.clone())}),
        );
        task.insert(
            "runtime".into(),
            json!({"model": self.runtime.model, "effort": self.runtime.effort}),
        );
        task.insert(
            "git".into(),
            json!({
                "startingBranch": self.git.starting_branch,
                "newBranch": self.git.new_branch,
            }),
        );
        task.insert(
            "publish".into(),
            json!({
                "mode": self.publish.mode.as_str(),
                "prBaseBranch": self.publish.pr_base_branch,
                "prTitle": self.publish.pr_title,
                "prBody": self.publish.pr_body,
                "commitMessage": self.publish.commit_message,
            }),
        );
        if let Some(container) = &self.container {
            task.insert(
                "container".into(),
                json!({
                    "enabled": true,
                    "image": container.image,
                    "command": container.command,
                    "workdir": container.workdir,
                    "env": container.env,
                    "artifactsSubdir": container.artifacts_subdir,
                    "timeoutSeconds": container.timeout_seconds,
                    "pull": container.pull.as_str(),
                    "resources": {"cpus": container.cpus, "memory": container.memory},
                    "cacheVolumes": container
                        .cache_volumes
                        .iter()
                        .map(|v| json!({"name": v.name, "target": v.target}))
                        .collect::<Vec<_>>(),
                }),
            );
        }
        if !self.steps.is_empty() {
            task.insert(
                "steps".into(),
                Value::Array(
                    self.steps
                        .iter()
                        .map(|step| {
                            json!({
                                "id": step.id,
                                "instructions": step.instructions,
                                "skill": {
                                    "id": step.skill.id,
                                    "args": Value::Object(step.skill.args.clone()),
                                },
                                "runtime": {
                                    "model": step.runtime.model,
                                    "effort": step.runtime.effort,
                                },
                            })
                        })
                        .collect(),
                ),
            );
        }

        json!({
            "repository": self.repository,
            "targetRuntime": self.target_runtime.as_str(),
            "requiredCapabilities": self.required_capabilities,
            "auth": {
                "repoAuthRef": self.auth.repo_auth_ref,
                "publishAuthRef": self.auth.publish_auth_ref,
            },
            "workdirMode": self.workdir_mode.as_str(),
            "affinityKey": self.affinity_key,
            "task": Value::Object(task),
        })
    }
}

// --- Extraction helpers over serde_json::Value ---

fn obj<'a>(value: &'a Value, key: &str) -> Option<&'a Map<String, Value>> {
    value.get(key).and_then(Value::as_object)
}

fn trimmed(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn repository_has_userinfo(repository: &str) -> bool {
    let rest = if let Some(rest) = repository.strip_prefix("https://") {
        rest
    } else if let Some(rest) = repository.strip_prefix("http://") {
        rest
    } else {
        return false;
    };
    let authority = rest.split('/').next().unwrap_or("");
    authority.contains('@')
}

fn validate_repository(repository: &str) -> Result<String> {
    let repository = repository.trim();
    if repository.is_empty() {
        return Err(TaskContractError::MissingRepository);
    }
    if repository_has_userinfo(repository) {
        return Err(TaskContractError::EmbeddedCredentials);
    }
    Ok(repository.to_string())
}

fn validate_affinity_key(raw: Option<String>) -> Result<Option<String>> {
    let Some(key) = raw else { return Ok(None) };
    let valid_len = (1..=128).contains(&key.len());
    let valid_chars = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'));
    if valid_len && valid_chars {
        Ok(Some(key))
    } else {
        Err(TaskContractError::InvalidAffinityKey)
    }
}

fn parse_workdir_mode(value: &Value) -> Result<WorkdirMode> {
    match trimmed(value, "workdirMode") {
        None => Ok(WorkdirMode::default()),
        Some(raw) => {
            WorkdirMode::parse(&raw).ok_or(TaskContractError::InvalidWorkdirMode(raw))
        }
    }
}

fn parse_publish(node: Option<&Map<String, Value>>) -> Result<PublishSpec> {
    let Some(node) = node else {
        return Ok(PublishSpec::default());
    };
    let node = Value::Object(node.clone());
    let mode = match trimmed(&node, "mode") {
        None => PublishMode::default(),
        Some(raw) => PublishMode::parse(&raw.to_lowercase())
            .ok_or(TaskContractError::InvalidPublishMode(raw))?,
    };
    Ok(PublishSpec {
        mode,
        pr_base_branch: trimmed(&node, "prBaseBranch"),
        pr_title: trimmed(&node, "prTitle"),
        pr_body: trimmed(&node, "prBody"),
        commit_message: trimmed(&node, "commitMessage"),
    })
}

fn parse_skill(node: Option<&Map<String, Value>>) -> SkillSelector {
    let Some(node) = node else {
        return SkillSelector::auto();
    };
    let id = node
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("auto")
        .to_string();
    let args = node
        .get("args")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    SkillSelector { id, args }
}

fn parse_runtime_overrides(node: Option<&Map<String, Value>>) -> RuntimeOverrides {
    let Some(node) = node else {
        return RuntimeOverrides::default();
    };
    let node = Value::Object(node.clone());
    RuntimeOverrides {
        model: trimmed(&node, "model"),
        effort: trimmed(&node, "effort"),
    }
}

fn sanitize_artifacts_subdir(raw: Option<String>) -> Result<String> {
    let candidate = raw.unwrap_or_default();
    let candidate = candidate.trim().trim_matches('/');
    if candidate.is_empty() {
        return Ok("container".to_string());
    }
    let parts: Vec<&str> = candidate
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    if parts.iter().any(|segment| *segment == "..") {
        return Err(TaskContractError::InvalidArtifactsSubdir);
    }
    let normalized = parts.join("/");
    if normalized.is_empty() {
        Ok("container".to_string())
    } else {
        Ok(normalized)
    }
}

fn parse_container(node: Option<&Map<String, Value>>) -> Result<Option<ContainerSpec>> {
    let Some(node) = node else { return Ok(None) };
    if !node.get("enabled").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(None);
    }
    let node_value = Value::Object(node.clone());

    let image = trimmed(&node_value, "image").ok_or(TaskContractError::MissingContainerImage)?;

    let command: Vec<String> = node
        .get("command")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if command.is_empty() {
        return Err(TaskContractError::EmptyContainerCommand);
    }

    let pull = match trimmed(&node_value, "pull") {
        None => PullMode::default(),
        Some(raw) => PullMode::parse(&raw.to_lowercase())
            .ok_or(TaskContractError::InvalidPullMode(raw))?,
    };

    let timeout_seconds = match node.get("timeoutSeconds") {
        None | Some(Value::Null) => None,
        Some(value) => {
            let seconds = value
                .as_u64()
                .filter(|v| *v >= 1)
                .ok_or(TaskContractError::InvalidContainerTimeout)?;
            Some(seconds)
        }
    };

    let mut env = BTreeMap::new();
    if let Some(env_node) = node.get("env").and_then(Value::as_object) {
        for (key, value) in env_node {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            env.insert(key.to_string(), rendered);
        }
    }

    let mut cache_volumes = Vec::new();
    if let Some(items) = node.get("cacheVolumes").and_then(Value::as_array) {
        for item in items {
            let name = trimmed(item, "name");
            let target = trimmed(item, "target");
            if let (Some(name), Some(target)) = (name, target) {
                cache_volumes.push(CacheVolume { name, target });
            }
        }
    }

    let resources = node.get("resources").cloned().unwrap_or(Value::Null);

    Ok(Some(ContainerSpec {
        image,
        command,
        workdir: trimmed(&node_value, "workdir"),
        env,
        artifacts_subdir: sanitize_artifacts_subdir(trimmed(&node_value, "artifactsSubdir"))?,
        timeout_seconds,
        pull,
        cpus: trimmed(&resources, "cpus"),
        memory: trimmed(&resources, "memory"),
        cache_volumes,
    }))
}

fn parse_steps(node: Option<&Vec<Value>>) -> Result<Vec<TaskStep>> {
    let Some(items) = node else {
        return Ok(Vec::new());
    };
    let mut steps = Vec::with_capacity(items.len());
    let mut seen: Vec<String> = Vec::new();
    for item in items {
        let id = trimmed(item, "id").ok_or(TaskContractError::EmptyStepId)?;
        if seen.contains(&id) {
            return Err(TaskContractError::DuplicateStepId(id));
        }
        let instructions = trimmed(item, "instructions")
            .ok_or_else(|| TaskContractError::EmptyStepInstructions(id.clone()))?;
        seen.push(id.clone());
        steps.push(TaskStep {
            id,
            instructions,
            skill: parse_skill(obj(item, "skill")),
            runtime: parse_runtime_overrides(obj(item, "runtime")),
        });
    }
    Ok(steps)
}

fn normalize_canonical(payload: &Value) -> Result<CanonicalTask> {
    let repository =
        validate_repository(&trimmed(payload, "repository").unwrap_or_default())?;

    let runtime_raw = trimmed(payload, "targetRuntime").unwrap_or_else(|| "codex".to_string());
    let target_runtime = RuntimeKind::parse(&runtime_raw.to_lowercase())
        .ok_or(TaskContractError::UnknownRuntime(runtime_raw))?;

    let required_capabilities = string_list(payload, "requiredCapabilities");
    if required_capabilities.is_empty() {
        return Err(TaskContractError::MissingCapabilities);
    }

    let auth_node = payload.get("auth").cloned().unwrap_or(Value::Null);
    let auth = AuthRefs {
        repo_auth_ref: trimmed(&auth_node, "repoAuthRef"),
        publish_auth_ref: trimmed(&auth_node, "publishAuthRef"),
    };

    let task = payload.get("task").cloned().unwrap_or(Value::Null);
    let container = parse_container(obj(&task, "container"))?;
    let steps = parse_steps(task.get("steps").and_then(Value::as_array))?;
    if container.is_some() && !steps.is_empty() {
        return Err(TaskContractError::ContainerAndSteps);
    }

    let instructions = trimmed(&task, "instructions").unwrap_or_default();
    if instructions.is_empty() && container.is_none() && steps.is_empty() {
        return Err(TaskContractError::MissingInstructions);
    }

    let git_node = task.get("git").cloned().unwrap_or(Value::Null);

    Ok(CanonicalTask {
        repository,
        target_runtime,
        required_capabilities,
        auth,
        instructions,
        skill: parse_skill(obj(&task, "skill")),
        runtime: parse_runtime_overrides(obj(&task, "runtime")),
        git: GitBranches {
            starting_branch: trimmed(&git_node, "startingBranch"),
            new_branch: trimmed(&git_node, "newBranch"),
        },
        publish: parse_publish(obj(&task, "publish"))?,
        container,
        steps,
        workdir_mode: parse_workdir_mode(payload)?,
        affinity_key: validate_affinity_key(trimmed(payload, "affinityKey"))?,
    })
}

/// Adapt a legacy `codex_exec` payload into the canonical shape.
fn normalize_codex_exec(payload: &Value) -> Result<CanonicalTask> {
    let repository = validate_repository(&trimmed(payload, "repository").unwrap_or_default())?;
    let instructions =
        trimmed(payload, "instruction").ok_or(TaskContractError::MissingInstructions)?;
    let codex = payload.get("codex").cloned().unwrap_or(Value::Null);
    Ok(CanonicalTask {
        repository,
        target_runtime: RuntimeKind::Codex,
        required_capabilities: vec!["codex".to_string(), "git".to_string()],
        auth: AuthRefs::default(),
        instructions,
        skill: SkillSelector::auto(),
        runtime: RuntimeOverrides {
            model: trimmed(&codex, "model"),
            effort: trimmed(&codex, "effort"),
        },
        git: GitBranches {
            starting_branch: trimmed(payload, "ref"),
            new_branch: None,
        },
        publish: parse_publish(obj(payload, "publish"))?,
        container: None,
        steps: Vec::new(),
        workdir_mode: parse_workdir_mode(payload)?,
        affinity_key: None,
    })
}

/// Adapt a legacy `codex_skill` payload into the canonical shape.
fn normalize_codex_skill(payload: &Value) -> Result<CanonicalTask> {
    let repository = validate_repository(&trimmed(payload, "repository").unwrap_or_default())?;
    let instructions =
        trimmed(payload, "instruction").ok_or(TaskContractError::MissingInstructions)?;
    let skill_id = trimmed(payload, "skillId").unwrap_or_else(|| "speckit".to_string());
    let args = payload
        .get("inputs")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let codex = payload.get("codex").cloned().unwrap_or(Value::Null);
    Ok(CanonicalTask {
        repository,
        target_runtime: RuntimeKind::Codex,
        required_capabilities: vec!["codex".to_string(), "git".to_string()],
        auth: AuthRefs::default(),
        instructions,
        skill: SkillSelector { id: skill_id, args },
        runtime: RuntimeOverrides {
            model: trimmed(&codex, "model"),
            effort: trimmed(&codex, "effort"),
        },
        git: GitBranches {
            starting_branch: trimmed(payload, "ref"),
            new_branch: None,
        },
        publish: parse_publish(obj(payload, "publish"))?,
        container: None,
        steps: Vec::new(),
        workdir_mode: parse_workdir_mode(payload)?,
        affinity_key: None,
    })
}

/// Normalize any accepted payload into the canonical task view.
pub fn normalize(job_type: &str, payload: &Value) -> Result<CanonicalTask> {
    match job_type {
        CANONICAL_JOB_TYPE => normalize_canonical(payload),
        "codex_exec" => normalize_codex_exec(payload),
        "codex_skill" => normalize_codex_skill(payload),
        other => Err(TaskContractError::UnsupportedJobType(other.to_string())),
    }
}
