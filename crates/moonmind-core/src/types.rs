//! Core types for the worker daemon.
//!
//! Enumerations and small value types shared between the queue contract,
//! the task normalizer, and the stage executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Agent runtime a task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Codex,
    Gemini,
    Claude,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Claude => "claude",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            "claude" => Some(Self::Claude),
            _ => None,
        }
    }
}

/// Runtime mode a worker process is configured for.
///
/// `Universal` workers accept tasks for any agent runtime; the others accept
/// only their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRuntime {
    #[default]
    Codex,
    Gemini,
    Claude,
    Universal,
}

impl WorkerRuntime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Claude => "claude",
            Self::Universal => "universal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            "claude" => Some(Self::Claude),
            "universal" => Some(Self::Universal),
            _ => None,
        }
    }

    /// Whether this worker mode can execute a task targeting `runtime`.
    pub fn can_execute(&self, runtime: RuntimeKind) -> bool {
        match self {
            Self::Universal => true,
            Self::Codex => runtime == RuntimeKind::Codex,
            Self::Gemini => runtime == RuntimeKind::Gemini,
            Self::Claude => runtime == RuntimeKind::Claude,
        }
    }
}

/// Publish behavior after a successful execute stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    None,
    #[default]
    Branch,
    Pr,
}

impl PublishMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Branch => "branch",
            Self::Pr => "pr",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "branch" => Some(Self::Branch),
            "pr" => Some(Self::Pr),
            _ => None,
        }
    }
}

/// Workspace reuse policy for the prepare stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkdirMode {
    #[default]
    FreshClone,
    Reuse,
}

impl WorkdirMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FreshClone => "fresh_clone",
            Self::Reuse => "reuse",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fresh_clone" => Some(Self::FreshClone),
            "reuse" => Some(Self::Reuse),
            _ => None,
        }
    }
}

/// Container image pull policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullMode {
    #[default]
    IfMissing,
    Always,
}

impl PullMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IfMissing => "if-missing",
            Self::Always => "always",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "if-missing" => Some(Self::IfMissing),
            "always" => Some(Self::Always),
            _ => None,
        }
    }
}

/// Skill allowlist enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillPolicyMode {
    #[default]
    Allowlist,
    Permissive,
}

impl SkillPolicyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowlist => "allowlist",
            Self::Permissive => "permissive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allowlist" => Some(Self::Allowlist),
            "permissive" => Some(Self::Permissive),
            _ => None,
        }
    }
}

/// Gemini CLI authentication mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeminiAuthMode {
    #[default]
    ApiKey,
    Oauth,
}

impl GeminiAuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Oauth => "oauth",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "api_key" => Some(Self::ApiKey),
            "oauth" => Some(Self::Oauth),
            _ => None,
        }
    }
}

/// Severity of a queue event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// How a task's instruction is routed through skills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    DirectOnly,
    Skill,
    DirectFallback,
}

impl ExecutionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectOnly => "direct_only",
            Self::Skill => "skill",
            Self::DirectFallback => "direct_fallback",
        }
    }
}

/// A job claimed from the queue under a lease.
///
/// The worker owns the job until exactly one terminal transition (complete,
/// fail, or ack-cancel) or until the lease lapses server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// Skill execution metadata echoed on job events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMeta {
    pub selected_skill: String,
    pub execution_path: ExecutionPath,
    pub used_skills: bool,
    pub used_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_effort: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_kind_round_trips() {
        for kind in [RuntimeKind::Codex, RuntimeKind::Gemini, RuntimeKind::Claude] {
            assert_eq!(RuntimeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RuntimeKind::parse("cursor"), None);
    }

    #[test]
    fn universal_worker_executes_all_runtimes() {
        let worker = WorkerRuntime::Universal;
        assert!(worker.can_execute(RuntimeKind::Codex));
        assert!(worker.can_execute(RuntimeKind::Gemini));
        assert!(worker.can_execute(RuntimeKind::Claude));
    }

    #[test]
    fn runtime_specific_worker_rejects_others() {
        let worker = WorkerRuntime::Gemini;
        assert!(worker.can_execute(RuntimeKind::Gemini));
        assert!(!worker.can_execute(RuntimeKind::Codex));
        assert!(!worker.can_execute(RuntimeKind::Claude));
    }

    #[test]
    fn publish_mode_default_is_branch() {
        assert_eq!(PublishMode::default(), PublishMode::Branch);
    }

    #[test]
    fn workdir_mode_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&WorkdirMode::FreshClone).unwrap(),
            "\"fresh_clone\""
        );
    }

    #[test]
    fn pull_mode_uses_kebab_case() {
        assert_eq!(PullMode::parse("if-missing"), Some(PullMode::IfMissing));
        assert_eq!(
            serde_json::to_string(&PullMode::Always).unwrap(),
            "\"always\""
        );
    }

    #[test]
    fn claimed_job_deserializes_queue_shape() {
        let job: ClaimedJob = serde_json::from_str(
            r#"{"id":"0191f2a0-2f2f-7cc0-b1aa-111111111111","type":"task","payload":{"repository":"Owner/Repo"}}"#,
        )
        .unwrap();
        assert_eq!(job.job_type, "task");
        assert_eq!(job.payload["repository"], "Owner/Repo");
    }

    #[test]
    fn execution_path_as_str() {
        assert_eq!(ExecutionPath::DirectOnly.as_str(), "direct_only");
        assert_eq!(ExecutionPath::Skill.as_str(), "skill");
        assert_eq!(ExecutionPath::DirectFallback.as_str(), "direct_fallback");
    }
}
