//! Queue event names and payloads.
//!
//! The worker streams structured events to the control plane while a job
//! runs. Stage events are paired: every `started` is followed by exactly one
//! `finished` or `failed` for that stage.

use crate::types::EventLevel;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle stages of a claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Execute,
    Publish,
}

impl Stage {
    /// Event message name for this stage.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Prepare => "moonmind.task.prepare",
            Self::Execute => "moonmind.task.execute",
            Self::Publish => "moonmind.task.publish",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Execute => "execute",
            Self::Publish => "publish",
        }
    }
}

/// Outcome half of a paired stage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Finished,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Event level appropriate for this status.
    pub fn level(&self) -> EventLevel {
        match self {
            Self::Failed => EventLevel::Error,
            _ => EventLevel::Info,
        }
    }
}

/// Step lifecycle event names for multi-step execution.
pub const STEP_STARTED: &str = "task.step.started";
pub const STEP_FINISHED: &str = "task.step.finished";
pub const STEP_FAILED: &str = "task.step.failed";
pub const STEP_WALL_TIMEOUT: &str = "task.step.wall_timeout";
pub const STEP_IDLE_TIMEOUT: &str = "task.step.idle_timeout";
pub const DEFAULT_BRANCH_RESOLVED: &str = "task.git.defaultBranchResolved";
pub const WORKER_CLAIMED: &str = "Worker claimed job";
pub const CONTAINER_STARTED: &str = "moonmind.task.container.started";
pub const CONTAINER_FINISHED: &str = "moonmind.task.container.finished";

/// Payload for `task.step.started` / `task.step.finished` / `task.step.failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEventPayload {
    pub step_id: String,
    pub step_index: usize,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload for `task.git.defaultBranchResolved`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchResolvedPayload {
    pub default_branch: String,
    pub starting_branch: String,
    pub new_branch: Option<String>,
    pub working_branch: String,
}

/// Result recorded by the publish stage into `publish_result.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResult {
    pub mode: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub pr_url: Option<String>,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PublishResult {
    pub fn skipped(mode: &str, branch: &str, reason: &str) -> Self {
        Self {
            mode: mode.to_string(),
            branch: branch.to_string(),
            base_branch: None,
            pr_url: None,
            skipped: true,
            reason: Some(reason.to_string()),
        }
    }

    pub fn published(
        mode: &str,
        branch: &str,
        base_branch: &str,
        pr_url: Option<String>,
    ) -> Self {
        Self {
            mode: mode.to_string(),
            branch: branch.to_string(),
            base_branch: Some(base_branch.to_string()),
            pr_url,
            skipped: false,
            reason: None,
        }
    }
}

/// Record written to `<subdir>/metadata/run.json` after a container run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRunRecord {
    pub job_id: Uuid,
    pub repository: String,
    pub container_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub command_summary: String,
    pub pull_mode: String,
    pub workdir: String,
    pub artifact_dir: String,
    pub timeout_seconds: u64,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_event_names() {
        assert_eq!(Stage::Prepare.event_name(), "moonmind.task.prepare");
        assert_eq!(Stage::Execute.event_name(), "moonmind.task.execute");
        assert_eq!(Stage::Publish.event_name(), "moonmind.task.publish");
    }

    #[test]
    fn failed_status_maps_to_error_level() {
        assert_eq!(StageStatus::Failed.level(), EventLevel::Error);
        assert_eq!(StageStatus::Started.level(), EventLevel::Info);
        assert_eq!(StageStatus::Finished.level(), EventLevel::Info);
    }

    #[test]
    fn step_payload_serializes_camel_case() {
        let payload = StepEventPayload {
            step_id: "lint".to_string(),
            step_index: 2,
            attempt: 1,
            exit_code: Some(0),
            error: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["stepId"], "lint");
        assert_eq!(json["stepIndex"], 2);
        assert_eq!(json["exitCode"], 0);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn publish_result_skip_shape() {
        let result = PublishResult::skipped("branch", "task/x", "no local changes");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["skipped"], true);
        assert_eq!(json["reason"], "no local changes");
        assert_eq!(json["prUrl"], serde_json::Value::Null);
    }

    #[test]
    fn publish_result_published_shape() {
        let result = PublishResult::published(
            "pr",
            "task/x",
            "main",
            Some("https://github.com/o/r/pull/1".to_string()),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["skipped"], false);
        assert_eq!(json["baseBranch"], "main");
        assert_eq!(json["prUrl"], "https://github.com/o/r/pull/1");
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn branch_resolved_payload_round_trips() {
        let payload = BranchResolvedPayload {
            default_branch: "main".to_string(),
            starting_branch: "main".to_string(),
            new_branch: Some("task/20260801/abcd1234".to_string()),
            working_branch: "task/20260801/abcd1234".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let parsed: BranchResolvedPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.working_branch, payload.working_branch);
        assert!(json.contains("defaultBranch"));
    }
}
