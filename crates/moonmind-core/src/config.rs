//! Worker configuration from environment variables.
//!
//! Everything the daemon needs is read once at startup; invalid values fail
//! fast with the offending key named. Capability sets derive from the
//! runtime mode when not configured explicitly.

use crate::secret_ref::{load_vault_token, SecretReferenceError};
use crate::selfheal::SelfHealConfig;
use crate::types::{GeminiAuthMode, SkillPolicyMode, WorkerRuntime};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be configured")]
    MissingRequired { key: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("{key} must be one of: {allowed}; got '{value}'")]
    InvalidChoice {
        key: String,
        value: String,
        allowed: String,
    },
    #[error("{key} must be >= {min}")]
    BelowMinimum { key: String, min: u64 },
    #[error(transparent)]
    SecretReference(#[from] SecretReferenceError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

const DEFAULT_CAPS_UNIVERSAL: [&str; 5] = ["codex", "gemini", "claude", "git", "gh"];

/// Vault connection settings for secret-reference resolution.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub address: String,
    pub token: String,
    pub namespace: Option<String>,
    pub allowed_mounts: Vec<String>,
    pub timeout: Duration,
}

/// Runtime configuration for the worker daemon.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub base_url: String,
    pub worker_id: String,
    pub worker_token: Option<String>,
    pub poll_interval: Duration,
    pub lease_seconds: u64,
    pub workdir: PathBuf,
    pub worker_runtime: WorkerRuntime,
    pub worker_capabilities: Vec<String>,
    pub legacy_job_types_enabled: bool,
    pub allowed_types: Vec<String>,
    pub default_skill: String,
    pub allowed_skills: Vec<String>,
    pub skill_policy_mode: SkillPolicyMode,
    pub skills_dir: PathBuf,
    pub codex_model: Option<String>,
    pub codex_effort: Option<String>,
    pub codex_sandbox_mode: String,
    pub gemini_model: Option<String>,
    pub gemini_effort: Option<String>,
    pub gemini_binary: String,
    pub gemini_auth_mode: GeminiAuthMode,
    pub gemini_home: Option<PathBuf>,
    pub claude_model: Option<String>,
    pub claude_effort: Option<String>,
    pub claude_binary: String,
    pub docker_binary: String,
    pub container_workspace_volume: Option<String>,
    pub container_timeout_seconds: u64,
    pub git_user_name: String,
    pub git_user_email: String,
    pub sigkill_grace: Duration,
    pub vault: Option<VaultConfig>,
    pub heal: SelfHealConfig,
}

fn get(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn get_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    get(lookup, key).unwrap_or_else(|| default.to_string())
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| ConfigError::InvalidInt {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_min_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64, min: u64) -> Result<u64> {
    let value = match get(lookup, key) {
        Some(raw) => parse_u64(key, &raw)?,
        None => default,
    };
    if value < min {
        return Err(ConfigError::BelowMinimum {
            key: key.to_string(),
            min,
        });
    }
    Ok(value)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "0" | "no" | "n" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in raw.split(',') {
        let item = item.trim();
        if !item.is_empty() && !out.iter().any(|existing| existing == item) {
            out.push(item.to_string());
        }
    }
    out
}

impl SelfHealConfig {
    /// Load self-heal thresholds from environment, all values >= 1.
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            step_max_attempts: u32::try_from(parse_min_u64(
                lookup,
                "STEP_MAX_ATTEMPTS",
                u64::from(defaults.step_max_attempts),
                1,
            )?)
            .unwrap_or(u32::MAX),
            step_timeout_seconds: parse_min_u64(
                lookup,
                "STEP_TIMEOUT_SECONDS",
                defaults.step_timeout_seconds,
                1,
            )?,
            step_idle_timeout_seconds: parse_min_u64(
                lookup,
                "STEP_IDLE_TIMEOUT_SECONDS",
                defaults.step_idle_timeout_seconds,
                1,
            )?,
            step_no_progress_limit: u32::try_from(parse_min_u64(
                lookup,
                "STEP_NO_PROGRESS_LIMIT",
                u64::from(defaults.step_no_progress_limit),
                1,
            )?)
            .unwrap_or(u32::MAX),
            job_max_resets: u32::try_from(parse_min_u64(
                lookup,
                "JOB_SELF_HEAL_MAX_RESETS",
                u64::from(defaults.job_max_resets),
                1,
            )?)
            .unwrap_or(u32::MAX),
        })
    }
}

impl WorkerConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    /// Load from an arbitrary lookup (used directly by tests).
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_url = get(lookup, "MOONMIND_URL")
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "MOONMIND_URL".to_string(),
            })?
            .trim_end_matches('/')
            .to_string();

        let worker_id = get(lookup, "MOONMIND_WORKER_ID")
            .or_else(|| get(lookup, "HOSTNAME"))
            .unwrap_or_else(|| "moonmind-worker".to_string());

        let poll_interval_ms = parse_min_u64(lookup, "MOONMIND_POLL_INTERVAL_MS", 1500, 1)?;
        let lease_seconds = parse_min_u64(lookup, "MOONMIND_LEASE_SECONDS", 120, 1)?;

        let workdir = PathBuf::from(get_or(lookup, "MOONMIND_WORKDIR", "var/worker"));

        let runtime_raw = get_or(lookup, "MOONMIND_WORKER_RUNTIME", "codex").to_lowercase();
        let worker_runtime =
            WorkerRuntime::parse(&runtime_raw).ok_or_else(|| ConfigError::InvalidChoice {
                key: "MOONMIND_WORKER_RUNTIME".to_string(),
                value: runtime_raw.clone(),
                allowed: "codex, gemini, claude, universal".to_string(),
            })?;

        let worker_capabilities = match get(lookup, "MOONMIND_WORKER_CAPABILITIES") {
            Some(csv) => parse_csv(&csv),
            None => match worker_runtime {
                WorkerRuntime::Universal => DEFAULT_CAPS_UNIVERSAL
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                other => vec![other.as_str().to_string(), "git".to_string(), "gh".to_string()],
            },
        };

        let legacy_job_types_enabled = match get(lookup, "MOONMIND_ENABLE_LEGACY_JOB_TYPES") {
            Some(raw) => parse_bool("MOONMIND_ENABLE_LEGACY_JOB_TYPES", &raw)?,
            None => true,
        };
        let allowed_types = if legacy_job_types_enabled {
            vec![
                "task".to_string(),
                "codex_exec".to_string(),
                "codex_skill".to_string(),
            ]
        } else {
            vec!["task".to_string()]
        };

        let default_skill = get_or(lookup, "MOONMIND_DEFAULT_SKILL", "speckit");
        let mut allowed_skills = match get(lookup, "MOONMIND_ALLOWED_SKILLS") {
            Some(csv) => parse_csv(&csv),
            None => vec![default_skill.clone()],
        };
        if !allowed_skills.contains(&default_skill) {
            allowed_skills.push(default_skill.clone());
        }

        let skill_policy_raw = get_or(lookup, "MOONMIND_SKILL_POLICY_MODE", "allowlist");
        let skill_policy_mode = SkillPolicyMode::parse(&skill_policy_raw.to_lowercase())
            .ok_or_else(|| ConfigError::InvalidChoice {
                key: "MOONMIND_SKILL_POLICY_MODE".to_string(),
                value: skill_policy_raw,
                allowed: "allowlist, permissive".to_string(),
            })?;

        let codex_sandbox_mode = {
            let raw = get_or(lookup, "MOONMIND_CODEX_SANDBOX_MODE", "workspace-write");
            if matches!(
                raw.as_str(),
                "read-only" | "workspace-write" | "danger-full-access"
            ) {
                raw
            } else {
                "workspace-write".to_string()
            }
        };

        let gemini_auth_raw = get_or(lookup, "MOONMIND_GEMINI_CLI_AUTH_MODE", "api_key");
        let gemini_auth_mode = GeminiAuthMode::parse(&gemini_auth_raw.to_lowercase())
            .ok_or_else(|| ConfigError::InvalidChoice {
                key: "MOONMIND_GEMINI_CLI_AUTH_MODE".to_string(),
                value: gemini_auth_raw,
                allowed: "api_key, oauth".to_string(),
            })?;

        let container_timeout_seconds =
            parse_min_u64(lookup, "MOONMIND_CONTAINER_TIMEOUT_SECONDS", 3600, 1)?;

        let sigkill_grace_seconds =
            parse_min_u64(lookup, "MOONMIND_SIGKILL_GRACE_SECONDS", 5, 1)?;

        let vault = match get(lookup, "MOONMIND_VAULT_ADDR") {
            None => None,
            Some(address) => {
                let token_file = get(lookup, "MOONMIND_VAULT_TOKEN_FILE").map(PathBuf::from);
                let token = load_vault_token(
                    get(lookup, "MOONMIND_VAULT_TOKEN").as_deref(),
                    token_file.as_deref(),
                )?;
                let timeout_seconds =
                    parse_min_u64(lookup, "MOONMIND_VAULT_TIMEOUT_SECONDS", 10, 1)?;
                token.map(|token| VaultConfig {
                    address: address.trim_end_matches('/').to_string(),
                    token,
                    namespace: get(lookup, "MOONMIND_VAULT_NAMESPACE"),
                    allowed_mounts: {
                        let mounts =
                            parse_csv(&get_or(lookup, "MOONMIND_VAULT_ALLOWED_MOUNTS", "kv"));
                        if mounts.is_empty() {
                            vec!["kv".to_string()]
                        } else {
                            mounts
                        }
                    },
                    timeout: Duration::from_secs(timeout_seconds),
                })
            }
        };

        Ok(Self {
            base_url,
            worker_id,
            worker_token: get(lookup, "MOONMIND_WORKER_TOKEN"),
            poll_interval: Duration::from_millis(poll_interval_ms),
            lease_seconds,
            workdir,
            worker_runtime,
            worker_capabilities,
            legacy_job_types_enabled,
            allowed_types,
            default_skill,
            allowed_skills,
            skill_policy_mode,
            skills_dir: PathBuf::from(get_or(lookup, "MOONMIND_SKILLS_DIR", "skills")),
            codex_model: get(lookup, "MOONMIND_CODEX_MODEL"),
            codex_effort: get(lookup, "MOONMIND_CODEX_EFFORT"),
            codex_sandbox_mode,
            gemini_model: get(lookup, "MOONMIND_GEMINI_MODEL"),
            gemini_effort: get(lookup, "MOONMIND_GEMINI_EFFORT"),
            gemini_binary: get_or(lookup, "MOONMIND_GEMINI_BINARY", "gemini"),
            gemini_auth_mode,
            gemini_home: get(lookup, "GEMINI_HOME").map(PathBuf::from),
            claude_model: get(lookup, "MOONMIND_CLAUDE_MODEL"),
            claude_effort: get(lookup, "MOONMIND_CLAUDE_EFFORT"),
            claude_binary: get_or(lookup, "MOONMIND_CLAUDE_BINARY", "claude"),
            docker_binary: get_or(lookup, "MOONMIND_DOCKER_BINARY", "docker"),
            container_workspace_volume: get(lookup, "MOONMIND_CONTAINER_WORKSPACE_VOLUME"),
            container_timeout_seconds,
            git_user_name: get_or(lookup, "MOONMIND_GIT_USER_NAME", "MoonMind Worker"),
            git_user_email: get_or(
                lookup,
                "MOONMIND_GIT_USER_EMAIL",
                "moonmind-worker@users.noreply.github.com",
            ),
            sigkill_grace: Duration::from_secs(sigkill_grace_seconds),
            vault,
            heal: SelfHealConfig::from_lookup(lookup)?,
        })
    }

    /// Resolve the workdir against `cwd` when it is relative.
    pub fn resolve_workdir(&mut self, cwd: &std::path::Path) {
        if self.workdir.is_relative() {
            self.workdir = cwd.join(&self.workdir);
        }
    }

    /// Heartbeat cadence: a third of the lease, at least one second.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs((self.lease_seconds / 3).max(1))
    }
}
