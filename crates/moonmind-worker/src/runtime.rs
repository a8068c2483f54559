//! Runtime adapters: command assembly for the agent CLIs.
//!
//! One builder per runtime. Model and effort values resolve with
//! step override > task override > worker default precedence, and known
//! aliases normalize before the command line is assembled.

use moonmind_core::config::WorkerConfig;
use moonmind_core::contract::RuntimeOverrides;
use moonmind_core::types::{GeminiAuthMode, RuntimeKind};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Model aliases accepted on the wire for the Codex CLI.
fn normalize_codex_model(model: &str) -> &str {
    match model {
        "gpt-5.3-codex-spark" => "gpt-5-codex",
        other => other,
    }
}

/// Effort aliases accepted on the wire.
fn normalize_effort(effort: &str) -> &str {
    match effort {
        "xhigh" => "high",
        other => other,
    }
}

/// Builds agent CLI invocations from worker configuration.
#[derive(Debug, Clone)]
pub struct RuntimeAdapters {
    codex_binary: String,
    codex_sandbox_mode: String,
    gemini_binary: String,
    gemini_auth_mode: GeminiAuthMode,
    gemini_home: Option<PathBuf>,
    claude_binary: String,
    codex_defaults: RuntimeOverrides,
    gemini_defaults: RuntimeOverrides,
    claude_defaults: RuntimeOverrides,
}

impl RuntimeAdapters {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            codex_binary: "codex".to_string(),
            codex_sandbox_mode: config.codex_sandbox_mode.clone(),
            gemini_binary: config.gemini_binary.clone(),
            gemini_auth_mode: config.gemini_auth_mode,
            gemini_home: config.gemini_home.clone(),
            claude_binary: config.claude_binary.clone(),
            codex_defaults: RuntimeOverrides {
                model: config.codex_model.clone(),
                effort: config.codex_effort.clone(),
            },
            gemini_defaults: RuntimeOverrides {
                model: config.gemini_model.clone(),
                effort: config.gemini_effort.clone(),
            },
            claude_defaults: RuntimeOverrides {
                model: config.claude_model.clone(),
                effort: config.claude_effort.clone(),
            },
        }
    }

    fn defaults_for(&self, runtime: RuntimeKind) -> &RuntimeOverrides {
        match runtime {
            RuntimeKind::Codex => &self.codex_defaults,
            RuntimeKind::Gemini => &self.gemini_defaults,
            RuntimeKind::Claude => &self.claude_defaults,
        }
    }

    /// Resolve model/effort with step > task > worker-default precedence.
    pub fn resolve_overrides(
        &self,
        runtime: RuntimeKind,
        task: &RuntimeOverrides,
        step: Option<&RuntimeOverrides>,
    ) -> (Option<String>, Option<String>) {
        let defaults = self.defaults_for(runtime);
        let model = step
            .and_then(|s| s.model.clone())
            .or_else(|| task.model.clone())
            .or_else(|| defaults.model.clone());
        let effort = step
            .and_then(|s| s.effort.clone())
            .or_else(|| task.effort.clone())
            .or_else(|| defaults.effort.clone());
        (model, effort)
    }

    /// Assemble the CLI invocation for one instruction.
    pub fn build_command(
        &self,
        runtime: RuntimeKind,
        instruction: &str,
        model: Option<&str>,
        effort: Option<&str>,
    ) -> Vec<String> {
        match runtime {
            RuntimeKind::Codex => {
                let mut command = vec![
                    self.codex_binary.clone(),
                    "exec".to_string(),
                    "--sandbox".to_string(),
                    self.codex_sandbox_mode.clone(),
                ];
                if let Some(model) = model {
                    command.push("--model".to_string());
                    command.push(normalize_codex_model(model).to_string());
                }
                if let Some(effort) = effort {
                    let effort = normalize_effort(effort)
                        .replace('\\', "\\\\")
                        .replace('"', "\\\"");
                    command.push("--config".to_string());
                    command.push(format!("model_reasoning_effort=\"{effort}\""));
                }
                command.push(instruction.to_string());
                command
            }
            RuntimeKind::Gemini => {
                let mut command = vec![
                    self.gemini_binary.clone(),
                    "--prompt".to_string(),
                    instruction.to_string(),
                    "--output-format".to_string(),
                    "json".to_string(),
                ];
                if let Some(model) = model {
                    command.push("--model".to_string());
                    command.push(model.to_string());
                }
                if let Some(effort) = effort {
                    command.push("--effort".to_string());
                    command.push(normalize_effort(effort).to_string());
                }
                command
            }
            RuntimeKind::Claude => {
                let mut command = vec![
                    self.claude_binary.clone(),
                    "--print".to_string(),
                    instruction.to_string(),
                ];
                if let Some(model) = model {
                    command.push("--model".to_string());
                    command.push(model.to_string());
                }
                if let Some(effort) = effort {
                    command.push("--effort".to_string());
                    command.push(normalize_effort(effort).to_string());
                }
                command
            }
        }
    }

    /// Apply runtime-specific environment adjustments.
    ///
    /// Gemini in oauth mode must not see API keys and needs its home
    /// directory; api_key mode passes the configured key straight through.
    pub fn adjust_env(&self, runtime: RuntimeKind, env: &mut BTreeMap<String, String>) {
        if runtime != RuntimeKind::Gemini {
            return;
        }
        match self.gemini_auth_mode {
            GeminiAuthMode::Oauth => {
                env.remove("GEMINI_API_KEY");
                env.remove("GOOGLE_API_KEY");
                if let Some(home) = &self.gemini_home {
                    env.insert(
                        "GEMINI_HOME".to_string(),
                        home.to_string_lossy().into_owned(),
                    );
                }
            }
            GeminiAuthMode::ApiKey => {
                for key in ["GEMINI_API_KEY", "GOOGLE_API_KEY"] {
                    if let Ok(value) = std::env::var(key) {
                        if !value.is_empty() {
                            env.entry(key.to_string()).or_insert(value);
                        }
                    }
                }
            }
        }
    }
}
