//! Preflight checks run before the worker accepts any claim.
//!
//! Verifies the agent CLIs for the configured runtime mode, their auth
//! state, the embedding profile, optional retrieval backends, and GitHub
//! CLI credentials. Everything here fails closed: a broken prerequisite
//! stops the daemon before it can claim and then fail jobs.

use moonmind_core::config::WorkerConfig;
use moonmind_core::types::{GeminiAuthMode, WorkerRuntime};
use std::collections::BTreeMap;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("required CLI not found or not executable: {0}")]
    MissingCli(String),
    #[error("preflight command failed: {0}")]
    CommandFailed(String),
    #[error("{0}")]
    Config(String),
    #[error("retrieval backend unreachable: {0}")]
    BackendUnreachable(String),
}

pub type Result<T> = std::result::Result<T, PreflightError>;

/// Locate `name` on PATH and confirm it is an executable file.
pub fn verify_cli_is_executable(name: &str) -> Result<PathBuf> {
    let candidate = PathBuf::from(name);
    if candidate.components().count() > 1 {
        return if is_executable(&candidate) {
            Ok(candidate)
        } else {
            Err(PreflightError::MissingCli(name.to_string()))
        };
    }
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(name);
        if is_executable(&full) {
            return Ok(full);
        }
    }
    Err(PreflightError::MissingCli(name.to_string()))
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

/// Whether a failure message looks like an unsupported-command error, which
/// warrants trying a compatibility fallback instead of aborting.
fn is_cli_usage_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    ["unknown command", "no such option", "unrecognized option", "invalid choice"]
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn redact(message: &str, secrets: &[String]) -> String {
    let mut out = message.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            out = out.replace(secret.as_str(), "[REDACTED]");
        }
    }
    out
}

/// Run a command, feeding optional stdin, with selected env keys removed.
fn run_checked(
    command: &[String],
    input: Option<&str>,
    secrets: &[String],
    unset_env: &[&str],
    extra_env: &BTreeMap<String, String>,
) -> Result<()> {
    let Some(program) = command.first() else {
        return Err(PreflightError::CommandFailed("empty command".to_string()));
    };
    let mut builder = Command::new(program);
    builder
        .args(&command[1..])
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for key in unset_env {
        builder.env_remove(key);
    }
    for (key, value) in extra_env {
        builder.env(key, value);
    }

    let mut child = builder
        .spawn()
        .map_err(|e| PreflightError::CommandFailed(redact(&format!("{program}: {e}"), secrets)))?;
    if let (Some(stdin), Some(text)) = (child.stdin.as_mut(), input) {
        let _ = stdin.write_all(text.as_bytes());
    }
    let output = child
        .wait_with_output()
        .map_err(|e| PreflightError::CommandFailed(redact(&format!("{program}: {e}"), secrets)))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let message = if !stderr.trim().is_empty() {
        stderr.trim().to_string()
    } else if !stdout.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        format!("command failed: {}", command.join(" "))
    };
    Err(PreflightError::CommandFailed(redact(&message, secrets)))
}

/// Google embedding profiles need an API key before the worker can serve
/// retrieval-dependent tasks.
fn validate_embedding_profile(lookup: &impl Fn(&str) -> Option<String>) -> Result<()> {
    let provider = lookup("DEFAULT_EMBEDDING_PROVIDER")
        .unwrap_or_else(|| "google".to_string())
        .trim()
        .to_lowercase();
    if provider != "google" {
        return Ok(());
    }
    let has_key = ["GOOGLE_API_KEY", "GEMINI_API_KEY"]
        .iter()
        .any(|key| lookup(key).is_some_and(|v| !v.trim().is_empty()));
    if has_key {
        return Ok(());
    }
    Err(PreflightError::Config(
        "Google embedding profile is configured but GOOGLE_API_KEY or GEMINI_API_KEY is missing"
            .to_string(),
    ))
}

/// Validate GEMINI_HOME for the configured Gemini auth mode.
fn validate_gemini_home(mode: GeminiAuthMode, home: Option<&PathBuf>) -> Result<()> {
    match mode {
        GeminiAuthMode::ApiKey => {
            if let Some(home) = home {
                if !home.is_dir() {
                    return Err(PreflightError::Config(format!(
                        "GEMINI_HOME must point to an existing directory: {}",
                        home.display()
                    )));
                }
            }
            Ok(())
        }
        GeminiAuthMode::Oauth => {
            let Some(home) = home else {
                return Err(PreflightError::Config(
                    "GEMINI_HOME is required when MOONMIND_GEMINI_CLI_AUTH_MODE=oauth".to_string(),
                ));
            };
            if !home.is_dir() {
                return Err(PreflightError::Config(format!(
                    "GEMINI_HOME must point to an existing directory: {}",
                    home.display()
                )));
            }
            let probe = home.join(".moonmind-write-probe");
            let writable = std::fs::write(&probe, b"probe").is_ok();
            let _ = std::fs::remove_file(&probe);
            if !writable {
                return Err(PreflightError::Config(
                    "GEMINI_HOME must be writable when MOONMIND_GEMINI_CLI_AUTH_MODE=oauth"
                        .to_string(),
                ));
            }
            Ok(())
        }
    }
}

/// Check a configured retrieval backend answers on its TCP endpoint.
fn check_backend_reachable(name: &str, url: &str) -> Result<()> {
    let trimmed = url
        .trim()
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let authority = trimmed.split('/').next().unwrap_or_default();
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(80)),
        None => (authority.to_string(), 80),
    };
    let address = format!("{host}:{port}");
    let resolved = address
        .to_socket_addrs()
        .map_err(|e| PreflightError::BackendUnreachable(format!("{name} ({address}): {e}")))?
        .next()
        .ok_or_else(|| {
            PreflightError::BackendUnreachable(format!("{name} ({address}): no address"))
        })?;
    TcpStream::connect_timeout(&resolved, Duration::from_secs(3))
        .map_err(|e| PreflightError::BackendUnreachable(format!("{name} ({address}): {e}")))?;
    Ok(())
}

fn claude_auth_status(claude_path: &PathBuf, secrets: &[String]) -> Result<()> {
    if let Ok(custom) = std::env::var("MOONMIND_CLAUDE_AUTH_STATUS_COMMAND") {
        let custom = custom.trim().to_string();
        if !custom.is_empty() {
            let command: Vec<String> = custom.split_whitespace().map(ToString::to_string).collect();
            return run_checked(&command, None, secrets, &[], &BTreeMap::new());
        }
    }

    let primary = vec![
        claude_path.to_string_lossy().into_owned(),
        "auth".to_string(),
        "status".to_string(),
    ];
    match run_checked(&primary, None, secrets, &[], &BTreeMap::new()) {
        Ok(()) => Ok(()),
        Err(PreflightError::CommandFailed(message)) if is_cli_usage_error(&message) => {
            // Older CLIs only expose `claude login status`.
            let fallback = vec![
                claude_path.to_string_lossy().into_owned(),
                "login".to_string(),
                "status".to_string(),
            ];
            run_checked(&fallback, None, secrets, &[], &BTreeMap::new()).map_err(|e| {
                PreflightError::CommandFailed(format!(
                    "Claude auth status failed for both `claude auth status` and `claude login status`. Primary error: {message}. Fallback error: {e}"
                ))
            })
        }
        Err(other) => Err(other),
    }
}

/// Validate CLI dependencies and auth state before the daemon starts.
pub fn run_preflight(config: &WorkerConfig) -> Result<()> {
    let github_token = std::env::var("GITHUB_TOKEN")
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    let secrets: Vec<String> = github_token.iter().cloned().collect();

    let runtime = config.worker_runtime;
    let mut codex_path = None;
    let mut gemini_path = None;
    let mut claude_path = None;
    if matches!(runtime, WorkerRuntime::Codex | WorkerRuntime::Universal) {
        codex_path = Some(verify_cli_is_executable("codex")?);
    }
    if matches!(runtime, WorkerRuntime::Gemini | WorkerRuntime::Universal) {
        gemini_path = Some(verify_cli_is_executable(&config.gemini_binary)?);
    }
    if matches!(runtime, WorkerRuntime::Claude | WorkerRuntime::Universal) {
        claude_path = Some(verify_cli_is_executable(&config.claude_binary)?);
    }

    if config.default_skill == "speckit" || config.allowed_skills.iter().any(|s| s == "speckit") {
        let speckit = verify_cli_is_executable("speckit")?;
        let version = vec![
            speckit.to_string_lossy().into_owned(),
            "--version".to_string(),
        ];
        if let Err(PreflightError::CommandFailed(message)) =
            run_checked(&version, None, &secrets, &[], &BTreeMap::new())
        {
            if !is_cli_usage_error(&message) {
                return Err(PreflightError::CommandFailed(message));
            }
            // Some installs ship a shim without --version; --help proves
            // executability.
            let help = vec![speckit.to_string_lossy().into_owned(), "--help".to_string()];
            run_checked(&help, None, &secrets, &[], &BTreeMap::new())?;
        }
    }

    let lookup = |key: &str| std::env::var(key).ok();
    validate_embedding_profile(&lookup)?;
    if let Some(url) = lookup("MOONMIND_RAG_GATEWAY_URL") {
        check_backend_reachable("rag gateway", &url)?;
    }
    if let Some(url) = lookup("QDRANT_URL") {
        check_backend_reachable("qdrant", &url)?;
    }

    if let Some(codex) = &codex_path {
        run_checked(
            &[
                codex.to_string_lossy().into_owned(),
                "login".to_string(),
                "status".to_string(),
            ],
            None,
            &secrets,
            &[],
            &BTreeMap::new(),
        )?;
    }
    if let Some(gemini) = &gemini_path {
        validate_gemini_home(config.gemini_auth_mode, config.gemini_home.as_ref())?;
        run_checked(
            &[gemini.to_string_lossy().into_owned(), "--version".to_string()],
            None,
            &secrets,
            &[],
            &BTreeMap::new(),
        )?;
    }
    if let Some(claude) = &claude_path {
        run_checked(
            &[claude.to_string_lossy().into_owned(), "--version".to_string()],
            None,
            &secrets,
            &[],
            &BTreeMap::new(),
        )?;
        claude_auth_status(claude, &secrets)?;
    }

    // GitHub CLI bootstrap; gh refuses --with-token while GITHUB_TOKEN is
    // exported, so the keys are stripped from the child env.
    if let Some(token) = &github_token {
        let gh = verify_cli_is_executable("gh")?;
        let gh = gh.to_string_lossy().into_owned();
        let stripped = ["GITHUB_TOKEN", "GH_TOKEN"];
        run_checked(
            &[
                gh.clone(),
                "auth".to_string(),
                "login".to_string(),
                "--hostname".to_string(),
                "github.com".to_string(),
                "--with-token".to_string(),
            ],
            Some(token),
            &secrets,
            &stripped,
            &BTreeMap::new(),
        )?;
        run_checked(
            &[gh.clone(), "auth".to_string(), "setup-git".to_string()],
            None,
            &secrets,
            &stripped,
            &BTreeMap::new(),
        )?;
        run_checked(
            &[
                gh,
                "auth".to_string(),
                "status".to_string(),
                "--hostname".to_string(),
                "github.com".to_string(),
            ],
            None,
            &secrets,
            &stripped,
            &BTreeMap::new(),
        )?;
    }

    info!(runtime = runtime.as_str(), "preflight checks passed");
    Ok(())
}
