//! Streaming subprocess execution with timeouts and cancellation.
//!
//! Children never inherit the parent environment; they receive only the
//! explicit env computed by the stage executor. Two reader tasks drain
//! stdout and stderr; every chunk is decoded, scrubbed, appended to the
//! stage log, and forwarded to an optional live-output callback. A chunk
//! that arrives resets the idle watchdog; wall-clock and idle breaches and
//! external cancellation all terminate the child (SIGTERM, then SIGKILL
//! after a grace period) and join the readers before returning.

use moonmind_core::SecretRedactor;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to execute command '{program}': {detail}")]
    Spawn { program: String, detail: String },
    #[error("command failed ({exit_code}): {command}{stderr_tail}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr_tail: String,
    },
    #[error("step exceeded wall-clock timeout after {0} seconds")]
    WallTimeout(u64),
    #[error("step produced no output for {0} seconds")]
    IdleTimeout(u64),
    #[error("command cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Which child stream a chunk arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Live-output callback invoked per scrubbed chunk.
pub type ChunkCallback = dyn Fn(StreamKind, &str) + Send + Sync;

/// One subprocess invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub log_path: PathBuf,
    pub wall_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    /// When true, a non-zero exit becomes [`CommandError::Failed`].
    pub check: bool,
}

impl CommandSpec {
    pub fn new(command: Vec<String>, cwd: &Path, log_path: &Path) -> Self {
        Self {
            command,
            cwd: cwd.to_path_buf(),
            env: BTreeMap::new(),
            log_path: log_path.to_path_buf(),
            wall_timeout: None,
            idle_timeout: None,
            check: true,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn no_check(mut self) -> Self {
        self.check = false;
        self
    }

    pub fn with_timeouts(mut self, wall: Option<Duration>, idle: Option<Duration>) -> Self {
        self.wall_timeout = wall;
        self.idle_timeout = idle;
        self
    }

    fn rendered(&self) -> String {
        self.command.join(" ")
    }
}

/// Result of a completed subprocess call.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command: Vec<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    /// Last non-empty stderr line, for one-line diagnostics.
    pub fn stderr_tail(&self) -> Option<&str> {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
    }
}

/// Per-stream scrub-and-emit buffer.
///
/// Holds back up to the longest registered secret so a secret split across
/// chunk boundaries never reaches the log or callback unscrubbed.
struct StreamBuf {
    kind: StreamKind,
    pending: String,
    collected: String,
}

impl StreamBuf {
    fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            pending: String::new(),
            collected: String::new(),
        }
    }

    fn push_chunk(
        &mut self,
        bytes: &[u8],
        redactor: &SecretRedactor,
        log: &mut LogWriter,
        on_chunk: Option<&Arc<ChunkCallback>>,
    ) {
        self.pending
            .push_str(&String::from_utf8_lossy(bytes));
        let scrubbed = redactor.scrub(&self.pending);
        let hold = redactor.longest_secret_len();
        if scrubbed.len() <= hold {
            self.pending = scrubbed;
            return;
        }
        let mut split = scrubbed.len() - hold;
        while !scrubbed.is_char_boundary(split) {
            split -= 1;
        }
        let emit = &scrubbed[..split];
        if !emit.is_empty() {
            log.append(emit);
            if let Some(callback) = on_chunk {
                (**callback)(self.kind, emit);
            }
            self.collected.push_str(emit);
        }
        self.pending = scrubbed[split..].to_string();
    }

    fn flush(
        &mut self,
        redactor: &SecretRedactor,
        log: &mut LogWriter,
        on_chunk: Option<&Arc<ChunkCallback>>,
    ) {
        if self.pending.is_empty() {
            return;
        }
        let emit = redactor.scrub(&self.pending);
        log.append(&emit);
        if let Some(callback) = on_chunk {
            (**callback)(self.kind, &emit);
        }
        self.collected.push_str(&emit);
        self.pending.clear();
    }
}

/// Append-only log file; each chunk is one write.
struct LogWriter {
    path: PathBuf,
}

impl LogWriter {
    fn new(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self {
            path: path.to_path_buf(),
        }
    }

    fn append(&mut self, text: &str) {
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(text.as_bytes()));
        if let Err(error) = result {
            warn!(path = %self.path.display(), %error, "stage log write failed");
        }
    }

    fn append_line(&mut self, text: &str) {
        self.append(&format!("{text}\n"));
    }
}

/// Executes subprocesses with streaming output and bounded lifetimes.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    redactor: Arc<SecretRedactor>,
    sigkill_grace: Duration,
}

impl CommandRunner {
    pub fn new(redactor: Arc<SecretRedactor>, sigkill_grace: Duration) -> Self {
        Self {
            redactor,
            sigkill_grace,
        }
    }

    pub fn redactor(&self) -> &Arc<SecretRedactor> {
        &self.redactor
    }

    /// Run one command to completion, streaming output into the stage log.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        on_chunk: Option<Arc<ChunkCallback>>,
    ) -> Result<CommandOutput> {
        let started = Instant::now();
        let mut log = LogWriter::new(&spec.log_path);
        log.append_line(&self.redactor.scrub(&format!("$ {}", spec.rendered())));

        let Some(program) = spec.command.first().cloned() else {
            return Err(CommandError::Spawn {
                program: String::new(),
                detail: "empty command".to_string(),
            });
        };
        let mut command = Command::new(&program);
        command
            .args(&spec.command[1..])
            .current_dir(&spec.cwd)
            .env_clear()
            .envs(&spec.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        debug!(command = %spec.rendered(), cwd = %spec.cwd.display(), "spawning subprocess");

        let mut child = command.spawn().map_err(|e| CommandError::Spawn {
            program: program.clone(),
            detail: e.to_string(),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, mut rx) = mpsc::channel::<(StreamKind, Vec<u8>)>(64);
        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(spawn_reader(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = stderr {
            readers.push(spawn_reader(stderr, StreamKind::Stderr, tx.clone()));
        }
        drop(tx);

        let mut out_buf = StreamBuf::new(StreamKind::Stdout);
        let mut err_buf = StreamBuf::new(StreamKind::Stderr);

        let wall_deadline = spec.wall_timeout.map(|d| tokio::time::Instant::now() + d);
        let mut idle_deadline = spec.idle_timeout.map(|d| tokio::time::Instant::now() + d);

        let outcome = loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some((kind, bytes)) => {
                        if let Some(idle) = spec.idle_timeout {
                            idle_deadline = Some(tokio::time::Instant::now() + idle);
                        }
                        let buf = match kind {
                            StreamKind::Stdout => &mut out_buf,
                            StreamKind::Stderr => &mut err_buf,
                        };
                        buf.push_chunk(&bytes, &self.redactor, &mut log, on_chunk.as_ref());
                    }
                    None => break Ok(()),
                },
                () = sleep_until_opt(wall_deadline) => {
                    break Err(CommandError::WallTimeout(
                        spec.wall_timeout.map_or(0, |d| d.as_secs()),
                    ));
                }
                () = sleep_until_opt(idle_deadline) => {
                    break Err(CommandError::IdleTimeout(
                        spec.idle_timeout.map_or(0, |d| d.as_secs()),
                    ));
                }
                () = cancel.cancelled() => break Err(CommandError::Cancelled),
            }
        };

        if let Err(error) = outcome {
            self.terminate(&mut child).await;
            join_readers(readers, &mut rx, &mut out_buf, &mut err_buf, &self.redactor, &mut log, on_chunk.as_ref()).await;
            out_buf.flush(&self.redactor, &mut log, on_chunk.as_ref());
            err_buf.flush(&self.redactor, &mut log, on_chunk.as_ref());
            log.append_line(&format!("! {error}"));
            return Err(error);
        }

        for reader in readers {
            let _ = reader.await;
        }
        out_buf.flush(&self.redactor, &mut log, on_chunk.as_ref());
        err_buf.flush(&self.redactor, &mut log, on_chunk.as_ref());

        // Pipes are closed but the child may linger; the wall clock still
        // bounds the wait.
        let status = match spec.wall_timeout {
            Some(wall) => {
                let remaining = wall
                    .checked_sub(started.elapsed())
                    .unwrap_or(Duration::from_millis(1));
                match tokio::time::timeout(remaining, child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        self.terminate(&mut child).await;
                        log.append_line(&format!(
                            "! step exceeded wall-clock timeout after {} seconds",
                            wall.as_secs()
                        ));
                        return Err(CommandError::WallTimeout(wall.as_secs()));
                    }
                }
            }
            None => child.wait().await?,
        };
        let exit_code = status.code().unwrap_or(-1);
        let output = CommandOutput {
            command: spec.command.clone(),
            exit_code,
            stdout: out_buf.collected,
            stderr: err_buf.collected,
            duration: started.elapsed(),
        };

        if spec.check && exit_code != 0 {
            let stderr_tail = output
                .stderr_tail()
                .map(|tail| format!(": {}", self.redactor.scrub(tail)))
                .unwrap_or_default();
            return Err(CommandError::Failed {
                command: self.redactor.scrub(&spec.rendered()),
                exit_code,
                stderr_tail,
            });
        }
        Ok(output)
    }

    /// SIGTERM, then SIGKILL once the grace period lapses.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            let _ = tokio::process::Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await;
        }
        match tokio::time::timeout(self.sigkill_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }
}

fn spawn_reader<R>(
    mut stream: R,
    kind: StreamKind,
    tx: mpsc::Sender<(StreamKind, Vec<u8>)>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = [0u8; 8192];
        loop {
            match stream.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    if tx.send((kind, buffer[..read].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Drain whatever the readers still hold, bounded so a wedged pipe cannot
/// stall the termination path.
async fn join_readers(
    readers: Vec<tokio::task::JoinHandle<()>>,
    rx: &mut mpsc::Receiver<(StreamKind, Vec<u8>)>,
    out_buf: &mut StreamBuf,
    err_buf: &mut StreamBuf,
    redactor: &SecretRedactor,
    log: &mut LogWriter,
    on_chunk: Option<&Arc<ChunkCallback>>,
) {
    let drain = async {
        while let Some((kind, bytes)) = rx.recv().await {
            let buf = match kind {
                StreamKind::Stdout => &mut *out_buf,
                StreamKind::Stderr => &mut *err_buf,
            };
            buf.push_chunk(&bytes, redactor, log, on_chunk);
        }
        for reader in readers {
            let _ = reader.await;
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(2), drain).await;
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner_with(secrets: &[&str]) -> CommandRunner {
        CommandRunner::new(
            Arc::new(SecretRedactor::new(secrets.iter().copied(), "[REDACTED]")),
            Duration::from_millis(200),
        )
    }

    fn spec(dir: &TempDir, command: &[&str]) -> CommandSpec {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        CommandSpec::new(
            command.iter().map(ToString::to_string).collect(),
            dir.path(),
            &dir.path().join("stage.log"),
        )
        .with_env(env)
    }

    #[tokio::test]
    async fn captures_stdout_and_logs_it() {
        let dir = TempDir::new().unwrap();
        let runner = runner_with(&[]);
        let output = runner
            .run(
                &spec(&dir, &["sh", "-c", "echo hello-out; echo hello-err >&2"]),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("hello-out"));
        assert!(output.stderr.contains("hello-err"));

        let log = std::fs::read_to_string(dir.path().join("stage.log")).unwrap();
        assert!(log.contains("$ sh -c"));
        assert!(log.contains("hello-out"));
        assert!(log.contains("hello-err"));
    }

    #[tokio::test]
    async fn child_does_not_inherit_parent_env() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("MOONMIND_PROCESS_TEST_LEAK", "leaked");
        let runner = runner_with(&[]);
        let mut command_spec = spec(&dir, &["sh", "-c", "echo \"v=${MOONMIND_PROCESS_TEST_LEAK:-unset}\""]);
        command_spec.env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        let output = runner
            .run(&command_spec, &CancellationToken::new(), None)
            .await
            .unwrap();
        std::env::remove_var("MOONMIND_PROCESS_TEST_LEAK");
        assert!(output.stdout.contains("v=unset"));
    }

    #[tokio::test]
    async fn explicit_env_is_passed() {
        let dir = TempDir::new().unwrap();
        let runner = runner_with(&[]);
        let mut command_spec = spec(&dir, &["sh", "-c", "echo \"token=$GITHUB_TOKEN\""]);
        command_spec
            .env
            .insert("GITHUB_TOKEN".to_string(), "tkn".to_string());
        command_spec.env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        let output = runner
            .run(&command_spec, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(output.stdout.contains("token=tkn"));
    }

    #[tokio::test]
    async fn secrets_are_scrubbed_from_output_and_log() {
        let dir = TempDir::new().unwrap();
        let runner = runner_with(&["ghp_supersecret"]);
        let output = runner
            .run(
                &spec(&dir, &["sh", "-c", "echo pushing with ghp_supersecret"]),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert!(!output.stdout.contains("ghp_supersecret"));
        assert!(output.stdout.contains("[REDACTED]"));
        let log = std::fs::read_to_string(dir.path().join("stage.log")).unwrap();
        assert!(!log.contains("ghp_supersecret"));
    }

    #[tokio::test]
    async fn secret_split_across_chunks_still_scrubs() {
        let dir = TempDir::new().unwrap();
        let runner = runner_with(&["ghp_supersecret"]);
        // Two writes with a flush-pause between them split the secret across
        // reader chunks.
        let output = runner
            .run(
                &spec(
                    &dir,
                    &[
                        "sh",
                        "-c",
                        "printf 'ghp_super'; sleep 0.2; printf 'secret'; echo",
                    ],
                ),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert!(!output.stdout.contains("ghp_supersecret"));
        assert!(output.stdout.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn check_failure_carries_last_stderr_line() {
        let dir = TempDir::new().unwrap();
        let runner = runner_with(&[]);
        let err = runner
            .run(
                &spec(&dir, &["sh", "-c", "echo first >&2; echo fatal: denied >&2; exit 3"]),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        match err {
            CommandError::Failed {
                exit_code,
                stderr_tail,
                ..
            } => {
                assert_eq!(exit_code, 3);
                assert!(stderr_tail.contains("fatal: denied"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn no_check_returns_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let runner = runner_with(&[]);
        let output = runner
            .run(
                &spec(&dir, &["sh", "-c", "exit 7"]).no_check(),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, 7);
    }

    #[tokio::test]
    async fn wall_timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let runner = runner_with(&[]);
        let started = Instant::now();
        let err = runner
            .run(
                &spec(&dir, &["sh", "-c", "sleep 30"])
                    .with_timeouts(Some(Duration::from_millis(300)), None),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::WallTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn idle_timeout_fires_without_output() {
        let dir = TempDir::new().unwrap();
        let runner = runner_with(&[]);
        let err = runner
            .run(
                &spec(&dir, &["sh", "-c", "sleep 30"])
                    .with_timeouts(None, Some(Duration::from_millis(300))),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::IdleTimeout(_)));
    }

    #[tokio::test]
    async fn output_resets_idle_watchdog() {
        let dir = TempDir::new().unwrap();
        let runner = runner_with(&[]);
        // Emits every 200ms for ~1s; idle window is 500ms, so the chunks keep
        // the watchdog from firing.
        let output = runner
            .run(
                &spec(
                    &dir,
                    &["sh", "-c", "for i in 1 2 3 4 5; do echo tick $i; sleep 0.2; done"],
                )
                .with_timeouts(None, Some(Duration::from_millis(500))),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert!(output.stdout.contains("tick 5"));
    }

    #[tokio::test]
    async fn cancellation_terminates_child() {
        let dir = TempDir::new().unwrap();
        let runner = runner_with(&[]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = runner
            .run(
                &spec(&dir, &["sh", "-c", "sleep 30"]),
                &cancel,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn chunk_callback_receives_scrubbed_output() {
        let dir = TempDir::new().unwrap();
        let runner = runner_with(&["topsecret"]);
        let seen: Arc<std::sync::Mutex<Vec<(StreamKind, String)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: Arc<ChunkCallback> = Arc::new(move |kind, chunk: &str| {
            sink.lock().unwrap().push((kind, chunk.to_string()));
        });
        runner
            .run(
                &spec(&dir, &["sh", "-c", "echo value topsecret here"]),
                &CancellationToken::new(),
                Some(callback),
            )
            .await
            .unwrap();
        let seen = seen.lock().unwrap();
        let combined: String = seen.iter().map(|(_, chunk)| chunk.as_str()).collect();
        assert!(combined.contains("[REDACTED]"));
        assert!(!combined.contains("topsecret"));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let runner = runner_with(&[]);
        let err = runner
            .run(
                &spec(&dir, &["definitely-not-a-binary-xyz"]),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
