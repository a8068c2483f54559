//! End-to-end worker cycles against a mock control plane and local git
//! remotes.
//!
//! Each test wires a wiremock queue API, a bare origin repository, and a
//! stub agent CLI, then drives `Worker::run_once` and asserts on the
//! terminal transition, emitted events, and artifact state.

use moonmind_core::WorkerConfig;
use moonmind_worker::Worker;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const JOB_ID: &str = "0191f2a0-2f2f-7cc0-b1aa-0123456789ab";

fn job_id() -> Uuid {
    Uuid::parse_str(JOB_ID).unwrap()
}

fn git_in(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create a bare origin with one commit on main; returns its path.
fn setup_bare_origin(root: &Path) -> PathBuf {
    let work = root.join("seed");
    std::fs::create_dir_all(&work).unwrap();
    git_in(&work, &["init", "--initial-branch", "main"]);
    git_in(&work, &["config", "user.email", "seed@test.invalid"]);
    git_in(&work, &["config", "user.name", "Seed"]);
    std::fs::write(work.join("README.md"), "# seed\n").unwrap();
    git_in(&work, &["add", "."]);
    git_in(&work, &["commit", "-m", "initial"]);

    let origin = root.join("origin.git");
    let output = Command::new("git")
        .args([
            "clone",
            "--bare",
            &work.to_string_lossy(),
            &origin.to_string_lossy(),
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    origin
}

/// Write an executable stub agent CLI.
fn write_fake_agent(root: &Path, body: &str) -> PathBuf {
    let path = root.join("fake-claude");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

fn worker_for(server: &MockServer, workdir: &Path, agent: &Path, extra: &[(&str, &str)]) -> Worker {
    let mut pairs: HashMap<String, String> = HashMap::from([
        ("MOONMIND_URL".to_string(), server.uri()),
        ("MOONMIND_WORKER_ID".to_string(), "it-worker".to_string()),
        (
            "MOONMIND_WORKDIR".to_string(),
            workdir.to_string_lossy().into_owned(),
        ),
        ("MOONMIND_WORKER_RUNTIME".to_string(), "claude".to_string()),
        (
            "MOONMIND_CLAUDE_BINARY".to_string(),
            agent.to_string_lossy().into_owned(),
        ),
        ("MOONMIND_LEASE_SECONDS".to_string(), "3".to_string()),
    ]);
    for (key, value) in extra {
        pairs.insert((*key).to_string(), (*value).to_string());
    }
    let lookup = move |key: &str| pairs.get(key).cloned();
    Worker::new(WorkerConfig::from_lookup(&lookup).unwrap())
}

fn task_payload(repository: &str) -> serde_json::Value {
    json!({
        "repository": repository,
        "targetRuntime": "claude",
        "requiredCapabilities": ["claude", "git"],
        "task": {
            "instructions": "add notes",
            "skill": {"id": "auto"},
            "publish": {"mode": "branch"}
        }
    })
}

/// Mount the endpoints every scenario needs. Individual tests add their
/// terminal-transition expectations on top.
async fn mount_common(server: &MockServer, payload: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/api/queue/jobs/claim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "job": {"id": job_id(), "type": "task", "payload": payload}
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/events")))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/artifacts/upload")))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/heartbeat")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn happy_path_publishes_branch_and_completes() {
    let dir = TempDir::new().unwrap();
    let origin = setup_bare_origin(dir.path());
    let agent = write_fake_agent(dir.path(), "echo working; echo done > notes.txt");
    let server = MockServer::start().await;
    mount_common(&server, task_payload(&origin.to_string_lossy())).await;

    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/complete")))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/fail")))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let worker = worker_for(&server, &dir.path().join("work"), &agent, &[]);
    let claimed = worker.run_once().await.unwrap();
    assert!(claimed);

    // The working branch landed on the origin.
    let branches = Command::new("git")
        .args(["branch", "--list", "task/*"])
        .current_dir(&origin)
        .output()
        .unwrap();
    let listing = String::from_utf8_lossy(&branches.stdout).into_owned();
    assert!(listing.contains("task/"), "origin branches: {listing}");

    // publish_result.json records the push.
    let publish_result_path = dir
        .path()
        .join("work")
        .join(JOB_ID)
        .join("artifacts/publish_result.json");
    let publish_result: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(publish_result_path).unwrap()).unwrap();
    assert_eq!(publish_result["skipped"], false);
    assert_eq!(publish_result["mode"], "branch");
    assert!(publish_result["branch"].as_str().unwrap().starts_with("task/"));

    // Stage events paired up.
    let requests = server.received_requests().await.unwrap();
    let bodies: Vec<String> = requests
        .iter()
        .map(|request| String::from_utf8_lossy(&request.body).into_owned())
        .collect();
    let all = bodies.join("\n");
    for stage in ["moonmind.task.prepare", "moonmind.task.execute", "moonmind.task.publish"] {
        assert!(
            all.contains(&format!("\"stage\":\"{stage}\",\"status\":\"started\""))
                || all.contains(&format!("\"stage\":\"{stage}\"")),
            "missing {stage} events"
        );
    }
    assert!(all.contains("task.git.defaultBranchResolved"));
}

#[tokio::test]
async fn empty_diff_skips_publish_with_reason() {
    let dir = TempDir::new().unwrap();
    let origin = setup_bare_origin(dir.path());
    let agent = write_fake_agent(dir.path(), "echo looked around, changed nothing");
    let server = MockServer::start().await;
    mount_common(&server, task_payload(&origin.to_string_lossy())).await;

    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/complete")))
        .and(body_partial_json(json!({"workerId": "it-worker"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let worker = worker_for(&server, &dir.path().join("work"), &agent, &[]);
    assert!(worker.run_once().await.unwrap());

    let publish_result_path = dir
        .path()
        .join("work")
        .join(JOB_ID)
        .join("artifacts/publish_result.json");
    let publish_result: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(publish_result_path).unwrap()).unwrap();
    assert_eq!(publish_result["skipped"], true);
    assert_eq!(publish_result["reason"], "no local changes");
}

#[tokio::test]
async fn capability_mismatch_fails_closed_without_executing() {
    let dir = TempDir::new().unwrap();
    let origin = setup_bare_origin(dir.path());
    // The stub would leave a marker if it ever ran.
    let agent = write_fake_agent(dir.path(), "touch agent-ran.marker");
    let server = MockServer::start().await;

    let mut payload = task_payload(&origin.to_string_lossy());
    payload["requiredCapabilities"] = json!(["claude", "git", "qdrant"]);
    mount_common(&server, payload).await;

    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/fail")))
        .and(body_partial_json(json!({"retryable": false})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/complete")))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let worker = worker_for(&server, &dir.path().join("work"), &agent, &[]);
    assert!(worker.run_once().await.unwrap());

    let requests = server.received_requests().await.unwrap();
    let fail_body = requests
        .iter()
        .find(|request| request.url.path().ends_with("/fail"))
        .map(|request| String::from_utf8_lossy(&request.body).into_owned())
        .expect("fail request sent");
    assert!(fail_body.contains("missing required capabilities"));
    assert!(fail_body.contains("qdrant"));

    // The agent never ran and no workspace was prepared.
    assert!(!dir.path().join("agent-ran.marker").exists());
    assert!(!dir.path().join("work").join(JOB_ID).join("repo").exists());
}

#[tokio::test]
async fn tokenized_repository_url_is_rejected_and_never_leaked() {
    let dir = TempDir::new().unwrap();
    let agent = write_fake_agent(dir.path(), "true");
    let server = MockServer::start().await;

    let mut payload = task_payload("placeholder");
    payload["repository"] = json!("https://ghp_supersecret123@github.com/Owner/Repo.git");
    mount_common(&server, payload).await;

    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/fail")))
        .and(body_partial_json(json!({"retryable": false})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let worker = worker_for(&server, &dir.path().join("work"), &agent, &[]);
    assert!(worker.run_once().await.unwrap());

    let requests = server.received_requests().await.unwrap();
    let fail_body = requests
        .iter()
        .find(|request| request.url.path().ends_with("/fail"))
        .map(|request| String::from_utf8_lossy(&request.body).into_owned())
        .expect("fail request sent");
    assert!(fail_body.contains("embedded credentials"));

    // The token literal from the payload never leaves the worker.
    for request in &requests {
        if request.url.path().ends_with("/claim") {
            continue;
        }
        let body = String::from_utf8_lossy(&request.body);
        assert!(
            !body.contains("ghp_supersecret123"),
            "token leaked to {}",
            request.url.path()
        );
    }
}

#[tokio::test]
async fn server_cancellation_acks_without_other_terminal() {
    let dir = TempDir::new().unwrap();
    let origin = setup_bare_origin(dir.path());
    let agent = write_fake_agent(dir.path(), "sleep 30");
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/queue/jobs/claim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "job": {
                "id": job_id(),
                "type": "task",
                "payload": task_payload(&origin.to_string_lossy())
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/api/queue/jobs/.*/events"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/api/queue/jobs/.*/artifacts/upload"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    // Every heartbeat asks for cancellation.
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/heartbeat")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "cancelRequestedAt": "2026-08-01T10:00:00Z"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/ack-cancel")))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/complete")))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/fail")))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let worker = worker_for(&server, &dir.path().join("work"), &agent, &[]);
    let started = std::time::Instant::now();
    assert!(worker.run_once().await.unwrap());
    // The 30s agent died early via cancellation, not by running out.
    assert!(started.elapsed() < std::time::Duration::from_secs(20));
}

#[tokio::test]
async fn idle_timeout_exhausts_self_heal_and_surrenders_to_queue() {
    let dir = TempDir::new().unwrap();
    let origin = setup_bare_origin(dir.path());
    let agent = write_fake_agent(dir.path(), "sleep 30");
    let server = MockServer::start().await;
    mount_common(&server, task_payload(&origin.to_string_lossy())).await;

    // Exhausted retries surrender the job back to the queue as retryable.
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/fail")))
        .and(body_partial_json(json!({"retryable": true})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/complete")))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let worker = worker_for(
        &server,
        &dir.path().join("work"),
        &agent,
        &[
            ("STEP_IDLE_TIMEOUT_SECONDS", "1"),
            ("STEP_TIMEOUT_SECONDS", "60"),
            ("STEP_MAX_ATTEMPTS", "3"),
            ("STEP_NO_PROGRESS_LIMIT", "2"),
            ("JOB_SELF_HEAL_MAX_RESETS", "1"),
        ],
    );
    assert!(worker.run_once().await.unwrap());

    // Every attempt tripped the idle watchdog; the stuck window triggered
    // no-progress escalation.
    assert!(worker.metrics().idle_timeouts() >= 2);
    assert!(worker.metrics().self_heal_attempts() >= 2);
    assert!(worker.metrics().no_progress_trips() >= 1);

    let requests = server.received_requests().await.unwrap();
    let all: String = requests
        .iter()
        .map(|request| String::from_utf8_lossy(&request.body).into_owned())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(all.contains("task.step.idle_timeout"));
}

#[tokio::test]
async fn multi_step_task_uploads_step_artifacts_in_order() {
    let dir = TempDir::new().unwrap();
    let origin = setup_bare_origin(dir.path());
    let agent = write_fake_agent(
        dir.path(),
        // Each invocation appends its instruction marker.
        "echo \"$2\" >> steps.txt",
    );
    let server = MockServer::start().await;

    let mut payload = task_payload(&origin.to_string_lossy());
    payload["task"]["steps"] = json!([
        {"id": "first", "instructions": "step-one"},
        {"id": "second", "instructions": "step-two"}
    ]);
    mount_common(&server, payload).await;

    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/complete")))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let worker = worker_for(&server, &dir.path().join("work"), &agent, &[]);
    assert!(worker.run_once().await.unwrap());

    let artifacts_dir = dir.path().join("work").join(JOB_ID).join("artifacts");
    assert!(artifacts_dir.join("logs/steps/step-0001.log").exists());
    assert!(artifacts_dir.join("logs/steps/step-0002.log").exists());
    assert!(artifacts_dir.join("patches/steps/step-0001.patch").exists());
    assert!(artifacts_dir.join("patches/steps/step-0002.patch").exists());

    // Both steps ran, in order.
    let steps_file = dir
        .path()
        .join("work")
        .join(JOB_ID)
        .join("repo/steps.txt");
    let contents = std::fs::read_to_string(steps_file).unwrap();
    assert!(contents.contains("step-one"));
    assert!(contents.contains("step-two"));

    // Cumulative patch captures the whole change set.
    let changes = std::fs::read_to_string(artifacts_dir.join("patches/changes.patch")).unwrap();
    assert!(changes.contains("steps.txt"));

    let requests = server.received_requests().await.unwrap();
    let all: String = requests
        .iter()
        .map(|request| String::from_utf8_lossy(&request.body).into_owned())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(all.contains("task.step.started"));
    assert!(all.contains("task.step.finished"));
}

#[tokio::test]
async fn task_context_snapshot_is_written_and_redacted() {
    let dir = TempDir::new().unwrap();
    let origin = setup_bare_origin(dir.path());
    let agent = write_fake_agent(dir.path(), "true");
    let server = MockServer::start().await;
    mount_common(&server, task_payload(&origin.to_string_lossy())).await;
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/jobs/{JOB_ID}/complete")))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let worker = worker_for(&server, &dir.path().join("work"), &agent, &[]);
    assert!(worker.run_once().await.unwrap());

    let context_path = dir
        .path()
        .join("work")
        .join(JOB_ID)
        .join("artifacts/task_context.json");
    let context: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(context_path).unwrap()).unwrap();
    assert_eq!(context["runtime"], "claude");
    // Environment-dependent: a GITHUB_TOKEN in the test environment shifts
    // the source from "none" to the env fallback.
    let source = context["auth"]["repoAuthSource"].as_str().unwrap();
    assert!(source == "none" || source == "env:GITHUB_TOKEN", "{source}");
    assert_eq!(context["resolved"]["defaultBranch"], "main");
    assert!(context["resolved"]["workingBranch"]
        .as_str()
        .unwrap()
        .starts_with("task/"));
}
