//! Artifact naming and staging.
//!
//! Stages emit files into `workdir/<job_id>/artifacts/` under a fixed
//! naming scheme; the worker uploads them after execution. Zero-byte files
//! are dropped before upload.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

pub const PREPARE_LOG: &str = "logs/prepare.log";
pub const EXECUTE_LOG: &str = "logs/execute.log";
pub const PUBLISH_LOG: &str = "logs/publish.log";
pub const TASK_CONTEXT: &str = "task_context.json";
pub const PUBLISH_RESULT: &str = "publish_result.json";
pub const CHANGES_PATCH: &str = "patches/changes.patch";

/// Legacy execute-log name still produced by codex_exec handlers.
pub const LEGACY_EXECUTE_LOG: &str = "logs/codex_exec.log";

pub const CONTENT_TYPE_TEXT: &str = "text/plain";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_DIFF: &str = "text/x-diff";

/// Upload name for a step's log, 1-indexed.
pub fn step_log_name(step_index: usize) -> String {
    format!("logs/steps/step-{step_index:04}.log")
}

/// Upload name for a step's patch, 1-indexed.
pub fn step_patch_name(step_index: usize) -> String {
    format!("patches/steps/step-{step_index:04}.patch")
}

/// Upload name for a container run record under its artifacts subdir.
pub fn container_run_record_name(artifacts_subdir: &str) -> String {
    format!("{artifacts_subdir}/metadata/run.json")
}

/// A file staged for upload to the control plane.
#[derive(Debug, Clone)]
pub struct ArtifactUpload {
    /// Absolute path of the local file.
    pub path: PathBuf,
    /// Upload name (slash-separated, relative to the job's artifact root).
    pub name: String,
    pub content_type: Option<String>,
    pub digest: Option<String>,
}

impl ArtifactUpload {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, content_type: &str) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            content_type: Some(content_type.to_string()),
            digest: None,
        }
    }

    /// Whether the staged file should actually be uploaded.
    pub fn is_uploadable(&self) -> bool {
        std::fs::metadata(&self.path).is_ok_and(|meta| meta.is_file() && meta.len() > 0)
    }
}

/// SHA-256 digest of a file, rendered as `sha256:<hex>`.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// SHA-256 hex digest of in-memory text (diff hashes, signatures).
pub fn sha256_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn step_names_are_zero_padded() {
        assert_eq!(step_log_name(1), "logs/steps/step-0001.log");
        assert_eq!(step_patch_name(12), "patches/steps/step-0012.patch");
        assert_eq!(step_log_name(1234), "logs/steps/step-1234.log");
    }

    #[test]
    fn container_run_record_uses_subdir() {
        assert_eq!(
            container_run_record_name("container"),
            "container/metadata/run.json"
        );
        assert_eq!(
            container_run_record_name("build/out"),
            "build/out/metadata/run.json"
        );
    }

    #[test]
    fn zero_byte_files_are_not_uploadable() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.log");
        std::fs::write(&empty, "").unwrap();
        let artifact = ArtifactUpload::new(&empty, PREPARE_LOG, CONTENT_TYPE_TEXT);
        assert!(!artifact.is_uploadable());

        let full = dir.path().join("full.log");
        std::fs::write(&full, "line\n").unwrap();
        let artifact = ArtifactUpload::new(&full, PREPARE_LOG, CONTENT_TYPE_TEXT);
        assert!(artifact.is_uploadable());
    }

    #[test]
    fn missing_files_are_not_uploadable() {
        let artifact = ArtifactUpload::new("/nonexistent/file.log", EXECUTE_LOG, CONTENT_TYPE_TEXT);
        assert!(!artifact.is_uploadable());
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, "hello").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn sha256_text_is_stable() {
        assert_eq!(sha256_text("diff"), sha256_text("diff"));
        assert_ne!(sha256_text("diff"), sha256_text("other"));
    }
}
