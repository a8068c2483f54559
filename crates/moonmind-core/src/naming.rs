//! Branch naming for task workspaces.
//!
//! Synthesized branches follow `task/<date>/<jobid8>[/<skill>]`; all emitted
//! names are sanitized to git-safe characters and bounded in length.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Maximum length of an emitted branch name.
pub const MAX_BRANCH_LEN: usize = 200;

/// Replace characters outside `[A-Za-z0-9._/-]` with `-` and collapse runs.
pub fn sanitize_branch_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.chars() {
        let mapped = if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-') {
            c
        } else {
            '-'
        };
        if mapped == '-' {
            if last_dash {
                continue;
            }
            last_dash = true;
        } else {
            last_dash = false;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches(|c| c == '-' || c == '/');
    let mut name = trimmed.to_string();
    name.truncate(MAX_BRANCH_LEN);
    name
}

/// Short hex prefix of a job id used in branch names.
pub fn job_id_short(job_id: Uuid) -> String {
    job_id.simple().to_string()[..8].to_string()
}

/// Synthesize a working branch for a job.
///
/// Deterministic for a given `(job_id, date, skill)` triple.
pub fn generate_branch_name(job_id: Uuid, at: DateTime<Utc>, skill: Option<&str>) -> String {
    let date = at.format("%Y%m%d");
    let short = job_id_short(job_id);
    let base = match skill {
        Some(skill) if !skill.is_empty() && skill != "auto" => {
            format!("task/{date}/{short}/{skill}")
        }
        _ => format!("task/{date}/{short}"),
    };
    sanitize_branch_name(&base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job() -> Uuid {
        Uuid::parse_str("0191f2a0-2f2f-7cc0-b1aa-0123456789ab").unwrap()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize_branch_name("feat ure"), "feat-ure");
        assert_eq!(sanitize_branch_name("a@@b"), "a-b");
        assert_eq!(sanitize_branch_name("task/ok_name.v2"), "task/ok_name.v2");
    }

    #[test]
    fn sanitize_collapses_dash_runs() {
        assert_eq!(sanitize_branch_name("a!!!b"), "a-b");
        assert_eq!(sanitize_branch_name("--edge--"), "edge");
    }

    #[test]
    fn sanitize_bounds_length() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_branch_name(&long).len(), MAX_BRANCH_LEN);
    }

    #[test]
    fn branch_name_is_deterministic() {
        let a = generate_branch_name(job(), at(), Some("speckit"));
        let b = generate_branch_name(job(), at(), Some("speckit"));
        assert_eq!(a, b);
        assert_eq!(a, "task/20260801/0191f2a0/speckit");
    }

    #[test]
    fn branch_name_without_skill() {
        assert_eq!(generate_branch_name(job(), at(), None), "task/20260801/0191f2a0");
        assert_eq!(
            generate_branch_name(job(), at(), Some("auto")),
            "task/20260801/0191f2a0"
        );
    }

    #[test]
    fn emitted_names_match_git_safe_charset() {
        let name = generate_branch_name(job(), at(), Some("weird skill!"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-')));
        assert!(name.len() <= MAX_BRANCH_LEN);
    }
}
