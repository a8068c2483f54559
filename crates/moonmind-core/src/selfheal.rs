//! Self-heal bookkeeping: attempt budgets, failure signatures, strategy
//! selection.
//!
//! The controller tracks one active step at a time. Each failed attempt is
//! fingerprinted (signature + diff hash); when consecutive attempts produce
//! the identical pair the step is classified as stuck and the reset strategy
//! escalates. Budgets are hard: exceeding them raises a terminal error.

use crate::artifacts::sha256_text;
use crate::redact::SecretRedactor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelfHealError {
    #[error("attempt budget exhausted for {step_id} (max={max})")]
    AttemptBudgetExceeded { step_id: String, max: u32 },
    #[error("hard reset budget exhausted (max={max})")]
    HardResetBudgetExceeded { max: u32 },
    #[error("begin_step must be called before new_attempt")]
    NoActiveStep,
}

pub type Result<T> = std::result::Result<T, SelfHealError>;

/// Runtime-configurable self-heal thresholds. All values are >= 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfHealConfig {
    pub step_max_attempts: u32,
    pub step_timeout_seconds: u64,
    pub step_idle_timeout_seconds: u64,
    pub step_no_progress_limit: u32,
    pub job_max_resets: u32,
}

impl Default for SelfHealConfig {
    fn default() -> Self {
        Self {
            step_max_attempts: 3,
            step_timeout_seconds: 900,
            step_idle_timeout_seconds: 300,
            step_no_progress_limit: 2,
            job_max_resets: 1,
        }
    }
}

/// Classification buckets that determine retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    TransientRuntime,
    StuckNoProgress,
    DeterministicContract,
    DeterministicPolicy,
    DeterministicRepo,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientRuntime => "transient_runtime",
            Self::StuckNoProgress => "stuck_no_progress",
            Self::DeterministicContract => "deterministic_contract",
            Self::DeterministicPolicy => "deterministic_policy",
            Self::DeterministicRepo => "deterministic_repo",
        }
    }

    /// Whether this class supports further in-job retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientRuntime | Self::StuckNoProgress)
    }
}

/// Classify a failed command by its observable output.
///
/// Git contract breakage (missing refs, conflicts) is deterministic and
/// needs operator input. Everything else classifies as transient.
pub fn classify_command_failure(message: &str) -> FailureClass {
    let lower = message.to_lowercase();
    const REPO_MARKERS: [&str; 6] = [
        "couldn't find remote ref",
        "unknown revision",
        "merge conflict",
        "conflict (content)",
        "pathspec",
        "not something we can merge",
    ];
    if REPO_MARKERS.iter().any(|marker| lower.contains(marker)) {
        FailureClass::DeterministicRepo
    } else {
        FailureClass::TransientRuntime
    }
}

/// Strategy selected for the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealStrategy {
    None,
    SoftReset,
    HardReset,
    QueueRetry,
    OperatorRequest,
}

impl HealStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SoftReset => "soft_reset",
            Self::HardReset => "hard_reset",
            Self::QueueRetry => "queue_retry",
            Self::OperatorRequest => "operator_request",
        }
    }
}

/// Normalized, scrubbed failure fingerprint used for no-progress detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSignature {
    pub value: String,
    pub fingerprint: String,
}

impl FailureSignature {
    fn from_normalized(value: String) -> Self {
        let fingerprint = sha256_text(&value);
        Self { value, fingerprint }
    }

    pub fn matches(&self, other: Option<&FailureSignature>) -> bool {
        other.is_some_and(|o| o.fingerprint == self.fingerprint)
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Build a failure signature from attempt context.
///
/// Parts are joined, whitespace-collapsed, scrubbed, and lowercased before
/// hashing so formatting jitter does not defeat the comparison.
pub fn build_failure_signature(
    redactor: &SecretRedactor,
    step_id: Option<&str>,
    skill_id: Option<&str>,
    exit_code: Option<i32>,
    hint: Option<&str>,
    message: Option<&str>,
) -> Option<FailureSignature> {
    let mut parts: Vec<String> = Vec::new();
    if let Some(step_id) = step_id {
        parts.push(format!("step:{step_id}"));
    }
    if let Some(skill_id) = skill_id {
        parts.push(format!("skill:{skill_id}"));
    }
    if let Some(code) = exit_code {
        parts.push(format!("exit:{code}"));
    }
    if let Some(hint) = hint {
        parts.push(format!("hint:{hint}"));
    }
    if let Some(message) = message {
        parts.push(message.to_string());
    }
    if parts.is_empty() {
        return None;
    }
    let joined = collapse_whitespace(&parts.join(" | "));
    let scrubbed = redactor.scrub(&joined).to_lowercase();
    Some(FailureSignature::from_normalized(scrubbed))
}

/// Mutable bookkeeping for one step's attempts.
#[derive(Debug, Clone)]
pub struct StepAttemptState {
    pub step_id: String,
    pub step_index: usize,
    pub attempts: u32,
    pub consecutive_no_progress: u32,
    pub last_failure_signature: Option<FailureSignature>,
    pub last_diff_hash: Option<String>,
}

impl StepAttemptState {
    pub fn new(step_id: &str, step_index: usize) -> Self {
        Self {
            step_id: step_id.to_string(),
            step_index,
            attempts: 0,
            consecutive_no_progress: 0,
            last_failure_signature: None,
            last_diff_hash: None,
        }
    }

    /// Increment the attempt counter, enforcing the configured budget.
    pub fn next_attempt(&mut self, max_attempts: u32) -> Result<u32> {
        if self.attempts >= max_attempts {
            return Err(SelfHealError::AttemptBudgetExceeded {
                step_id: self.step_id.clone(),
                max: max_attempts,
            });
        }
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// Track a failed attempt; returns true when it matched the previous
    /// attempt's (signature, diff hash) pair.
    pub fn record_failure(
        &mut self,
        signature: Option<FailureSignature>,
        diff_hash: Option<String>,
    ) -> bool {
        let matched = signature.as_ref().is_some_and(|sig| {
            sig.matches(self.last_failure_signature.as_ref()) && diff_hash == self.last_diff_hash
        });
        if matched {
            self.consecutive_no_progress += 1;
        } else {
            self.consecutive_no_progress = u32::from(signature.is_some());
        }
        self.last_failure_signature = signature;
        self.last_diff_hash = diff_hash;
        matched
    }

    /// Clear the no-progress window after a successful attempt.
    pub fn reset_after_success(&mut self) {
        self.consecutive_no_progress = 0;
        self.last_failure_signature = None;
        self.last_diff_hash = None;
    }
}

/// Job-level controller state (hard reset budget).
#[derive(Debug, Clone, Copy, Default)]
pub struct JobHealState {
    pub resets_consumed: u32,
}

impl JobHealState {
    /// Consume one hard reset slot.
    pub fn reserve_hard_reset(&mut self, max_resets: u32) -> Result<()> {
        if self.resets_consumed >= max_resets {
            return Err(SelfHealError::HardResetBudgetExceeded { max: max_resets });
        }
        self.resets_consumed += 1;
        Ok(())
    }

    pub fn can_hard_reset(&self, max_resets: u32) -> bool {
        self.resets_consumed < max_resets
    }
}

/// Pick the recovery strategy for the next attempt of a failed step.
pub fn select_strategy(
    class: FailureClass,
    step: &StepAttemptState,
    job: &JobHealState,
    config: &SelfHealConfig,
) -> HealStrategy {
    if !class.is_retryable() {
        return HealStrategy::OperatorRequest;
    }

    let stuck = step.consecutive_no_progress >= config.step_no_progress_limit
        || class == FailureClass::StuckNoProgress;
    if stuck {
        if job.can_hard_reset(config.job_max_resets) && step.attempts < config.step_max_attempts {
            return HealStrategy::HardReset;
        }
        return HealStrategy::QueueRetry;
    }

    if step.attempts < config.step_max_attempts {
        HealStrategy::SoftReset
    } else {
        HealStrategy::QueueRetry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redactor() -> SecretRedactor {
        SecretRedactor::new(["hush-hush"], "[REDACTED]")
    }

    fn config() -> SelfHealConfig {
        SelfHealConfig::default()
    }

    #[test]
    fn defaults_match_documented_budgets() {
        let config = SelfHealConfig::default();
        assert_eq!(config.step_max_attempts, 3);
        assert_eq!(config.step_timeout_seconds, 900);
        assert_eq!(config.step_idle_timeout_seconds, 300);
        assert_eq!(config.step_no_progress_limit, 2);
        assert_eq!(config.job_max_resets, 1);
    }

    #[test]
    fn signature_normalizes_whitespace_and_case() {
        let redactor = redactor();
        let a = build_failure_signature(
            &redactor,
            Some("build"),
            None,
            Some(1),
            None,
            Some("Compile   FAILED\n  at main.rs"),
        )
        .unwrap();
        let b = build_failure_signature(
            &redactor,
            Some("build"),
            None,
            Some(1),
            None,
            Some("compile failed at main.rs"),
        )
        .unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn signature_scrubs_secrets() {
        let redactor = redactor();
        let sig = build_failure_signature(
            &redactor,
            Some("push"),
            None,
            Some(128),
            None,
            Some("auth failed with hush-hush"),
        )
        .unwrap();
        assert!(!sig.value.contains("hush-hush"));
        assert!(sig.value.contains("[redacted]"));
    }

    #[test]
    fn signature_requires_at_least_one_part() {
        let redactor = redactor();
        assert!(build_failure_signature(&redactor, None, None, None, None, None).is_none());
    }

    #[test]
    fn attempt_budget_enforced() {
        let mut step = StepAttemptState::new("s1", 0);
        assert_eq!(step.next_attempt(2).unwrap(), 1);
        assert_eq!(step.next_attempt(2).unwrap(), 2);
        let err = step.next_attempt(2).unwrap_err();
        assert!(matches!(err, SelfHealError::AttemptBudgetExceeded { .. }));
    }

    #[test]
    fn no_progress_requires_matching_pair() {
        let redactor = redactor();
        let mut step = StepAttemptState::new("s1", 0);
        let sig =
            build_failure_signature(&redactor, Some("s1"), None, Some(1), None, Some("boom"));

        assert!(!step.record_failure(sig.clone(), Some("hash-a".to_string())));
        assert_eq!(step.consecutive_no_progress, 1);

        // Same signature, different diff: progress was made.
        assert!(!step.record_failure(sig.clone(), Some("hash-b".to_string())));
        assert_eq!(step.consecutive_no_progress, 1);

        // Identical pair: stuck.
        assert!(step.record_failure(sig, Some("hash-b".to_string())));
        assert_eq!(step.consecutive_no_progress, 2);
    }

    #[test]
    fn success_resets_no_progress_window() {
        let redactor = redactor();
        let mut step = StepAttemptState::new("s1", 0);
        let sig = build_failure_signature(&redactor, Some("s1"), None, Some(1), None, Some("x"));
        step.record_failure(sig, None);
        step.reset_after_success();
        assert_eq!(step.consecutive_no_progress, 0);
        assert!(step.last_failure_signature.is_none());
        assert!(step.last_diff_hash.is_none());
    }

    #[test]
    fn hard_reset_budget_enforced() {
        let mut job = JobHealState::default();
        assert!(job.can_hard_reset(1));
        job.reserve_hard_reset(1).unwrap();
        assert!(!job.can_hard_reset(1));
        let err = job.reserve_hard_reset(1).unwrap_err();
        assert!(matches!(err, SelfHealError::HardResetBudgetExceeded { .. }));
    }

    #[test]
    fn transient_failure_selects_soft_reset_within_budget() {
        let mut step = StepAttemptState::new("s1", 0);
        step.next_attempt(3).unwrap();
        let strategy = select_strategy(
            FailureClass::TransientRuntime,
            &step,
            &JobHealState::default(),
            &config(),
        );
        assert_eq!(strategy, HealStrategy::SoftReset);
    }

    #[test]
    fn stuck_step_escalates_to_hard_reset() {
        let mut step = StepAttemptState::new("s1", 0);
        step.next_attempt(3).unwrap();
        step.consecutive_no_progress = 2;
        let strategy = select_strategy(
            FailureClass::StuckNoProgress,
            &step,
            &JobHealState::default(),
            &config(),
        );
        assert_eq!(strategy, HealStrategy::HardReset);
    }

    #[test]
    fn stuck_step_without_reset_budget_surrenders() {
        let mut step = StepAttemptState::new("s1", 0);
        step.next_attempt(3).unwrap();
        step.consecutive_no_progress = 2;
        let job = JobHealState { resets_consumed: 1 };
        let strategy = select_strategy(FailureClass::StuckNoProgress, &step, &job, &config());
        assert_eq!(strategy, HealStrategy::QueueRetry);
    }

    #[test]
    fn deterministic_failure_requests_operator() {
        let step = StepAttemptState::new("s1", 0);
        for class in [
            FailureClass::DeterministicContract,
            FailureClass::DeterministicPolicy,
            FailureClass::DeterministicRepo,
        ] {
            let strategy = select_strategy(class, &step, &JobHealState::default(), &config());
            assert_eq!(strategy, HealStrategy::OperatorRequest);
        }
    }

    #[test]
    fn exhausted_transient_budget_surrenders_to_queue() {
        let mut step = StepAttemptState::new("s1", 0);
        for _ in 0..3 {
            step.next_attempt(3).unwrap();
        }
        let strategy = select_strategy(
            FailureClass::TransientRuntime,
            &step,
            &JobHealState::default(),
            &config(),
        );
        assert_eq!(strategy, HealStrategy::QueueRetry);
    }

    #[test]
    fn repo_breakage_classified_deterministic() {
        assert_eq!(
            classify_command_failure("fatal: couldn't find remote ref refs/heads/nope"),
            FailureClass::DeterministicRepo
        );
        assert_eq!(
            classify_command_failure("CONFLICT (content): Merge conflict in src/lib.rs"),
            FailureClass::DeterministicRepo
        );
        assert_eq!(
            classify_command_failure("connection reset by peer"),
            FailureClass::TransientRuntime
        );
    }
}
