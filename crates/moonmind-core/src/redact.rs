//! Secret redaction for outbound text.
//!
//! Every string that leaves the worker (events, log lines, artifacts,
//! terminal error messages) passes through a [`SecretRedactor`]. Known
//! secrets are replaced along with their base64 and URL-encoded variants so
//! a value that was re-encoded in transit still scrubs.

use base64::Engine;
use std::sync::RwLock;

const SENSITIVE_KEY_MARKERS: [&str; 6] =
    ["token", "secret", "password", "key", "credential", "auth"];

const DEFAULT_PLACEHOLDER: &str = "[REDACTED]";

/// Whether an environment variable name looks like it holds a secret.
///
/// A marker counts only when it is not embedded inside a longer word, so
/// `GITHUB_TOKEN` and `authToken` match while `monkeys` does not.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    for marker in SENSITIVE_KEY_MARKERS {
        let mut start = 0;
        while let Some(pos) = lower[start..].find(marker) {
            let at = start + pos;
            let end = at + marker.len();
            let before_ok = at == 0 || !bytes[at - 1].is_ascii_alphanumeric();
            let after_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
            if before_ok && after_ok {
                return true;
            }
            start = at + 1;
        }
    }
    false
}

fn variants(secret: &str) -> Vec<String> {
    let mut out = vec![secret.to_string()];
    let encoded = base64::engine::general_purpose::STANDARD.encode(secret.as_bytes());
    if encoded != secret {
        out.push(encoded);
    }
    let quoted = urlencoding::encode(secret).into_owned();
    if quoted != secret && !out.contains(&quoted) {
        out.push(quoted);
    }
    out
}

/// Replaces registered secret values (and their encoded variants) in text.
///
/// The variant set is append-only: values registered at runtime (resolved
/// Vault tokens) are added but never removed, so concurrent readers only
/// ever see a superset of what they saw before.
#[derive(Debug)]
pub struct SecretRedactor {
    placeholder: String,
    variants: RwLock<Vec<String>>,
}

impl SecretRedactor {
    /// Build a redactor over an explicit set of secrets.
    pub fn new<I, S>(secrets: I, placeholder: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen: Vec<String> = Vec::new();
        for secret in secrets {
            let secret = secret.as_ref();
            if secret.is_empty() {
                continue;
            }
            for variant in variants(secret) {
                if !variant.is_empty() && !seen.contains(&variant) {
                    seen.push(variant);
                }
            }
        }
        seen.sort_by(|a, b| b.len().cmp(&a.len()));
        Self {
            placeholder: placeholder.to_string(),
            variants: RwLock::new(seen),
        }
    }

    /// Scan the process environment for secret-looking variables.
    pub fn from_env() -> Self {
        Self::from_env_with_placeholder(DEFAULT_PLACEHOLDER)
    }

    pub fn from_env_with_placeholder(placeholder: &str) -> Self {
        let secrets: Vec<String> = std::env::vars()
            .filter(|(key, value)| is_sensitive_key(key) && !value.is_empty())
            .map(|(_, value)| value)
            .collect();
        Self::new(secrets, placeholder)
    }

    /// Register an additional secret value at runtime.
    pub fn register(&self, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        let mut guard = self.variants.write().unwrap_or_else(|e| e.into_inner());
        for variant in variants(value) {
            if !variant.is_empty() && !guard.contains(&variant) {
                guard.push(variant);
            }
        }
        guard.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    /// Length of the longest registered variant.
    ///
    /// Streaming consumers hold back this many trailing bytes so a secret
    /// split across chunk boundaries still scrubs.
    pub fn longest_secret_len(&self) -> usize {
        let guard = self.variants.read().unwrap_or_else(|e| e.into_inner());
        guard.first().map_or(0, |longest| longest.len())
    }

    /// Replace every known secret variant in `text`, longest first.
    pub fn scrub(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }
        let guard = self.variants.read().unwrap_or_else(|e| e.into_inner());
        let mut scrubbed = text.to_string();
        for variant in guard.iter() {
            if scrubbed.contains(variant.as_str()) {
                scrubbed = scrubbed.replace(variant.as_str(), &self.placeholder);
            }
        }
        scrubbed
    }

    /// Recursively scrub string leaves of a JSON value.
    pub fn scrub_value(&self, value: &serde_json::Value) -> serde_json::Value {
        use serde_json::Value;
        match value {
            Value::String(text) => Value::String(self.scrub(text)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.scrub_value(item)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| (key.clone(), self.scrub_value(item)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_keys_match_on_word_boundaries() {
        assert!(is_sensitive_key("GITHUB_TOKEN"));
        assert!(is_sensitive_key("MOONMIND_WORKER_TOKEN"));
        assert!(is_sensitive_key("api-key"));
        assert!(is_sensitive_key("auth"));
        assert!(is_sensitive_key("DB_PASSWORD"));
        assert!(!is_sensitive_key("MONKEYS"));
        assert!(!is_sensitive_key("TURNKEYS"));
        assert!(!is_sensitive_key("PATH"));
    }

    #[test]
    fn scrub_replaces_raw_value() {
        let redactor = SecretRedactor::new(["ghp_abcdef123"], "[REDACTED]");
        assert_eq!(
            redactor.scrub("token is ghp_abcdef123 here"),
            "token is [REDACTED] here"
        );
    }

    #[test]
    fn scrub_replaces_base64_variant() {
        let secret = "super-secret-value";
        let encoded = base64::engine::general_purpose::STANDARD.encode(secret);
        let redactor = SecretRedactor::new([secret], "[REDACTED]");
        assert_eq!(
            redactor.scrub(&format!("payload={encoded}")),
            "payload=[REDACTED]"
        );
    }

    #[test]
    fn scrub_replaces_url_encoded_variant() {
        let secret = "pa ss/word";
        let redactor = SecretRedactor::new([secret], "[REDACTED]");
        let quoted = urlencoding::encode(secret).into_owned();
        assert_eq!(redactor.scrub(&quoted), "[REDACTED]");
    }

    #[test]
    fn scrub_is_idempotent() {
        let redactor = SecretRedactor::new(["hunter2"], "[REDACTED]");
        let once = redactor.scrub("password hunter2");
        let twice = redactor.scrub(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn longer_secrets_replace_first() {
        let redactor = SecretRedactor::new(["abc", "abcdef"], "*");
        assert_eq!(redactor.scrub("abcdef"), "*");
    }

    #[test]
    fn register_adds_value_at_runtime() {
        let redactor = SecretRedactor::new(Vec::<String>::new(), "[REDACTED]");
        assert_eq!(redactor.scrub("vault-token-xyz"), "vault-token-xyz");
        redactor.register("vault-token-xyz");
        assert_eq!(redactor.scrub("vault-token-xyz"), "[REDACTED]");
    }

    #[test]
    fn scrub_value_redacts_string_leaves_only() {
        let redactor = SecretRedactor::new(["s3cret"], "[REDACTED]");
        let value = json!({
            "message": "found s3cret",
            "count": 3,
            "nested": {"items": ["ok", "s3cret"]}
        });
        let scrubbed = redactor.scrub_value(&value);
        assert_eq!(scrubbed["message"], "found [REDACTED]");
        assert_eq!(scrubbed["count"], 3);
        assert_eq!(scrubbed["nested"]["items"][1], "[REDACTED]");
    }

    #[test]
    fn longest_secret_len_covers_variants() {
        let secret = "abcdefgh";
        let redactor = SecretRedactor::new([secret], "*");
        // The base64 variant is longer than the raw value.
        assert!(redactor.longest_secret_len() >= secret.len());
    }

    #[test]
    fn empty_secrets_are_ignored() {
        let redactor = SecretRedactor::new([""], "[REDACTED]");
        assert_eq!(redactor.scrub("anything"), "anything");
        redactor.register("   ");
        assert_eq!(redactor.scrub("anything"), "anything");
    }
}
