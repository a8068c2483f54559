//! Vault KV-v2 resolution of GitHub auth material.
//!
//! Resolves validated `vault://` references into short-lived tokens. Every
//! resolved token is registered with the secret redactor before any use, so
//! it cannot surface in logs, events, or artifacts.

use moonmind_core::config::VaultConfig;
use moonmind_core::secret_ref::{parse_vault_reference, SecretReferenceError};
use serde_json::Value;

pub type Result<T> = std::result::Result<T, SecretReferenceError>;

/// GitHub auth material resolved from a Vault secret.
#[derive(Debug, Clone)]
pub struct ResolvedGitHubAuth {
    pub token: String,
    pub username: String,
    pub host: String,
    pub source_ref: String,
}

/// Resolver for `vault://<mount>/<path>#<field>` references.
#[derive(Debug)]
pub struct VaultResolver {
    config: VaultConfig,
    http: reqwest::Client,
}

impl VaultResolver {
    pub fn new(config: VaultConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    /// Resolve `token` plus optional `username`/`host` fields.
    pub async fn resolve_github_auth(&self, reference: &str) -> Result<ResolvedGitHubAuth> {
        let parsed = parse_vault_reference(reference, &self.config.allowed_mounts)?;
        let normalized = parsed.normalized();

        let url = format!(
            "{}/v1/{}/data/{}",
            self.config.address, parsed.mount, parsed.path
        );
        let mut request = self.http.get(&url).header("X-Vault-Token", &self.config.token);
        if let Some(namespace) = &self.config.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }

        let response = request
            .send()
            .await
            .map_err(|_| SecretReferenceError::ResolutionFailed {
                reference: normalized.clone(),
            })?;
        if !response.status().is_success() {
            return Err(SecretReferenceError::ResolutionFailed {
                reference: normalized,
            });
        }

        let payload: Value =
            response
                .json()
                .await
                .map_err(|_| SecretReferenceError::MalformedData {
                    reference: normalized.clone(),
                })?;

        // KV-v2 nests the secret under data.data.
        let secret_data = payload
            .get("data")
            .and_then(Value::as_object)
            .and_then(|data| data.get("data"))
            .and_then(Value::as_object)
            .ok_or_else(|| SecretReferenceError::MalformedData {
                reference: normalized.clone(),
            })?;

        let token = secret_data
            .get(&parsed.field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SecretReferenceError::FieldEmpty {
                reference: normalized.clone(),
                field: parsed.field.clone(),
            })?
            .to_string();

        let username = secret_data
            .get("username")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("x-access-token")
            .to_string();
        let host = secret_data
            .get("host")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("github.com")
            .to_string();

        Ok(ResolvedGitHubAuth {
            token,
            username,
            host,
            source_ref: normalized,
        })
    }
}
