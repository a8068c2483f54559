//! Vault secret reference parsing.
//!
//! Task payloads carry credentials as `vault://<mount>/<path>#<field>`
//! pointers, never inline tokens. Parsing validates character classes and
//! the mount allowlist before any network resolution happens.

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretReferenceError {
    #[error("secret reference is required")]
    Empty,
    #[error("secret reference exceeds max length")]
    TooLong,
    #[error("secret reference must use vault:// scheme")]
    WrongScheme,
    #[error("secret reference must include mount/path and #field")]
    MissingParts,
    #[error("vault mount contains invalid characters")]
    InvalidMount,
    #[error("vault path contains invalid characters")]
    InvalidPath,
    #[error("vault path traversal is not allowed")]
    PathTraversal,
    #[error("vault field contains invalid characters")]
    InvalidField,
    #[error("vault mount '{mount}' is not allowed; allowed mounts: {allowed}")]
    MountNotAllowed { mount: String, allowed: String },
    #[error("unable to read Vault token file: {0}")]
    TokenFile(String),
    #[error("vault secret read failed for {reference}: resolution failed")]
    ResolutionFailed { reference: String },
    #[error("vault response is malformed data for {reference}")]
    MalformedData { reference: String },
    #[error("vault field '{field}' is missing or empty for {reference}")]
    FieldEmpty { reference: String, field: String },
}

pub type Result<T> = std::result::Result<T, SecretReferenceError>;

const MAX_REFERENCE_LEN: usize = 512;

/// A validated `vault://` KV-v2 reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultReference {
    pub mount: String,
    pub path: String,
    pub field: String,
}

impl VaultReference {
    /// Canonical `vault://mount/path#field` rendering.
    pub fn normalized(&self) -> String {
        format!("vault://{}/{}#{}", self.mount, self.path, self.field)
    }
}

fn valid_mount_or_field(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn valid_path(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
}

/// Parse and validate a `vault://<mount>/<path>#<field>` reference.
pub fn parse_vault_reference(raw: &str, allowed_mounts: &[String]) -> Result<VaultReference> {
    let candidate = raw.trim();
    if candidate.is_empty() {
        return Err(SecretReferenceError::Empty);
    }
    if candidate.len() > MAX_REFERENCE_LEN {
        return Err(SecretReferenceError::TooLong);
    }

    let rest = candidate
        .strip_prefix("vault://")
        .ok_or(SecretReferenceError::WrongScheme)?;

    let (location, field) = rest
        .split_once('#')
        .ok_or(SecretReferenceError::MissingParts)?;
    let (mount, path) = location
        .split_once('/')
        .ok_or(SecretReferenceError::MissingParts)?;

    let mount = mount.trim();
    let path = path.trim().trim_start_matches('/');
    let field = field.trim();
    if mount.is_empty() || path.is_empty() || field.is_empty() {
        return Err(SecretReferenceError::MissingParts);
    }

    if !valid_mount_or_field(mount) {
        return Err(SecretReferenceError::InvalidMount);
    }
    if !valid_path(path) {
        return Err(SecretReferenceError::InvalidPath);
    }
    if path.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(SecretReferenceError::PathTraversal);
    }
    if !valid_mount_or_field(field) {
        return Err(SecretReferenceError::InvalidField);
    }

    if !allowed_mounts.is_empty() && !allowed_mounts.iter().any(|m| m == mount) {
        return Err(SecretReferenceError::MountNotAllowed {
            mount: mount.to_string(),
            allowed: allowed_mounts.join(", "),
        });
    }

    Ok(VaultReference {
        mount: mount.to_string(),
        path: path.to_string(),
        field: field.to_string(),
    })
}

/// Resolve the Vault token from an explicit value or a token file.
pub fn load_vault_token(token: Option<&str>, token_file: Option<&Path>) -> Result<Option<String>> {
    if let Some(direct) = token {
        let direct = direct.trim();
        if !direct.is_empty() {
            return Ok(Some(direct.to_string()));
        }
    }
    let Some(path) = token_file else {
        return Ok(None);
    };
    let contents = std::fs::read_to_string(path)
        .map_err(|e| SecretReferenceError::TokenFile(e.to_string()))?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}
