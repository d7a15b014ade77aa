//! Validation of release image refs against the configured registry.
//!
//! Release images are content addressed: `[host/]<repo>@sha256:<digest>`
//! where `<repo>` is a single lowercase alphanumeric component. Discovery
//! may report them under any host, so the host is rewritten to the
//! registry this node pulls from.

use thiserror::Error;

/// Reasons an image ref is not a registry release ref.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryRefError {
    #[error("image ref has no sha256 digest: {0}")]
    MissingDigest(String),

    #[error("invalid sha256 digest in image ref: {0}")]
    InvalidDigest(String),

    #[error("invalid repository in image ref: {0}")]
    InvalidRepository(String),
}

/// Validate `image_ref` and rewrite it to pull from `registry`.
pub fn validate_registry_image_ref(
    registry: &str,
    image_ref: &str,
) -> Result<String, RegistryRefError> {
    let (name, digest) = image_ref
        .rsplit_once("@sha256:")
        .ok_or_else(|| RegistryRefError::MissingDigest(image_ref.to_string()))?;

    if digest.len() != 64 || !digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(RegistryRefError::InvalidDigest(image_ref.to_string()));
    }

    let repo = name.rsplit('/').next().unwrap_or(name);
    let valid_repo = !repo.is_empty()
        && !repo.contains(':')
        && repo
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if !valid_repo {
        return Err(RegistryRefError::InvalidRepository(image_ref.to_string()));
    }

    Ok(format!("{registry}/{repo}@sha256:{digest}"))
}
