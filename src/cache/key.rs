//! Cache key generation.

use crate::transport::Attachment;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Content fingerprint of a job: hex SHA-256 over the prompt and attachments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub hash: String,
}

impl CacheKey {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[derive(Serialize)]
struct AttachmentDigest<'a> {
    name: &'a str,
    media_type: &'a str,
    sha256: String,
}

#[derive(Serialize)]
struct Canonical<'a> {
    salt: Option<&'a str>,
    prompt: &'a str,
    attachments: Vec<AttachmentDigest<'a>>,
}

fn hex_sha256(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Derives [`CacheKey`]s deterministically from job content.
///
/// Attachments contribute their name, media type and a hash of their bytes, in
/// order. A salt (for instance the downstream model id) keeps keys from different
/// deployments apart.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyGenerator {
    salt: Option<String>,
}

impl CacheKeyGenerator {
    pub fn new() -> Self {
        Self { salt: None }
    }

    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn generate(&self, prompt: &str, attachments: &[Attachment]) -> CacheKey {
        let canonical = Canonical {
            salt: self.salt.as_deref(),
            prompt,
            attachments: attachments
                .iter()
                .map(|a| AttachmentDigest {
                    name: &a.name,
                    media_type: &a.media_type,
                    sha256: hex_sha256(&a.data),
                })
                .collect(),
        };
        // Serializing plain strings into JSON cannot fail.
        let encoded = serde_json::to_vec(&canonical).unwrap_or_default();
        CacheKey::new(hex_sha256(&encoded))
    }
}
