//! Single-attempt calls to the downstream generation endpoint.
//!
//! A [`Transport`] performs exactly one call and classifies its outcome. Retries,
//! admission control and caching live above it in the scheduler.

mod budget;
mod http;

pub use budget::ContextBudget;
pub use http::HttpTransport;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

/// Opaque document payload sent alongside the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    pub data: Bytes,
}

impl Attachment {
    pub fn new(name: impl Into<String>, media_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    /// Read a file, guessing its media type from the extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        Ok(Self::new(name, guess_media_type(path), data))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn guess_media_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "csv" => "text/csv",
        "txt" | "md" => "text/plain",
        "json" => "application/json",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xls" => "application/vnd.ms-excel",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// What one transport call sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Correlation id, sent as `x-request-id`.
    pub request_id: String,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one call. Never retries.
    ///
    /// Failures must be classified: `Error::RateLimited` (with the server's wait
    /// hint when present), `Error::Network`, `Error::Server` or `Error::Client`.
    async fn call(&self, payload: &Payload) -> Result<String>;

    fn name(&self) -> &'static str {
        "custom"
    }
}
