use crate::transport::{Attachment, Payload};
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

/// One caller request: a built prompt plus its attachments.
#[derive(Debug, Clone)]
pub struct Job {
    /// Queue sequence number, assigned by the scheduler as the job enters the
    /// queue (0 until then).
    pub id: u64,
    /// Correlation id sent downstream as `x-request-id`.
    pub request_id: String,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    pub submitted_at: Instant,
}

impl Job {
    pub fn new(prompt: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            id: 0,
            request_id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            attachments,
            submitted_at: Instant::now(),
        }
    }

    pub(crate) fn into_payload(self) -> Payload {
        Payload {
            request_id: self.request_id,
            prompt: self.prompt,
            attachments: self.attachments,
        }
    }
}

/// Lifecycle of a job as it moves through the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    /// Answered from the response cache without a downstream call.
    CacheHit,
    /// Rate limit token acquired.
    Admitted,
    Sent,
    /// Waiting out a retry delay after a retryable failure.
    Backoff,
    Succeeded,
    FailedTerminal,
    /// Caller went away before service began; skipped without a token.
    Abandoned,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::CacheHit => "cache_hit",
            Self::Admitted => "admitted",
            Self::Sent => "sent",
            Self::Backoff => "backoff",
            Self::Succeeded => "succeeded",
            Self::FailedTerminal => "failed_terminal",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CacheHit | Self::Succeeded | Self::FailedTerminal | Self::Abandoned
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
