use crate::error_code::ErrorKind;
use thiserror::Error;

/// Structured error context for diagnostics and logging.
///
/// None of these fields are part of the caller-facing message; they exist so that
/// logs and `Error::Job` wrappers can say which attempt and which request failed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// HTTP status code returned by the downstream service, if any.
    pub status_code: Option<u16>,
    /// Correlation id sent as `x-request-id`.
    pub request_id: Option<String>,
    /// Zero-based attempt number that produced the error.
    pub attempt: Option<u32>,
    /// Component that raised the error (e.g. "http_transport", "rate_limiter").
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status_code(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Where a rate-limit condition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOrigin {
    /// The local token bucket had no token (reject admission mode).
    Local,
    /// The downstream service answered HTTP 429.
    Remote,
}

/// Unified error type for the request governor.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Rate limited ({origin:?}){}{}", format_retry_after(.retry_after_ms), format_context(.context))]
    RateLimited {
        retry_after_ms: Option<u64>,
        origin: RateLimitOrigin,
        context: ErrorContext,
    },

    #[error("Network error: {message}{}", format_context(.context))]
    Network {
        message: String,
        context: ErrorContext,
    },

    #[error("Server error: HTTP {status}: {message}{}", format_context(.context))]
    Server {
        status: u16,
        message: String,
        context: ErrorContext,
    },

    #[error("Client error: HTTP {status}: {message}{}", format_context(.context))]
    Client {
        status: u16,
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration file error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request scheduler is no longer running")]
    SchedulerClosed,

    #[error("Job #{job_id} ({request_id}) failed: {source}")]
    Job {
        job_id: u64,
        request_id: String,
        #[source]
        source: Box<Error>,
    },
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(status) = ctx.status_code {
        parts.push(format!("status: {}", status));
    }
    if let Some(ref id) = ctx.request_id {
        parts.push(format!("request_id: {}", id));
    }
    if let Some(attempt) = ctx.attempt {
        parts.push(format!("attempt: {}", attempt));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_retry_after(ms: &Option<u64>) -> String {
    match ms {
        Some(ms) => format!(", retry after {}ms", ms),
        None => String::new(),
    }
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn rate_limited(retry_after_ms: Option<u64>, origin: RateLimitOrigin) -> Self {
        Error::RateLimited {
            retry_after_ms,
            origin,
            context: ErrorContext::new(),
        }
    }

    /// Build the error for a non-success HTTP status.
    ///
    /// `retry_after_ms` is only kept for rate-limited responses.
    pub fn from_status(status: u16, body: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        let context = ErrorContext::new().with_status_code(status);
        match ErrorKind::from_http_status(status) {
            ErrorKind::RateLimited => Error::RateLimited {
                retry_after_ms,
                origin: RateLimitOrigin::Remote,
                context,
            },
            ErrorKind::Server => Error::Server {
                status,
                message: body.into(),
                context,
            },
            _ => Error::Client {
                status,
                message: body.into(),
                context,
            },
        }
    }

    /// Classified kind; `Job` wrappers report the kind of the wrapped error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Network { .. } => ErrorKind::Network,
            Error::Server { .. } => ErrorKind::Server,
            Error::Client { .. } => ErrorKind::Client,
            Error::Configuration { .. } | Error::Yaml(_) => ErrorKind::Configuration,
            Error::Serialization(_) | Error::Io(_) | Error::SchedulerClosed => ErrorKind::Other,
            Error::Job { source, .. } => source.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Explicit wait hint carried by the error (server `Retry-After` or local bucket wait).
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            Error::Job { source, .. } => source.retry_after_ms(),
            _ => None,
        }
    }

    /// HTTP status code of the failed downstream call, if there was one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Server { status, .. } | Error::Client { status, .. } => Some(*status),
            Error::Job { source, .. } => source.status_code(),
            _ => self.context().and_then(|c| c.status_code),
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Validation { context, .. }
            | Error::RateLimited { context, .. }
            | Error::Network { context, .. }
            | Error::Server { context, .. }
            | Error::Client { context, .. }
            | Error::Configuration { context, .. } => Some(context),
            Error::Job { source, .. } => source.context(),
            _ => None,
        }
    }

    /// Replace the context of a contextual variant. Other variants are returned as-is.
    pub fn with_context(mut self, new: ErrorContext) -> Self {
        match &mut self {
            Error::Validation { context, .. }
            | Error::RateLimited { context, .. }
            | Error::Network { context, .. }
            | Error::Server { context, .. }
            | Error::Client { context, .. }
            | Error::Configuration { context, .. } => *context = new,
            _ => {}
        }
        self
    }

    /// Record the attempt number on the error context, keeping everything else.
    pub(crate) fn at_attempt(self, attempt: u32) -> Self {
        let ctx = self.context().cloned().unwrap_or_default().with_attempt(attempt);
        self.with_context(ctx)
    }

    /// Unwrap `Job` tagging to reach the classified error.
    pub fn root(&self) -> &Error {
        match self {
            Error::Job { source, .. } => source.root(),
            other => other,
        }
    }

    /// One categorized, human-readable message per failed job.
    pub fn user_message(&self) -> String {
        match self.root() {
            Error::Validation { .. } => "Prompt must not be empty".to_string(),
            Error::RateLimited { retry_after_ms, .. } => {
                let secs = retry_after_ms.map(|ms| ms.div_ceil(1000)).unwrap_or(1);
                format!("Rate limit exceeded, retrying in {}s…", secs)
            }
            Error::Network { .. } => "Network error".to_string(),
            Error::Server { .. } => "Server error, try again later".to_string(),
            Error::Client { status, .. } => {
                format!("Request rejected by the service (HTTP {})", status)
            }
            _ => "Unexpected error, please try again".to_string(),
        }
    }
}
