//! Error classification for downstream calls.
//!
//! | Kind          | Retryable | Trigger                                   |
//! |---------------|-----------|-------------------------------------------|
//! | Validation    | no        | empty or missing prompt                   |
//! | RateLimited   | yes       | HTTP 429 or local bucket exhaustion       |
//! | Network       | yes       | transport-level failure                   |
//! | Server        | yes       | HTTP >= 500                               |
//! | Client        | no        | any other HTTP 4xx                        |
//! | Configuration | no        | invalid governor configuration            |
//! | Other         | no        | everything else                           |
//!
//! ```rust
//! use prompt_governor::error_code::ErrorKind;
//!
//! let kind = ErrorKind::from_http_status(429);
//! assert_eq!(kind.code(), "E2001");
//! assert!(kind.is_retryable());
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// E1001: empty or malformed job, rejected before queueing
    Validation,
    /// E1002: HTTP 4xx other than 429
    Client,
    /// E2001: HTTP 429 or local token bucket empty
    RateLimited,
    /// E3001: HTTP 5xx
    Server,
    /// E3002: connection, timeout or body read failure
    Network,
    /// E4001: invalid configuration
    Configuration,
    /// E9999: unclassified
    Other,
}

impl ErrorKind {
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation => "E1001",
            Self::Client => "E1002",
            Self::RateLimited => "E2001",
            Self::Server => "E3001",
            Self::Network => "E3002",
            Self::Configuration => "E4001",
            Self::Other => "E9999",
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Client => "client_error",
            Self::RateLimited => "rate_limited",
            Self::Server => "server_error",
            Self::Network => "network",
            Self::Configuration => "configuration",
            Self::Other => "other",
        }
    }

    /// Whether the retry policy may absorb this kind of failure.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Network | Self::Server)
    }

    /// Maps a non-success HTTP status code to its kind.
    ///
    /// 429 is rate limited, anything at or above 500 is a server error and every
    /// other status is a client error.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            s if s >= 500 => Self::Server,
            _ => Self::Client,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
