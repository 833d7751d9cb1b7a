//! Transport failure taxonomy shared by every backend

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    ConnectionRefused,
    Dns,
    #[serde(rename = "http_429")]
    Http429,
    #[serde(rename = "http_4xx")]
    Http4xx,
    #[serde(rename = "http_5xx")]
    Http5xx,
    NotFound,
    ProviderMismatch,
    InvalidResponse,
    Aborted,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::ConnectionRefused => "connection_refused",
            ErrorClass::Dns => "dns",
            ErrorClass::Http429 => "http_429",
            ErrorClass::Http4xx => "http_4xx",
            ErrorClass::Http5xx => "http_5xx",
            ErrorClass::NotFound => "not_found",
            ErrorClass::ProviderMismatch => "provider_mismatch",
            ErrorClass::InvalidResponse => "invalid_response",
            ErrorClass::Aborted => "aborted",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Worth another attempt on the same backend
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Timeout
                | ErrorClass::ConnectionRefused
                | ErrorClass::Dns
                | ErrorClass::Http5xx
                | ErrorClass::Http429
        )
    }

    /// Stops the whole operation; other backends would not help
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorClass::ProviderMismatch | ErrorClass::InvalidResponse | ErrorClass::Aborted
        )
    }

    /// Counts against the backend's availability
    pub fn penalizes_backoff(&self) -> bool {
        self.is_retryable()
    }

    /// Short user-facing label
    pub fn reason(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::ConnectionRefused | ErrorClass::Dns => "unreachable",
            ErrorClass::InvalidResponse => "malformed",
            ErrorClass::Aborted => "aborted",
            ErrorClass::Http429
            | ErrorClass::Http4xx
            | ErrorClass::Http5xx
            | ErrorClass::NotFound
            | ErrorClass::ProviderMismatch => "rejected",
            ErrorClass::Unknown => "unreachable",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        404 => ErrorClass::NotFound,
        429 => ErrorClass::Http429,
        500..=599 => ErrorClass::Http5xx,
        400..=499 => ErrorClass::Http4xx,
        _ => ErrorClass::InvalidResponse,
    }
}

pub fn classify_reqwest(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() {
        return ErrorClass::Timeout;
    }
    if let Some(status) = err.status() {
        return classify_status(status.as_u16());
    }
    if err.is_connect() {
        let text = format!("{:?}", err).to_lowercase();
        if text.contains("dns") || text.contains("resolve") || text.contains("lookup") {
            return ErrorClass::Dns;
        }
        return ErrorClass::ConnectionRefused;
    }
    if err.is_decode() || err.is_body() {
        return ErrorClass::InvalidResponse;
    }
    ErrorClass::Unknown
}

/// One failed transport attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}: {message}", .class.reason())]
pub struct TransportError {
    pub class: ErrorClass,
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            status: None,
            message: message.into(),
        }
    }

    pub fn http(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = if body.trim().is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, body.trim())
        };
        Self {
            class: classify_status(status),
            status: Some(status),
            message,
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            ErrorClass::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    pub fn aborted() -> Self {
        Self::new(ErrorClass::Aborted, "operation cancelled")
    }

    pub fn reason(&self) -> &'static str {
        self.class.reason()
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let class = classify_reqwest(&err);
        Self {
            class,
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}
