//! Error taxonomy and classifier.
//!
//! Every failure the layer sees ends up as an [`ErrorClassification`]: a canonical
//! [`ErrorKind`] plus the messaging and retry guidance that kind implies.
//!
//! Classification runs in two tiers:
//!
//! 1. **Structural.** Values that know what they are ([`AppError`], [`RateLimitError`],
//!    [`ResilienceError`], [`HttpStatus`], most `std::io::Error` kinds) report their own
//!    classification through [`Classify::structured`].
//! 2. **Textual.** Everything else (typically opaque errors from third-party clients) is
//!    described as text and matched, case-insensitively, against an ordered list of
//!    [`TextRule`]s. The first matching rule wins.
//!
//! Unmatched input is classified as [`ErrorKind::Unknown`]: not retryable, generic apology.
//! Classification never fails and never panics.
//!
//! ```rust
//! use backstop::classify::{classify, ErrorKind};
//!
//! let c = classify("Request failed: 429 rate limit exceeded");
//! assert_eq!(c.kind, ErrorKind::RateLimit);
//! assert!(c.retryable);
//! ```

use crate::error::{AppError, RateLimitError, ResilienceError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// Canonical failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    AuthFailed,
    SessionExpired,
    Network,
    Validation,
    PermissionDenied,
    ResourceNotFound,
    #[serde(rename = "remote_protocol_error")]
    RemoteProtocol,
    Internal,
    Unknown,
}

/// Fixed defaults attached to each kind.
#[derive(Debug)]
pub struct KindProfile {
    pub recoverable: bool,
    pub retryable: bool,
    pub user_message: &'static str,
    pub suggestions: &'static [&'static str],
}

const RATE_LIMIT: KindProfile = KindProfile {
    recoverable: true,
    retryable: true,
    user_message: "Too many requests right now. Please wait a moment and try again.",
    suggestions: &[
        "Wait a few moments before trying again",
        "Reduce how often you repeat this action",
        "Contact support if this keeps happening",
    ],
};

const AUTH_FAILED: KindProfile = KindProfile {
    recoverable: true,
    retryable: false,
    user_message: "We couldn't verify your credentials. Please reconnect your account.",
    suggestions: &[
        "Reconnect your account",
        "Check that your API credentials are still valid",
        "Reinstall the app if the problem persists",
    ],
};

const SESSION_EXPIRED: KindProfile = KindProfile {
    recoverable: true,
    retryable: false,
    user_message: "Your session has expired. Please sign in again.",
    suggestions: &["Sign in again", "Refresh the page"],
};

const NETWORK: KindProfile = KindProfile {
    recoverable: true,
    retryable: true,
    user_message: "We couldn't reach the service. Please check your connection and try again.",
    suggestions: &[
        "Check your internet connection",
        "Try again in a few moments",
        "Check the service status page",
    ],
};

const VALIDATION: KindProfile = KindProfile {
    recoverable: true,
    retryable: false,
    user_message: "Some of the information provided is invalid.",
    suggestions: &["Review the highlighted fields", "Make sure all required fields are filled in"],
};

const PERMISSION_DENIED: KindProfile = KindProfile {
    recoverable: false,
    retryable: false,
    user_message: "You don't have permission to perform this action.",
    suggestions: &[
        "Ask the store owner for access",
        "Reinstall the app to grant the missing permissions",
    ],
};

const RESOURCE_NOT_FOUND: KindProfile = KindProfile {
    recoverable: false,
    retryable: false,
    user_message: "The requested item could not be found.",
    suggestions: &["Check that the item still exists", "Refresh the page and try again"],
};

const REMOTE_PROTOCOL: KindProfile = KindProfile {
    recoverable: true,
    retryable: true,
    user_message: "The remote service rejected the request.",
    suggestions: &["Try again in a few moments", "Contact support if the problem persists"],
};

const INTERNAL: KindProfile = KindProfile {
    recoverable: false,
    retryable: false,
    user_message: "Something went wrong on our end. We're looking into it.",
    suggestions: &["Try again later", "Contact support if the problem persists"],
};

const UNKNOWN: KindProfile = KindProfile {
    recoverable: false,
    retryable: false,
    user_message: "An unexpected error occurred. We're sorry for the inconvenience.",
    suggestions: &["Try again", "Contact support if the problem persists"],
};

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::RateLimit,
        ErrorKind::AuthFailed,
        ErrorKind::SessionExpired,
        ErrorKind::Network,
        ErrorKind::Validation,
        ErrorKind::PermissionDenied,
        ErrorKind::ResourceNotFound,
        ErrorKind::RemoteProtocol,
        ErrorKind::Internal,
        ErrorKind::Unknown,
    ];

    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::Network => "network",
            ErrorKind::Validation => "validation",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ResourceNotFound => "resource_not_found",
            ErrorKind::RemoteProtocol => "remote_protocol_error",
            ErrorKind::Internal => "internal",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Stable code used in response envelopes.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "RATE_LIMIT_EXCEEDED",
            ErrorKind::AuthFailed => "AUTH_FAILED",
            ErrorKind::SessionExpired => "SESSION_EXPIRED",
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::ResourceNotFound => "NOT_FOUND",
            ErrorKind::RemoteProtocol => "REMOTE_PROTOCOL_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
            ErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }

    pub fn profile(self) -> &'static KindProfile {
        match self {
            ErrorKind::RateLimit => &RATE_LIMIT,
            ErrorKind::AuthFailed => &AUTH_FAILED,
            ErrorKind::SessionExpired => &SESSION_EXPIRED,
            ErrorKind::Network => &NETWORK,
            ErrorKind::Validation => &VALIDATION,
            ErrorKind::PermissionDenied => &PERMISSION_DENIED,
            ErrorKind::ResourceNotFound => &RESOURCE_NOT_FOUND,
            ErrorKind::RemoteProtocol => &REMOTE_PROTOCOL,
            ErrorKind::Internal => &INTERNAL,
            ErrorKind::Unknown => &UNKNOWN,
        }
    }

    /// Operational kinds are expected failures whose message can be shown to users.
    pub fn is_operational(self) -> bool {
        !matches!(self, ErrorKind::Internal | ErrorKind::Unknown)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured, actionable description of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub message: String,
    pub user_friendly_message: String,
    pub recoverable: bool,
    pub retryable: bool,
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical_details: Option<String>,
}

impl ErrorClassification {
    /// Classification carrying the defaults of `kind`.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let profile = kind.profile();
        Self {
            kind,
            message: message.into(),
            user_friendly_message: profile.user_message.to_string(),
            recoverable: profile.recoverable,
            retryable: profile.retryable,
            suggestions: profile.suggestions.iter().map(|s| s.to_string()).collect(),
            retry_after_ms: None,
            technical_details: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.technical_details = Some(details.into());
        self
    }

    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_friendly_message = message.into();
        self
    }

    /// Copy safe for production-facing output: technical details removed.
    pub fn redacted(&self) -> Self {
        Self { technical_details: None, ..self.clone() }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

/// How a value offers itself to the classifier.
pub trait Classify {
    /// Structural tier: values that carry their own kind return it here.
    fn structured(&self) -> Option<ErrorClassification> {
        None
    }

    /// Text scanned by the heuristic tier when [`Classify::structured`] returns `None`.
    fn describe(&self) -> String;
}

impl<T: Classify + ?Sized> Classify for &T {
    fn structured(&self) -> Option<ErrorClassification> {
        (**self).structured()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

impl Classify for str {
    fn describe(&self) -> String {
        self.to_string()
    }
}

impl Classify for String {
    fn describe(&self) -> String {
        self.clone()
    }
}

impl Classify for AppError {
    fn structured(&self) -> Option<ErrorClassification> {
        let mut c = ErrorClassification::from_kind(self.kind(), self.message());
        if let Some(retry_after) = self.retry_after() {
            c = c.with_retry_after(retry_after);
        }
        if let Some(retryable) = self.retryable_override() {
            c = c.with_retryable(retryable);
        }
        if let Some(details) = self.details() {
            c = c.with_details(details);
        }
        Some(c)
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl Classify for RateLimitError {
    fn structured(&self) -> Option<ErrorClassification> {
        Some(
            ErrorClassification::from_kind(ErrorKind::RateLimit, self.to_string())
                .with_user_message(self.message.clone())
                .with_retry_after(self.retry_after),
        )
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl<E: Classify + fmt::Display> Classify for ResilienceError<E> {
    fn structured(&self) -> Option<ErrorClassification> {
        match self {
            ResilienceError::RateLimited(e) => e.structured(),
            ResilienceError::CircuitOpen { retry_in, failure_count } => Some(
                ErrorClassification::from_kind(ErrorKind::Network, self.to_string())
                    .with_user_message(format!(
                        "This service is temporarily unavailable. Please try again in {} seconds.",
                        crate::error::ceil_secs(*retry_in)
                    ))
                    .with_retry_after(*retry_in)
                    .with_details(format!("circuit breaker open after {failure_count} failures")),
            ),
            ResilienceError::Inner(e) => e.structured(),
        }
    }

    fn describe(&self) -> String {
        match self {
            ResilienceError::Inner(e) => e.describe(),
            other => other.to_string(),
        }
    }
}

impl Classify for std::io::Error {
    fn structured(&self) -> Option<ErrorClassification> {
        use std::io::ErrorKind as Io;

        if let Some(inner) = self.get_ref() {
            if let Some(c) = structured_from_dyn(inner) {
                return Some(c);
            }
        }
        let kind = match self.kind() {
            Io::TimedOut
            | Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::AddrNotAvailable
            | Io::UnexpectedEof => ErrorKind::Network,
            Io::PermissionDenied => ErrorKind::PermissionDenied,
            Io::NotFound => ErrorKind::ResourceNotFound,
            Io::InvalidInput | Io::InvalidData => ErrorKind::Validation,
            _ => return None,
        };
        Some(ErrorClassification::from_kind(kind, self.to_string()).with_details(format!("{self:?}")))
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl Classify for Box<dyn std::error::Error + Send + Sync> {
    fn structured(&self) -> Option<ErrorClassification> {
        let root: &(dyn std::error::Error + 'static) = &**self;
        let mut current = Some(root);
        while let Some(err) = current {
            if let Some(c) = structured_from_dyn(err) {
                return Some(c);
            }
            current = err.source();
        }
        None
    }

    fn describe(&self) -> String {
        let mut parts = vec![self.to_string()];
        let mut current = self.source();
        while let Some(err) = current {
            parts.push(err.to_string());
            current = err.source();
        }
        parts.join(": ")
    }
}

fn structured_from_dyn(err: &(dyn std::error::Error + 'static)) -> Option<ErrorClassification> {
    if let Some(e) = err.downcast_ref::<AppError>() {
        return e.structured();
    }
    if let Some(e) = err.downcast_ref::<RateLimitError>() {
        return e.structured();
    }
    if let Some(e) = err.downcast_ref::<std::io::Error>() {
        return e.structured();
    }
    None
}

/// HTTP status code returned by a remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HttpStatus(pub u16);

impl HttpStatus {
    /// Kind implied by the status, if it implies one.
    pub fn kind(self) -> Option<ErrorKind> {
        let kind = match self.0 {
            429 => ErrorKind::RateLimit,
            401 => ErrorKind::AuthFailed,
            403 => ErrorKind::PermissionDenied,
            404 | 410 => ErrorKind::ResourceNotFound,
            400 | 409 | 422 => ErrorKind::Validation,
            408 | 502 | 503 | 504 => ErrorKind::Network,
            500..=599 => ErrorKind::Internal,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {}", self.0)
    }
}

impl Classify for HttpStatus {
    fn structured(&self) -> Option<ErrorClassification> {
        self.kind().map(|kind| ErrorClassification::from_kind(kind, self.to_string()))
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

/// One `(patterns → kind)` rule of the textual tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRule {
    kind: ErrorKind,
    patterns: Vec<String>,
}

impl TextRule {
    /// Patterns are matched as case-insensitive substrings.
    pub fn new<I, P>(kind: ErrorKind, patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        Self { kind, patterns: patterns.into_iter().map(|p| p.as_ref().to_lowercase()).collect() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn matches(&self, lowered: &str) -> bool {
        self.patterns.iter().any(|p| lowered.contains(p.as_str()))
    }
}

/// Rule order matters: more specific kinds come before broader ones.
fn default_rules() -> Vec<TextRule> {
    vec![
        TextRule::new(
            ErrorKind::RateLimit,
            ["rate limit", "ratelimit", "429", "too many requests", "throttled"],
        ),
        TextRule::new(
            ErrorKind::SessionExpired,
            ["session expired", "session not found", "session has expired", "jwt expired"],
        ),
        TextRule::new(
            ErrorKind::AuthFailed,
            [
                "401",
                "unauthorized",
                "unauthenticated",
                "invalid api key",
                "invalid access token",
                "invalid token",
                "authentication",
            ],
        ),
        TextRule::new(
            ErrorKind::PermissionDenied,
            ["403", "forbidden", "permission", "access denied", "access scope"],
        ),
        TextRule::new(ErrorKind::ResourceNotFound, ["404", "not found", "does not exist"]),
        TextRule::new(
            ErrorKind::Network,
            [
                "timeout",
                "timed out",
                "econnrefused",
                "econnreset",
                "enotfound",
                "etimedout",
                "socket hang up",
                "fetch failed",
                "network",
                "connection",
                "502",
                "503",
                "504",
                "service unavailable",
                "bad gateway",
            ],
        ),
        TextRule::new(ErrorKind::RemoteProtocol, ["graphql", "usererrors", "protocol error"]),
        TextRule::new(
            ErrorKind::Validation,
            ["validation", "invalid", "required field", "is required", "400", "422"],
        ),
        TextRule::new(ErrorKind::Internal, ["500", "internal server error"]),
    ]
}

/// Two-tier classifier: structural match first, ordered text rules second.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<TextRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self { rules: default_rules() }
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A classifier with no text rules; only structured values classify to a known kind.
    pub fn without_rules() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a rule ahead of the existing ones.
    pub fn with_rule(mut self, rule: TextRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn rules(&self) -> &[TextRule] {
        &self.rules
    }

    pub fn classify<E: Classify + ?Sized>(&self, error: &E) -> ErrorClassification {
        match error.structured() {
            Some(classification) => classification,
            None => self.classify_text(&error.describe()),
        }
    }

    /// Textual tier on its own.
    pub fn classify_text(&self, text: &str) -> ErrorClassification {
        let lowered = text.to_lowercase();
        let Some(rule) = self.rules.iter().find(|rule| rule.matches(&lowered)) else {
            return ErrorClassification::from_kind(ErrorKind::Unknown, text).with_details(text);
        };
        let mut c = ErrorClassification::from_kind(rule.kind, text).with_details(text);
        if let Some(hint) = parse_retry_hint(&lowered) {
            c = c.with_retry_after(hint);
        }
        c
    }
}

/// Classify with the default rule set.
pub fn classify<E: Classify + ?Sized>(error: &E) -> ErrorClassification {
    static DEFAULT: OnceLock<Classifier> = OnceLock::new();
    DEFAULT.get_or_init(Classifier::default).classify(error)
}

/// Extract `retry after <n>` / `retry-after: <n>` (seconds) from lowercased text.
fn parse_retry_hint(lowered: &str) -> Option<Duration> {
    const MARKERS: [&str; 3] = ["retry after", "retry-after:", "retry-after"];
    for marker in MARKERS {
        let Some(start) = lowered.find(marker) else { continue };
        let rest = lowered[start + marker.len()..].trim_start();
        let number: String =
            rest.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
        // Hints too large for a Duration are dropped.
        if let Some(hint) =
            number.parse::<f64>().ok().and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        {
            return Some(hint);
        }
    }
    None
}
