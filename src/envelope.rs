//! Structured response envelopes for the boundary between this layer and its callers.
//!
//! Failures become `{success: false, error: {code, message, details?, timestamp, requestId?}}`
//! and successes `{success: true, data, meta?}`, serialised in camelCase.
//!
//! Notes:
//! - Operational kinds surface the error's own message, with the canned user message and
//!   suggestions in `details`.
//! - Non-operational kinds (`internal`, `unknown`) are logged at `error!` with full technical
//!   detail and surfaced only as the generic apology.
//! - Technical details reach the envelope only with [`EnvelopeOptions::expose_details`].

use crate::classify::{classify, Classify, ErrorClassification, ErrorKind};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Per-response rendering options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeOptions {
    /// Include technical details (development builds only).
    pub expose_details: bool,
    pub request_id: Option<String>,
    /// Fixed timestamp; `None` uses the current time.
    pub timestamp: Option<DateTime<Utc>>,
}

impl EnvelopeOptions {
    /// Options for development builds: technical details are exposed.
    pub fn development() -> Self {
        Self { expose_details: true, ..Self::default() }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    fn timestamp(&self) -> String {
        self.timestamp.unwrap_or_else(Utc::now).to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Presentation hints attached to an error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub kind: ErrorKind,
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    pub success: bool,
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// `{success: true, data}`.
pub fn success<T>(data: T) -> SuccessEnvelope<T> {
    SuccessEnvelope { success: true, data, meta: None }
}

/// `{success: true, data, meta}`.
pub fn success_with_meta<T>(data: T, meta: serde_json::Value) -> SuccessEnvelope<T> {
    SuccessEnvelope { success: true, data, meta: Some(meta) }
}

/// Classify `error` with the default classifier and render it.
pub fn failure<E: Classify + ?Sized>(error: &E, options: &EnvelopeOptions) -> ErrorEnvelope {
    from_classification(classify(error), options)
}

/// Render an existing classification.
pub fn from_classification(
    classification: ErrorClassification,
    options: &EnvelopeOptions,
) -> ErrorEnvelope {
    let kind = classification.kind;
    let technical_details = options.expose_details.then(|| {
        classification.technical_details.clone().unwrap_or_else(|| classification.message.clone())
    });

    let (message, details) = if kind.is_operational() {
        let details = ErrorDetails {
            kind,
            user_message: classification.user_friendly_message,
            suggestions: classification.suggestions,
            retryable: classification.retryable,
            retry_after_ms: classification.retry_after_ms,
            technical_details,
        };
        (classification.message, Some(details))
    } else {
        tracing::error!(
            kind = %kind,
            error_message = %classification.message,
            details = classification.technical_details.as_deref().unwrap_or_default(),
            request_id = options.request_id.as_deref().unwrap_or_default(),
            "unexpected error"
        );
        let details = technical_details.map(|technical| ErrorDetails {
            kind,
            user_message: classification.user_friendly_message.clone(),
            suggestions: classification.suggestions.clone(),
            retryable: classification.retryable,
            retry_after_ms: None,
            technical_details: Some(technical),
        });
        (classification.user_friendly_message, details)
    };

    ErrorEnvelope {
        success: false,
        error: ErrorBody {
            code: kind.code().to_string(),
            message,
            details,
            timestamp: options.timestamp(),
            request_id: options.request_id.clone(),
        },
    }
}

/// HTTP status a boundary should answer with for `kind`.
pub fn status_code(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::RateLimit => 429,
        ErrorKind::AuthFailed | ErrorKind::SessionExpired => 401,
        ErrorKind::PermissionDenied => 403,
        ErrorKind::ResourceNotFound => 404,
        ErrorKind::Validation => 400,
        ErrorKind::RemoteProtocol => 502,
        ErrorKind::Network => 503,
        ErrorKind::Internal | ErrorKind::Unknown => 500,
    }
}
