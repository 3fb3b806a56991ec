//! Error taxonomy for the dispatch boundary (spec.md §6-7).
//!
//! Errors are values: every fallible handler returns `Result<T, CoreError>`,
//! and the dispatcher turns that into `{correlation_id, error: {code, message,
//! details}}` — never a panic, never an exception crossing the boundary.
//! Reserved for the handful of codes spec.md names; anything resembling "this
//! should be impossible" (config loading, server bootstrap) still uses
//! `anyhow`, matching the split the teacher draws between `auth/jwt.rs`'s
//! `anyhow::Result` and `auth/middleware.rs`'s hand-rolled `AuthError`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Stable error code surfaced at the dispatch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "CONSTRAINT_VIOLATION")]
    ConstraintViolation,
    #[serde(rename = "FORBIDDEN")]
    Forbidden,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "CONFLICT")]
    Conflict,
    #[serde(rename = "IDEMPOTENCY_KEY_REUSE_PAYLOAD_MISMATCH")]
    IdempotencyKeyReusePayloadMismatch,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConstraintViolation => "CONSTRAINT_VIOLATION",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::IdempotencyKeyReusePayloadMismatch => {
                "IDEMPOTENCY_KEY_REUSE_PAYLOAD_MISMATCH"
            }
        }
    }
}

/// A domain reason code (e.g. `liquidity_policy_precedence_violation`). Kept
/// as a plain `String` newtype rather than a closed enum per-domain: spec.md
/// §9 calls for "a closed enum per domain feeding a shared `ReasonCode` type"
/// but the wire representation is the lowercase-underscored string either
/// way, and the reason-code surface here spans a dozen independent domains
/// that each mint their own constants (see each `domain::*` module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonCode(pub String);

impl ReasonCode {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReasonCode {
    fn from(s: &str) -> Self {
        ReasonCode::new(s)
    }
}

/// The error half of the response envelope.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_reason(code: ErrorCode, message: impl Into<String>, reason: &ReasonCode) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(serde_json::json!({ "reason_code": reason.0 })),
        }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn constraint_violation(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::with_reason(
            ErrorCode::ConstraintViolation,
            format!("constraint violation: {reason}"),
            &ReasonCode::new(reason),
        )
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::with_reason(
            ErrorCode::Forbidden,
            format!("forbidden: {reason}"),
            &ReasonCode::new(reason),
        )
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::with_reason(
            ErrorCode::NotFound,
            format!("not found: {reason}"),
            &ReasonCode::new(reason),
        )
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::with_reason(
            ErrorCode::Conflict,
            format!("conflict: {reason}"),
            &ReasonCode::new(reason),
        )
    }

    pub fn idempotency_mismatch() -> Self {
        Self::new(
            ErrorCode::IdempotencyKeyReusePayloadMismatch,
            "idempotency key reused with a different payload",
        )
    }

    pub fn reason_code(&self) -> Option<&str> {
        self.details
            .as_ref()
            .and_then(|d| d.get("reason_code"))
            .and_then(|v| v.as_str())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_wire_names_match_spec() {
        assert_eq!(ErrorCode::ConstraintViolation.as_str(), "CONSTRAINT_VIOLATION");
        assert_eq!(
            ErrorCode::IdempotencyKeyReusePayloadMismatch.as_str(),
            "IDEMPOTENCY_KEY_REUSE_PAYLOAD_MISMATCH"
        );
    }

    #[test]
    fn constraint_violation_carries_reason_code() {
        let err = CoreError::constraint_violation("asset_values_missing");
        assert_eq!(err.code, ErrorCode::ConstraintViolation);
        assert_eq!(err.reason_code(), Some("asset_values_missing"));
    }
}
