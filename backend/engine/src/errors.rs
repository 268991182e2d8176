//! Application-wide error types.
//!
//! Validation failures, gateway failures and business-rule violations are
//! distinct variants so callers can match on them instead of on messages.

use serde_json::Value;
use thiserror::Error;

/// Structured validation codes surfaced to checkout callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationCode {
    InvalidAmount,
    AmountTooLarge,
    InvalidRequest,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::AmountTooLarge => "AMOUNT_TOO_LARGE",
            Self::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub code: ValidationCode,
    pub message: String,
    pub details: Option<Value>,
}

impl ValidationError {
    pub fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Amount below a configured minimum.
    pub fn below_minimum(what: &str, minimum_required: i64, provided: i64) -> Self {
        Self::new(
            ValidationCode::InvalidAmount,
            format!("{what} must be at least {minimum_required}"),
        )
        .with_details(serde_json::json!({
            "minimumRequired": minimum_required,
            "provided": provided,
        }))
    }
}

/// A failure reported by (or while talking to) the payment provider.
#[derive(Debug, Clone, Error)]
#[error("payment provider error{}: {detail}", code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default())]
pub struct GatewayError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub detail: String,
}

impl GatewayError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Webhook signature verification failed")]
    InvalidSignature,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Gateway(#[from] GatewayError),

    #[error("{0}")]
    BusinessRule(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl EngineError {
    /// Stable machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(v) => v.code.as_str(),
            Self::Gateway(_) => "PAYMENT_ERROR",
            Self::BusinessRule(_) => "BAD_REQUEST",
            Self::MalformedPayload(_) => "INVALID_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidSignature | Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            _ => "INTERNAL_ERROR",
        }
    }

    /// True when a unique constraint rejected the write.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
