//! Error types for escrow operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::Amount;
use crate::model::{AuthorizationStatus, UnknownVariant};
use crate::processor::{ProcessorError, ProcessorErrorKind};
use crate::retry::Retryable;
use crate::store::StoreError;
use crate::webhook::SignatureError;

/// Top-level error returned by [`EscrowCoordinator`](super::EscrowCoordinator) operations.
#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Processor(#[from] ProcessorError),

    #[error("webhook rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("transaction store: {0}")]
    Store(#[from] StoreError),
}

/// Local rejection of a request. Never retried, never sent to the processor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("email must not be empty")]
    EmptyEmail,
    #[error("invalid email '{0}'")]
    InvalidEmail(String),
    #[error("{0}")]
    UnknownVariant(#[from] UnknownVariant),
    #[error("amount {0} must be positive")]
    NonPositiveAmount(Amount),
    #[error("amount {amount} exceeds ceiling {ceiling}")]
    AmountAboveCeiling { amount: Amount, ceiling: Amount },
    #[error("platform fee {fee} must be within 0..={amount}")]
    FeeOutOfBounds { fee: Amount, amount: Amount },
    #[error("invalid currency '{0}'")]
    InvalidCurrency(String),
    #[error("{0} must not be empty")]
    MissingField(&'static str),
    #[error("authorization {authorization_id} is {status}, not capturable")]
    NotCapturable {
        authorization_id: String,
        status: AuthorizationStatus,
    },
    #[error("authorization {0} is already captured")]
    AlreadyCaptured(String),
    #[error("authorization {0} is already canceled")]
    AlreadyCanceled(String),
    #[error("authorization {authorization_id} is {status}, not captured")]
    NotCaptured {
        authorization_id: String,
        status: AuthorizationStatus,
    },
    #[error("refund {requested} exceeds refundable {available}")]
    RefundExceedsCaptured { requested: Amount, available: Amount },
}

/// Error taxonomy surfaced to upstream handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Transient,
    Permanent,
    Signature,
    Store,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Signature => "signature",
            ErrorCategory::Store => "store",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EscrowError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EscrowError::Validation(_) => ErrorCategory::Validation,
            EscrowError::Processor(e) if e.kind.is_retryable() => ErrorCategory::Transient,
            EscrowError::Processor(_) => ErrorCategory::Permanent,
            EscrowError::Signature(_) => ErrorCategory::Signature,
            EscrowError::Store(_) => ErrorCategory::Store,
        }
    }

    /// Status an HTTP handler should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            EscrowError::Validation(_) | EscrowError::Signature(_) => 400,
            EscrowError::Processor(e) => match e.kind {
                ProcessorErrorKind::RateLimited => 429,
                ProcessorErrorKind::Timeout => 504,
                ProcessorErrorKind::Transient => 503,
                ProcessorErrorKind::InvalidRequest | ProcessorErrorKind::Permanent => 402,
            },
            EscrowError::Store(_) => 500,
        }
    }

    /// Message safe to show the end user.
    pub fn public_message(&self) -> String {
        match self {
            EscrowError::Validation(e) => e.to_string(),
            EscrowError::Signature(_) => "invalid request".to_string(),
            EscrowError::Processor(e) if e.kind.is_retryable() => {
                "payment service unavailable, try again".to_string()
            }
            EscrowError::Processor(e) => e.message.clone(),
            EscrowError::Store(_) => "internal error, try again".to_string(),
        }
    }
}

impl Retryable for EscrowError {
    fn is_retryable(&self) -> bool {
        matches!(self, EscrowError::Processor(e) if e.is_retryable())
    }
}

/// Terminal error preserved on a failed transaction state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateError {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
    /// The mutating processor call was issued, so its effect may have been
    /// applied even though no answer came back.
    #[serde(default = "effect_unknown")]
    pub effect_possible: bool,
}

fn effect_unknown() -> bool {
    true
}

impl StateError {
    /// Whether a retry has to reuse the failed state's idempotency key.
    pub fn outcome_unknown(&self) -> bool {
        self.retryable && self.effect_possible
    }
}

impl From<&EscrowError> for StateError {
    fn from(err: &EscrowError) -> Self {
        StateError {
            category: err.category(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            effect_possible: false,
        }
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn categories_follow_taxonomy() {
        let validation = EscrowError::from(ValidationError::EmptyEmail);
        assert_eq!(validation.category(), ErrorCategory::Validation);
        assert_eq!(validation.http_status(), 400);
        assert!(!validation.is_retryable());

        let transient = EscrowError::from(ProcessorError::transient("502"));
        assert_eq!(transient.category(), ErrorCategory::Transient);
        assert_eq!(transient.http_status(), 503);
        assert!(transient.is_retryable());

        let timeout = EscrowError::from(ProcessorError::timeout(Duration::from_secs(3)));
        assert_eq!(timeout.http_status(), 504);

        let permanent = EscrowError::from(ProcessorError::permanent("account_invalid", "bad"));
        assert_eq!(permanent.category(), ErrorCategory::Permanent);
        assert!(!permanent.is_retryable());

        let signature = EscrowError::from(SignatureError::Mismatch);
        assert_eq!(signature.category(), ErrorCategory::Signature);
        assert_eq!(signature.http_status(), 400);
        assert_eq!(signature.public_message(), "invalid request");
    }

    #[test]
    fn state_error_preserves_retryability() {
        let err = EscrowError::from(ProcessorError::timeout(Duration::from_secs(1)));
        let state = StateError::from(&err);
        assert!(state.retryable);
        assert_eq!(state.category, ErrorCategory::Transient);
        assert!(!state.outcome_unknown());
        let state = StateError {
            effect_possible: true,
            ..state
        };
        assert!(state.outcome_unknown());

        let err = EscrowError::from(ValidationError::AlreadyCaptured("pi_1".to_string()));
        let state = StateError::from(&err);
        assert!(!state.retryable);
        assert!(state.message.contains("pi_1"));
    }

    #[test]
    fn state_error_written_before_the_flag_assumes_an_effect() {
        let json = r#"{"category":"transient","message":"timeout","retryable":true}"#;
        let state: StateError = serde_json::from_str(json).unwrap();
        assert!(state.outcome_unknown());
    }
}
