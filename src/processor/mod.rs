//! The external payment processor seam.
//!
//! The processor is an opaque capability. The coordinator only relies on the
//! resource ids and statuses it returns and on the structured
//! [`ProcessorError`] classification of its failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::Amount;
use crate::key::IdempotencyKey;
use crate::model::{AccountType, AuthorizationStatus, CancelReason, Metadata, RefundReason};
use crate::retry::Retryable;

mod memory;
pub use memory::{MemoryProcessor, ProcessorCall};

/// Failure category supplied by the processor client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorErrorKind {
    /// Network failure or 5xx.
    Transient,
    RateLimited,
    /// No answer within the call timeout. The effect may have happened.
    Timeout,
    /// The processor deterministically refuses the request.
    Permanent,
    /// The request is malformed (4xx).
    InvalidRequest,
}

impl ProcessorErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ProcessorErrorKind::Transient
                | ProcessorErrorKind::RateLimited
                | ProcessorErrorKind::Timeout
        )
    }

    /// Classify an HTTP status returned by a processor API.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            408 => ProcessorErrorKind::Timeout,
            429 => ProcessorErrorKind::RateLimited,
            400..=499 => ProcessorErrorKind::InvalidRequest,
            500..=599 => ProcessorErrorKind::Transient,
            _ => ProcessorErrorKind::Permanent,
        }
    }
}

impl fmt::Display for ProcessorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessorErrorKind::Transient => "transient",
            ProcessorErrorKind::RateLimited => "rate limited",
            ProcessorErrorKind::Timeout => "timeout",
            ProcessorErrorKind::Permanent => "permanent",
            ProcessorErrorKind::InvalidRequest => "invalid request",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} processor error [{code}]: {message}")]
pub struct ProcessorError {
    pub kind: ProcessorErrorKind,
    pub code: String,
    pub message: String,
}

impl ProcessorError {
    pub fn new(
        kind: ProcessorErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProcessorErrorKind::Transient, "api_error", message)
    }

    pub fn invalid_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProcessorErrorKind::InvalidRequest, code, message)
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProcessorErrorKind::Permanent, code, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ProcessorErrorKind::Timeout,
            "timeout",
            format!("no response after {}ms", after.as_millis()),
        )
    }

    /// Build from an HTTP status and the processor's error body.
    pub fn from_http(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProcessorErrorKind::from_http_status(status), code, message)
    }
}

impl Retryable for ProcessorError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRequest {
    pub email: String,
    pub account_type: AccountType,
    pub metadata: Metadata,
}

/// A manual-capture authorization routed to a connected account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub amount: Amount,
    pub currency: String,
    pub destination_account: String,
    pub platform_fee: Amount,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub authorization_id: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub authorization_id: String,
    pub reason: Option<CancelReason>,
    pub metadata: Metadata,
}

/// `amount: None` refunds whatever is left of the capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub authorization_id: String,
    pub amount: Option<Amount>,
    pub reason: Option<RefundReason>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub account_type: AccountType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub id: String,
    pub amount: Amount,
    pub currency: String,
    pub destination_account: String,
    pub platform_fee: Amount,
    pub status: AuthorizationStatus,
    pub amount_captured: Amount,
    pub amount_refunded: Amount,
}

impl Authorization {
    /// Captured funds not yet refunded.
    pub fn refundable(&self) -> Amount {
        self.amount_captured - self.amount_refunded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub authorization_id: String,
    pub amount: Amount,
    pub reason: Option<RefundReason>,
}

/// Operations the coordinator issues against the payment processor.
///
/// Mutating calls carry an [`IdempotencyKey`]; a call repeated with the same
/// key must return the original resource without a second effect.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_account(
        &self,
        request: &AccountRequest,
        key: &IdempotencyKey,
    ) -> Result<Account, ProcessorError>;

    async fn create_authorization(
        &self,
        request: &AuthorizationRequest,
        key: &IdempotencyKey,
    ) -> Result<Authorization, ProcessorError>;

    async fn retrieve_authorization(
        &self,
        authorization_id: &str,
    ) -> Result<Authorization, ProcessorError>;

    async fn capture(
        &self,
        request: &CaptureRequest,
        key: &IdempotencyKey,
    ) -> Result<Authorization, ProcessorError>;

    async fn cancel(
        &self,
        request: &CancelRequest,
        key: &IdempotencyKey,
    ) -> Result<Authorization, ProcessorError>;

    async fn refund(
        &self,
        request: &RefundRequest,
        key: &IdempotencyKey,
    ) -> Result<Refund, ProcessorError>;
}
