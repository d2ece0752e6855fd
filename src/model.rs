//! Core domain types for the escrow coordinator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::Amount;

/// Identifier of the user on whose behalf an operation runs.
pub type ActorId = String;

/// Sanitized metadata. Ordered so that it canonicalizes for fingerprinting.
pub type Metadata = BTreeMap<String, String>;

/// A string did not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($kind:literal, $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// The financial operations the coordinator runs against the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateAccount,
    CreateAuthorization,
    Capture,
    Cancel,
    Refund,
}

string_enum!("operation", Operation {
    CreateAccount => "create_account",
    CreateAuthorization => "create_authorization",
    Capture => "capture",
    Cancel => "cancel",
    Refund => "refund",
});

/// Local lifecycle of one attempted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

string_enum!("transaction status", TransactionStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
});

/// Processor-side lifecycle of a manual-capture authorization.
///
/// `requires_payment_method -> requires_confirmation -> requires_capture -> {captured | canceled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresCapture,
    Captured,
    Canceled,
}

impl AuthorizationStatus {
    pub fn is_capturable(self) -> bool {
        self == AuthorizationStatus::RequiresCapture
    }

    /// Funds can be released until they are captured (or already released).
    pub fn is_cancelable(self) -> bool {
        !matches!(
            self,
            AuthorizationStatus::Captured | AuthorizationStatus::Canceled
        )
    }

    pub fn is_refundable(self) -> bool {
        self == AuthorizationStatus::Captured
    }
}

string_enum!("authorization status", AuthorizationStatus {
    RequiresPaymentMethod => "requires_payment_method",
    RequiresConfirmation => "requires_confirmation",
    RequiresCapture => "requires_capture",
    Captured => "captured",
    Canceled => "canceled",
});

/// Kind of connected account created for a seller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Express,
    Standard,
}

string_enum!("account type", AccountType {
    Express => "express",
    Standard => "standard",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Duplicate,
    Fraudulent,
    RequestedByCustomer,
    Abandoned,
}

string_enum!("cancel reason", CancelReason {
    Duplicate => "duplicate",
    Fraudulent => "fraudulent",
    RequestedByCustomer => "requested_by_customer",
    Abandoned => "abandoned",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    Duplicate,
    Fraudulent,
    RequestedByCustomer,
}

string_enum!("refund reason", RefundReason {
    Duplicate => "duplicate",
    Fraudulent => "fraudulent",
    RequestedByCustomer => "requested_by_customer",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOutcome {
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationOutcome {
    pub authorization_id: String,
    pub status: AuthorizationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureOutcome {
    pub authorization_id: String,
    pub captured_amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub authorization_id: String,
    pub status: AuthorizationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundOutcome {
    pub refund_id: String,
    pub refunded_amount: Amount,
}

/// Result of a completed operation, cached alongside its state so that a
/// repeated call is answered without contacting the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Account(AccountOutcome),
    Authorization(AuthorizationOutcome),
    Capture(CaptureOutcome),
    Cancel(CancelOutcome),
    Refund(RefundOutcome),
}

impl Outcome {
    /// The processor-assigned id this outcome refers to.
    pub fn external_ref(&self) -> &str {
        match self {
            Outcome::Account(o) => &o.account_id,
            Outcome::Authorization(o) => &o.authorization_id,
            Outcome::Capture(o) => &o.authorization_id,
            Outcome::Cancel(o) => &o.authorization_id,
            Outcome::Refund(o) => &o.refund_id,
        }
    }

    /// Amount moved by this outcome, when it moved one.
    pub fn amount(&self) -> Option<Amount> {
        match self {
            Outcome::Capture(o) => Some(o.captured_amount),
            Outcome::Refund(o) => Some(o.refunded_amount),
            _ => None,
        }
    }
}

/// Converts a cached [`Outcome`] back into the typed result of one operation.
pub trait FromOutcome: Sized {
    fn from_outcome(outcome: Outcome) -> Option<Self>;
}

macro_rules! from_outcome {
    ($($variant:ident => $ty:ty),+ $(,)?) => {
        $(
            impl FromOutcome for $ty {
                fn from_outcome(outcome: Outcome) -> Option<Self> {
                    match outcome {
                        Outcome::$variant(o) => Some(o),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for Outcome {
                fn from(o: $ty) -> Self {
                    Outcome::$variant(o)
                }
            }
        )+
    };
}

from_outcome!(
    Account => AccountOutcome,
    Authorization => AuthorizationOutcome,
    Capture => CaptureOutcome,
    Cancel => CancelOutcome,
    Refund => RefundOutcome,
);
