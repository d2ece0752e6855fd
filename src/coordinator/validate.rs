//! Local request validation. Runs before any state is created or any
//! processor call is made.

use super::ValidationError;
use crate::Amount;

pub(super) fn email(raw: &str) -> Result<String, ValidationError> {
    let email = raw.trim();
    if email.is_empty() {
        return Err(ValidationError::EmptyEmail);
    }
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(ValidationError::InvalidEmail(email.to_string()));
    }
    Ok(email.to_string())
}

pub(super) fn currency(raw: &str) -> Result<String, ValidationError> {
    let code = raw.trim();
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(ValidationError::InvalidCurrency(raw.to_string()));
    }
    Ok(code.to_ascii_lowercase())
}

/// `0 < amount <= ceiling` and `0 <= fee <= amount`.
pub(super) fn amounts(amount: Amount, fee: Amount, ceiling: Amount) -> Result<(), ValidationError> {
    if !amount.is_positive() {
        return Err(ValidationError::NonPositiveAmount(amount));
    }
    if amount > ceiling {
        return Err(ValidationError::AmountAboveCeiling { amount, ceiling });
    }
    if fee < Amount::ZERO || fee > amount {
        return Err(ValidationError::FeeOutOfBounds { fee, amount });
    }
    Ok(())
}

pub(super) fn required(field: &'static str, raw: &str) -> Result<String, ValidationError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(value.to_string())
}

pub(super) fn refund_amount(amount: Option<Amount>) -> Result<(), ValidationError> {
    match amount {
        Some(amount) if !amount.is_positive() => Err(ValidationError::NonPositiveAmount(amount)),
        _ => Ok(()),
    }
}
