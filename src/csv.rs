use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::coordinator::{
    AccountParams, AuthorizationParams, EscrowError, Executed, Handled, RefundParams, Request,
};
use crate::model::{ActorId, UnknownVariant};
use crate::Amount;

/// Errors that can occur when parsing csv rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open csv file: {0}")]
    Open(csv::Error),

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized operation '{op}'")]
    UnrecognizedOperation { line: usize, op: String },

    #[error("line {line}: {op} missing {field}")]
    MissingField {
        line: usize,
        op: String,
        field: &'static str,
    },

    #[error("line {line}: {source}")]
    Variant { line: usize, source: UnknownVariant },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    op: String,
    actor: ActorId,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    amount: Option<f64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    fee: Option<f64>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    account_type: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    op: &'a str,
    actor: &'a str,
    status: &'a str,
    external_ref: &'a str,
    amount: String,
    error: String,
}

/// Read coordinator requests from a csv file
pub fn read_requests(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Request, CsvError>>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(CsvError::Open)?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_row(line, row)
        }))
}

fn parse_row(line: usize, row: InputRow) -> Result<Request, CsvError> {
    let op = row.op.clone();
    let missing = |field: &'static str| CsvError::MissingField {
        line,
        op: op.clone(),
        field,
    };
    let variant = |source| CsvError::Variant { line, source };

    let request = match row.op.as_str() {
        "create_account" => {
            let email = row.email.ok_or_else(|| missing("email"))?;
            let account_type = row
                .account_type
                .ok_or_else(|| missing("account_type"))?
                .parse()
                .map_err(variant)?;
            Request::CreateAccount {
                actor: row.actor,
                params: AccountParams::new(email, account_type),
            }
        }
        "create_authorization" => {
            let amount = row.amount.ok_or_else(|| missing("amount"))?;
            let currency = row.currency.ok_or_else(|| missing("currency"))?;
            let destination = row.destination.ok_or_else(|| missing("destination"))?;
            Request::CreateAuthorization {
                actor: row.actor,
                params: AuthorizationParams::new(
                    Amount::from_float(amount),
                    currency,
                    destination,
                    row.fee.map(Amount::from_float).unwrap_or(Amount::ZERO),
                ),
            }
        }
        "capture" => Request::Capture {
            actor: row.actor,
            authorization_id: row.target.ok_or_else(|| missing("target"))?,
        },
        "cancel" => Request::Cancel {
            actor: row.actor,
            authorization_id: row.target.ok_or_else(|| missing("target"))?,
            reason: row.reason.map(|r| r.parse()).transpose().map_err(variant)?,
        },
        "refund" => {
            let target = row.target.ok_or_else(|| missing("target"))?;
            let mut params = match row.amount {
                Some(amount) => RefundParams::partial(target, Amount::from_float(amount)),
                None => RefundParams::full(target),
            };
            params.reason = row.reason.map(|r| r.parse()).transpose().map_err(variant)?;
            Request::Refund {
                actor: row.actor,
                params,
            }
        }
        other => {
            return Err(CsvError::UnrecognizedOperation {
                line,
                op: other.to_string(),
            });
        }
    };
    Ok(request)
}

/// write handled requests to stdout in csv format
pub fn write_results<'a>(handled: impl IntoIterator<Item = &'a Handled>) -> io::Result<()> {
    let stdout = io::stdout();
    write_results_to(stdout.lock(), handled)
}

pub fn write_results_to<'a, W: io::Write>(
    out: W,
    handled: impl IntoIterator<Item = &'a Handled>,
) -> io::Result<()> {
    let mut writer = csv::Writer::from_writer(out);

    for h in handled {
        let (status, external_ref, amount, error) = match &h.result {
            Ok(Executed { state, result }) => (
                state.status.as_str(),
                result.external_ref(),
                result.amount().map(|a| a.to_string()).unwrap_or_default(),
                String::new(),
            ),
            Err(e) => ("failed", "", String::new(), error_text(e)),
        };
        writer.serialize(OutputRow {
            op: h.operation.as_str(),
            actor: &h.actor,
            status,
            external_ref,
            amount,
            error,
        })?;
    }

    writer.flush()
}

fn error_text(e: &EscrowError) -> String {
    format!("{}: {}", e.category(), e.public_message())
}
