//! Verification of asynchronous processor notifications.
//!
//! Signature header: `t=<unix seconds>,v1=<hex>[,v1=<hex>...]`, where each
//! `v1` is `hex(HMAC-SHA256(secret, "{t}.{payload}"))`. Several `v1` entries
//! appear while the processor rotates secrets.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance between the signed timestamp and now.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("malformed signature header")]
    MalformedHeader,
    #[error("no v1 signature in header")]
    NoSignature,
    #[error("signature mismatch")]
    Mismatch,
    #[error("timestamp {0} outside tolerance")]
    Expired(i64),
    #[error("empty webhook secret")]
    EmptySecret,
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}

/// A verified processor notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Signature over `payload` at `timestamp`, hex encoded.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    hex::encode(mac(secret, timestamp, payload).finalize().into_bytes())
}

fn mac(secret: &str, timestamp: i64, payload: &[u8]) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac
}

struct ParsedHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> Result<ParsedHeader, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let (name, value) = part
            .trim()
            .split_once('=')
            .ok_or(SignatureError::MalformedHeader)?;
        match name {
            "t" => {
                timestamp = Some(value.parse().map_err(|_| SignatureError::MalformedHeader)?);
            }
            "v1" => {
                // Undecodable entries are skipped; they can never match.
                if let Ok(sig) = hex::decode(value) {
                    signatures.push(sig);
                }
            }
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(SignatureError::NoSignature);
    }
    Ok(ParsedHeader {
        timestamp,
        signatures,
    })
}

#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance: Option<Duration>,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance: Some(DEFAULT_TOLERANCE),
        }
    }

    /// `None` disables the timestamp check.
    pub fn with_tolerance(mut self, tolerance: Option<Duration>) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn verify(
        &self,
        payload: &[u8],
        header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        if self.secret.is_empty() {
            return Err(SignatureError::EmptySecret);
        }
        let parsed = parse_header(header)?;

        // verify_slice compares in constant time
        let matched = parsed.signatures.iter().any(|sig| {
            mac(&self.secret, parsed.timestamp, payload)
                .verify_slice(sig)
                .is_ok()
        });
        if !matched {
            return Err(SignatureError::Mismatch);
        }

        if let Some(tolerance) = self.tolerance {
            let skew = (now.timestamp() - parsed.timestamp).unsigned_abs();
            if skew > tolerance.as_secs() {
                return Err(SignatureError::Expired(parsed.timestamp));
            }
        }
        Ok(())
    }

    /// Verify, then parse the payload into an event.
    pub fn construct_event(
        &self,
        payload: &[u8],
        header: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, SignatureError> {
        self.verify(payload, header, now)?;
        let event: WebhookEvent = serde_json::from_slice(payload)
            .map_err(|e| SignatureError::InvalidPayload(e.to_string()))?;
        debug!(id = %event.id, event_type = %event.event_type, "webhook verified");
        Ok(event)
    }
}

/// `true` only if `signature` is a valid, fresh signature of `payload` under `secret`.
pub fn verify_webhook_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    match WebhookVerifier::new(secret).verify(payload, signature, Utc::now()) {
        Ok(()) => true,
        Err(e) => {
            debug!(reason = %e, "webhook signature rejected");
            false
        }
    }
}
