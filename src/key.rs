//! Fingerprints and idempotency keys.
//!
//! A [`Fingerprint`] is fully deterministic in (operation, actor, context) and
//! identifies one logical request in the transaction store. An
//! [`IdempotencyKey`] is what the processor de-duplicates on; it is traceable
//! back to the logical request through its short hash but carries a random
//! nonce, so it is minted once per transaction state and reused for every
//! physical attempt of that state.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::model::{Metadata, Operation};

/// Hex chars of the request hash embedded in an idempotency key.
const SHORT_HASH_LEN: usize = 16;

/// Random bytes appended to an idempotency key.
const NONCE_BYTES: usize = 8;

/// Deterministic id of a logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token passed to the processor so repeated physical calls collapse to one effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Wrap a key minted elsewhere, e.g. one echoed back by the processor.
    pub fn new(key: impl Into<String>) -> Self {
        IdempotencyKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash (operation, actor, context) into a canonical digest.
///
/// Every field is length-prefixed, so no choice of separator characters in the
/// inputs can make two different requests hash alike. The context is a
/// `BTreeMap`, so iteration order is already canonical.
fn request_digest(operation: Operation, actor: &str, context: &Metadata) -> [u8; 32] {
    fn put(hasher: &mut Sha256, bytes: &[u8]) {
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }

    let mut hasher = Sha256::new();
    put(&mut hasher, operation.as_str().as_bytes());
    put(&mut hasher, actor.as_bytes());
    hasher.update((context.len() as u64).to_be_bytes());
    for (key, value) in context {
        put(&mut hasher, key.as_bytes());
        put(&mut hasher, value.as_bytes());
    }
    hasher.finalize().into()
}

/// Deterministic fingerprint of a logical request.
pub fn fingerprint(operation: Operation, actor: &str, context: &Metadata) -> Fingerprint {
    Fingerprint(hex::encode(request_digest(operation, actor, context)))
}

/// Mint a fresh idempotency key: `operation_shorthash_nonce`.
pub fn generate(operation: Operation, actor: &str, context: &Metadata) -> IdempotencyKey {
    let digest = hex::encode(request_digest(operation, actor, context));
    let nonce: [u8; NONCE_BYTES] = rand::random();
    IdempotencyKey(format!(
        "{}_{}_{}",
        operation,
        &digest[..SHORT_HASH_LEN],
        hex::encode(nonce)
    ))
}
