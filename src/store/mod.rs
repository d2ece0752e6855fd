//! Transaction state storage.
//!
//! The store de-duplicates logical requests by fingerprint. `get_or_create`
//! is atomic: two concurrent calls for the same fingerprint can never both
//! insert. Entries are dropped by the sweeper once they age out of their
//! retention window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::coordinator::StateError;
use crate::key::Fingerprint;
use crate::model::{Outcome, TransactionStatus};
use crate::state::{NewTransaction, TransactionState};

mod file;
mod locks;
mod memory;

pub use file::FileStore;
pub use locks::{FingerprintGuard, FingerprintLocks};
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no transaction state {0}")]
    NotFound(Fingerprint),

    #[error("transaction state {id} is already {status}")]
    AlreadyTerminal {
        id: Fingerprint,
        status: TransactionStatus,
    },

    #[error("cached outcome of {0} does not match its operation")]
    OutcomeMismatch(Fingerprint),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// How long states are kept before the sweeper may drop them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    /// Age after resolution at which completed/failed states are dropped.
    pub completed_ttl: Duration,
    /// Age after creation at which unresolved pending states are dropped.
    pub stale_pending_ttl: Duration,
}

impl Retention {
    pub fn completed(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.completed_ttl).unwrap_or(chrono::Duration::MAX)
    }

    pub fn stale_pending(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_pending_ttl).unwrap_or(chrono::Duration::MAX)
    }

    /// Retention that only ever expires pending states older than `max_age`.
    pub fn pending_only(max_age: Duration) -> Self {
        Self {
            completed_ttl: Duration::MAX,
            stale_pending_ttl: max_age,
        }
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed_ttl: Duration::from_secs(60 * 60),
            stale_pending_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Persistence for [`TransactionState`]s, keyed by fingerprint.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Return the live state for `draft.id`, or insert `draft` as pending.
    /// The flag is `true` when a new entry was inserted.
    async fn get_or_create(
        &self,
        draft: NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<(TransactionState, bool), StoreError>;

    async fn get(&self, id: &Fingerprint) -> Result<Option<TransactionState>, StoreError>;

    async fn complete(
        &self,
        id: &Fingerprint,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<TransactionState, StoreError>;

    async fn fail(
        &self,
        id: &Fingerprint,
        error: StateError,
        now: DateTime<Utc>,
    ) -> Result<TransactionState, StoreError>;

    /// Ids of entries past their retention window at `now`.
    async fn expired(
        &self,
        now: DateTime<Utc>,
        retention: &Retention,
    ) -> Result<Vec<Fingerprint>, StoreError>;

    /// Remove `id` if it is still expired at `now`.
    async fn remove_expired(
        &self,
        id: &Fingerprint,
        now: DateTime<Utc>,
        retention: &Retention,
    ) -> Result<Option<TransactionState>, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_only_never_expires_terminal_states() {
        let retention = Retention::pending_only(Duration::from_secs(60));
        assert_eq!(retention.stale_pending(), chrono::Duration::seconds(60));
        assert_eq!(retention.completed(), chrono::Duration::MAX);
    }

    #[test]
    fn default_windows() {
        let retention = Retention::default();
        assert_eq!(retention.completed(), chrono::Duration::hours(1));
        assert_eq!(retention.stale_pending(), chrono::Duration::hours(24));
    }
}
