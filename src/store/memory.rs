use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Retention, StoreError, TransactionStore};
use crate::coordinator::StateError;
use crate::key::Fingerprint;
use crate::model::Outcome;
use crate::state::{NewTransaction, TransactionState, admit};

/// Fingerprint-indexed rows. Every method is one critical section for the
/// store that owns the table.
#[derive(Debug, Default)]
pub(crate) struct Table {
    rows: HashMap<Fingerprint, TransactionState>,
}

impl Table {
    pub(crate) fn from_rows(rows: impl IntoIterator<Item = TransactionState>) -> Self {
        Self {
            rows: rows.into_iter().map(|row| (row.id.clone(), row)).collect(),
        }
    }

    pub(crate) fn rows(&self) -> impl Iterator<Item = &TransactionState> {
        self.rows.values()
    }

    pub(crate) fn get_or_create(
        &mut self,
        draft: NewTransaction,
        now: DateTime<Utc>,
    ) -> (TransactionState, bool) {
        let (state, is_new) = admit(self.rows.get(&draft.id), draft, now);
        if is_new {
            self.rows.insert(state.id.clone(), state.clone());
        }
        (state, is_new)
    }

    pub(crate) fn get(&self, id: &Fingerprint) -> Option<TransactionState> {
        self.rows.get(id).cloned()
    }

    pub(crate) fn complete(
        &mut self,
        id: &Fingerprint,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<TransactionState, StoreError> {
        let row = self
            .rows
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        row.complete(outcome, now)?;
        Ok(row.clone())
    }

    pub(crate) fn fail(
        &mut self,
        id: &Fingerprint,
        error: StateError,
        now: DateTime<Utc>,
    ) -> Result<TransactionState, StoreError> {
        let row = self
            .rows
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        row.fail(error, now)?;
        Ok(row.clone())
    }

    pub(crate) fn expired(&self, now: DateTime<Utc>, retention: &Retention) -> Vec<Fingerprint> {
        self.rows
            .values()
            .filter(|row| row.is_expired(now, retention))
            .map(|row| row.id.clone())
            .collect()
    }

    pub(crate) fn remove_expired(
        &mut self,
        id: &Fingerprint,
        now: DateTime<Utc>,
        retention: &Retention,
    ) -> Option<TransactionState> {
        if self.rows.get(id)?.is_expired(now, retention) {
            self.rows.remove(id)
        } else {
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Process-local store. Dedup history is lost on restart; use
/// [`FileStore`](super::FileStore) where that matters.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: Mutex<Table>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn get_or_create(
        &self,
        draft: NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<(TransactionState, bool), StoreError> {
        Ok(self.table().get_or_create(draft, now))
    }

    async fn get(&self, id: &Fingerprint) -> Result<Option<TransactionState>, StoreError> {
        Ok(self.table().get(id))
    }

    async fn complete(
        &self,
        id: &Fingerprint,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<TransactionState, StoreError> {
        self.table().complete(id, outcome, now)
    }

    async fn fail(
        &self,
        id: &Fingerprint,
        error: StateError,
        now: DateTime<Utc>,
    ) -> Result<TransactionState, StoreError> {
        self.table().fail(id, error, now)
    }

    async fn expired(
        &self,
        now: DateTime<Utc>,
        retention: &Retention,
    ) -> Result<Vec<Fingerprint>, StoreError> {
        Ok(self.table().expired(now, retention))
    }

    async fn remove_expired(
        &self,
        id: &Fingerprint,
        now: DateTime<Utc>,
        retention: &Retention,
    ) -> Result<Option<TransactionState>, StoreError> {
        Ok(self.table().remove_expired(id, now, retention))
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.table().len())
    }
}
