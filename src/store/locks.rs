use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::key::Fingerprint;

/// Per-fingerprint async locks.
///
/// The coordinator holds the lock for a fingerprint across one whole logical
/// operation, and the sweeper only drops an entry whose lock it can take
/// without waiting. An entry counts every holder and waiter and is removed
/// when the last of them goes, including a waiter that was cancelled.
#[derive(Debug, Default)]
pub struct FingerprintLocks {
    index: Mutex<HashMap<Fingerprint, Slot>>,
}

#[derive(Debug, Default)]
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    users: usize,
}

/// Held lock on one fingerprint.
#[derive(Debug)]
pub struct FingerprintGuard<'a> {
    locks: &'a FingerprintLocks,
    id: Fingerprint,
    guard: Option<OwnedMutexGuard<()>>,
}

impl FingerprintLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: &Fingerprint) -> FingerprintGuard<'_> {
        let (mutex, mut held) = self.register(id);
        held.guard = Some(mutex.lock_owned().await);
        held
    }

    /// Take the lock only if nobody holds it.
    pub fn try_lock(&self, id: &Fingerprint) -> Option<FingerprintGuard<'_>> {
        let (mutex, mut held) = self.register(id);
        held.guard = Some(mutex.try_lock_owned().ok()?);
        Some(held)
    }

    /// Number of fingerprints with a live lock.
    pub fn len(&self) -> usize {
        self.index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index(&self) -> MutexGuard<'_, HashMap<Fingerprint, Slot>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a new user of `id`. The returned guard holds nothing yet but
    /// deregisters on drop, whether or not the lock was ever acquired.
    fn register(&self, id: &Fingerprint) -> (Arc<AsyncMutex<()>>, FingerprintGuard<'_>) {
        let mutex = {
            let mut index = self.index();
            let slot = index.entry(id.clone()).or_default();
            slot.users += 1;
            Arc::clone(&slot.mutex)
        };
        let held = FingerprintGuard {
            locks: self,
            id: id.clone(),
            guard: None,
        };
        (mutex, held)
    }

    fn release(&self, id: &Fingerprint) {
        let mut index = self.index();
        if let Some(slot) = index.get_mut(id) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                index.remove(id);
            }
        }
    }
}

impl FingerprintGuard<'_> {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.id
    }
}

impl Drop for FingerprintGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.id);
    }
}
