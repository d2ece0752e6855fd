use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use super::memory::Table;
use super::{Retention, StoreError, TransactionStore};
use crate::coordinator::StateError;
use crate::key::Fingerprint;
use crate::model::Outcome;
use crate::state::{NewTransaction, TransactionState};

/// Durable store: the table is rewritten to a JSON file after every mutation,
/// so dedup history and idempotency keys survive a restart.
///
/// The table is serialized under its lock; the file write runs on the
/// blocking pool afterwards. Writes go to a sibling temp file which is then
/// renamed over the target, and a snapshot older than the last one written
/// is dropped. One process owns the file; several instances need a shared
/// database.
#[derive(Debug)]
pub struct FileStore {
    path: Arc<PathBuf>,
    table: Mutex<Versioned>,
    written: AsyncMutex<u64>,
}

#[derive(Debug)]
struct Versioned {
    table: Table,
    generation: u64,
}

/// Serialized table at one generation.
struct Snapshot {
    generation: u64,
    bytes: Vec<u8>,
}

impl Versioned {
    fn snapshot(&mut self) -> Result<Snapshot, StoreError> {
        let mut rows: Vec<&TransactionState> = self.table.rows().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        let bytes = serde_json::to_vec(&rows)?;
        self.generation += 1;
        Ok(Snapshot {
            generation: self.generation,
            bytes,
        })
    }
}

impl FileStore {
    /// Open `path`, loading any states persisted by a previous run.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let rows: Vec<TransactionState> = match fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), states = rows.len(), "opened transaction store");
        Ok(Self {
            path: Arc::new(path),
            table: Mutex::new(Versioned {
                table: Table::from_rows(rows),
                generation: 0,
            }),
            written: AsyncMutex::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn table(&self) -> MutexGuard<'_, Versioned> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut written = self.written.lock().await;
        if snapshot.generation <= *written {
            debug!(generation = snapshot.generation, "newer snapshot already written");
            return Ok(());
        }

        let path = Arc::clone(&self.path);
        let bytes = snapshot.bytes;
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(std::io::Error::other)??;
        *written = snapshot.generation;
        Ok(())
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut writer = BufWriter::new(fs::File::create(&tmp)?);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[async_trait]
impl TransactionStore for FileStore {
    async fn get_or_create(
        &self,
        draft: NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<(TransactionState, bool), StoreError> {
        let (state, is_new, snapshot) = {
            let mut versioned = self.table();
            let (state, is_new) = versioned.table.get_or_create(draft, now);
            let snapshot = if is_new { Some(versioned.snapshot()?) } else { None };
            (state, is_new, snapshot)
        };
        if let Some(snapshot) = snapshot {
            self.persist(snapshot).await?;
        }
        Ok((state, is_new))
    }

    async fn get(&self, id: &Fingerprint) -> Result<Option<TransactionState>, StoreError> {
        Ok(self.table().table.get(id))
    }

    async fn complete(
        &self,
        id: &Fingerprint,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<TransactionState, StoreError> {
        let (state, snapshot) = {
            let mut versioned = self.table();
            let state = versioned.table.complete(id, outcome, now)?;
            (state, versioned.snapshot()?)
        };
        self.persist(snapshot).await?;
        Ok(state)
    }

    async fn fail(
        &self,
        id: &Fingerprint,
        error: StateError,
        now: DateTime<Utc>,
    ) -> Result<TransactionState, StoreError> {
        let (state, snapshot) = {
            let mut versioned = self.table();
            let state = versioned.table.fail(id, error, now)?;
            (state, versioned.snapshot()?)
        };
        self.persist(snapshot).await?;
        Ok(state)
    }

    async fn expired(
        &self,
        now: DateTime<Utc>,
        retention: &Retention,
    ) -> Result<Vec<Fingerprint>, StoreError> {
        Ok(self.table().table.expired(now, retention))
    }

    async fn remove_expired(
        &self,
        id: &Fingerprint,
        now: DateTime<Utc>,
        retention: &Retention,
    ) -> Result<Option<TransactionState>, StoreError> {
        let (removed, snapshot) = {
            let mut versioned = self.table();
            let removed = versioned.table.remove_expired(id, now, retention);
            let snapshot = match removed {
                Some(_) => Some(versioned.snapshot()?),
                None => None,
            };
            (removed, snapshot)
        };
        if let Some(snapshot) = snapshot {
            self.persist(snapshot).await?;
        }
        Ok(removed)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.table().table.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransactionStatus;
    use crate::state::tests::{draft, outcome, transient_error};
    use tempfile::tempdir;

    #[tokio::test]
    async fn states_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.json");
        let now = Utc::now();

        let (pending, done) = {
            let store = FileStore::open(&path).unwrap();
            let (pending, _) = store.get_or_create(draft("a"), now).await.unwrap();
            let (done, _) = store.get_or_create(draft("b"), now).await.unwrap();
            let done = store.complete(&done.id, outcome(), now).await.unwrap();
            (pending, done)
        };

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.len().await.unwrap(), 2);

        let (resumed, is_new) = store.get_or_create(draft("a"), now).await.unwrap();
        assert!(!is_new);
        assert_eq!(resumed.status, TransactionStatus::Pending);
        assert_eq!(resumed.idempotency_key, pending.idempotency_key);

        let (cached, is_new) = store.get_or_create(draft("b"), now).await.unwrap();
        assert!(!is_new);
        assert_eq!(cached, done);
    }

    #[tokio::test]
    async fn failed_with_unknown_outcome_keeps_key_across_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.json");
        let now = Utc::now();

        let original = {
            let store = FileStore::open(&path).unwrap();
            let (state, _) = store.get_or_create(draft("a"), now).await.unwrap();
            store.fail(&state.id, transient_error(), now).await.unwrap();
            state
        };

        let store = FileStore::open(&path).unwrap();
        let (retry, is_new) = store.get_or_create(draft("a"), now).await.unwrap();
        assert!(is_new);
        assert_eq!(retry.idempotency_key, original.idempotency_key);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_leave_the_latest_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.json");
        let store = Arc::new(FileStore::open(&path).unwrap());
        let now = Utc::now();

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let (state, _) = store.get_or_create(draft(&format!("actor_{i}")), now).await?;
                    store.complete(&state.id, outcome(), now).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.len().await.unwrap(), 16);
        for i in 0..16 {
            let id = draft(&format!("actor_{i}")).id;
            let state = reopened.get(&id).await.unwrap().unwrap();
            assert_eq!(state.status, TransactionStatus::Completed);
        }
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("absent.json")).unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.json");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(FileStore::open(&path), Err(StoreError::Serde(_))));
    }
}
