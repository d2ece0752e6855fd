use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::EscrowCoordinator;
use crate::audit::AuditAction;
use crate::store::{Retention, StoreError};

impl EscrowCoordinator {
    /// Drop states past the configured retention windows. Returns how many went.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        self.sweep_at(Utc::now(), &self.config.retention()).await
    }

    /// Drop only pending states older than `max_age`, whatever the configured windows.
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<usize, StoreError> {
        self.sweep_at(Utc::now(), &Retention::pending_only(max_age)).await
    }

    /// Entries whose fingerprint lock is held are skipped; an operation is in
    /// flight for them and they are picked up on a later pass.
    pub async fn sweep_at(
        &self,
        now: DateTime<Utc>,
        retention: &Retention,
    ) -> Result<usize, StoreError> {
        let mut removed = 0;
        for id in self.store.expired(now, retention).await? {
            let Some(_guard) = self.locks.try_lock(&id) else {
                debug!(fingerprint = %id, "in flight, not sweeping");
                continue;
            };
            if let Some(state) = self.store.remove_expired(&id, now, retention).await? {
                if state.status.is_terminal() {
                    debug!(fingerprint = %id, status = %state.status, "expired");
                } else {
                    warn!(
                        fingerprint = %id,
                        operation = %state.operation,
                        actor = %state.actor_id,
                        "dropping stale pending state"
                    );
                }
                self.audit.record_state(AuditAction::Swept, &state);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept expired states");
        }
        Ok(removed)
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the handle is
    /// shut down or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let coordinator = Arc::clone(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.sweep().await {
                            warn!(reason = %e, "sweep failed");
                        }
                    }
                }
            }
            debug!("sweeper stopped");
        });

        SweeperHandle {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }
}

/// Owns the background sweeper task. Dropping it aborts the task.
#[derive(Debug)]
pub struct SweeperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop after the current pass, if any, and wait for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(reason = %e, "sweeper task ended abnormally");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, MemoryAuditSink};
    use crate::config::CoordinatorConfig;
    use crate::coordinator::AccountParams;
    use crate::key;
    use crate::model::{AccountType, Metadata, Operation};
    use crate::processor::MemoryProcessor;
    use crate::state::NewTransaction;
    use crate::store::{MemoryStore, TransactionStore};

    fn coordinator(store: Arc<MemoryStore>, audit: Arc<MemoryAuditSink>) -> Arc<EscrowCoordinator> {
        Arc::new(EscrowCoordinator::new(
            Arc::new(MemoryProcessor::new()),
            store,
            AuditLog::new().with_sink(audit),
            CoordinatorConfig::default()
                .completed_ttl(Duration::from_secs(60))
                .sweep_interval(Duration::from_secs(30)),
        ))
    }

    fn pending_draft(actor: &str) -> NewTransaction {
        let context = Metadata::from([("authorization_id".to_string(), "pi_1".to_string())]);
        NewTransaction {
            id: key::fingerprint(Operation::Capture, actor, &context),
            operation: Operation::Capture,
            actor_id: actor.to_string(),
            idempotency_key: key::generate(Operation::Capture, actor, &context),
            context,
        }
    }

    #[tokio::test]
    async fn sweep_removes_expired_completed_states() {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let coordinator = coordinator(store.clone(), audit.clone());
        coordinator
            .create_account("seller", AccountParams::new("s@example.com", AccountType::Express))
            .await
            .unwrap();

        let retention = coordinator.config().retention();
        let soon = Utc::now() + chrono::Duration::seconds(10);
        assert_eq!(coordinator.sweep_at(soon, &retention).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(coordinator.sweep_at(later, &retention).await.unwrap(), 1);
        assert_eq!(store.len().await.unwrap(), 0);
        assert_eq!(audit.actions().last(), Some(&AuditAction::Swept));
    }

    #[tokio::test]
    async fn sweep_stale_only_touches_old_pending_states() {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let coordinator = coordinator(store.clone(), audit.clone());

        let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
        store.get_or_create(pending_draft("old"), an_hour_ago).await.unwrap();
        store.get_or_create(pending_draft("new"), Utc::now()).await.unwrap();
        coordinator
            .create_account("seller", AccountParams::new("s@example.com", AccountType::Express))
            .await
            .unwrap();

        let removed = coordinator.sweep_stale(Duration::from_secs(30 * 60)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len().await.unwrap(), 2);
        assert!(store.get(&pending_draft("old").id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_skips_states_with_an_operation_in_flight() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(store.clone(), Arc::new(MemoryAuditSink::new()));
        let draft = pending_draft("busy");
        let id = draft.id.clone();
        store
            .get_or_create(draft, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();

        let guard = coordinator.locks.lock(&id).await;
        assert_eq!(coordinator.sweep_stale(Duration::from_secs(60)).await.unwrap(), 0);
        drop(guard);
        assert_eq!(coordinator.sweep_stale(Duration::from_secs(60)).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_runs_and_shuts_down() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(EscrowCoordinator::new(
            Arc::new(MemoryProcessor::new()),
            store.clone(),
            AuditLog::new(),
            CoordinatorConfig::default()
                .stale_pending_ttl(Duration::ZERO)
                .sweep_interval(Duration::from_secs(30)),
        ));
        store.get_or_create(pending_draft("old"), Utc::now()).await.unwrap();

        let handle = coordinator.spawn_sweeper();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.len().await.unwrap(), 0);

        handle.shutdown().await;
    }
}
