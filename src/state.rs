use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinator::StateError;
use crate::key::{Fingerprint, IdempotencyKey};
use crate::model::{ActorId, Metadata, Operation, Outcome, TransactionStatus};
use crate::store::{Retention, StoreError};

/// One attempted financial operation.
///
/// `outcome` (and with it the external ref) is present iff the status is
/// `completed`; `error` iff it is `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionState {
    pub id: Fingerprint,
    pub operation: Operation,
    pub actor_id: ActorId,
    pub status: TransactionStatus,
    pub idempotency_key: IdempotencyKey,
    pub context: Metadata,
    pub outcome: Option<Outcome>,
    pub error: Option<StateError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to create a pending state if none exists.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub id: Fingerprint,
    pub operation: Operation,
    pub actor_id: ActorId,
    pub context: Metadata,
    pub idempotency_key: IdempotencyKey,
}

impl TransactionState {
    pub fn pending(draft: NewTransaction, now: DateTime<Utc>) -> Self {
        Self {
            id: draft.id,
            operation: draft.operation,
            actor_id: draft.actor_id,
            status: TransactionStatus::Pending,
            idempotency_key: draft.idempotency_key,
            context: draft.context,
            outcome: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn external_ref(&self) -> Option<&str> {
        self.outcome.as_ref().map(Outcome::external_ref)
    }

    pub fn complete(&mut self, outcome: Outcome, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.ensure_pending()?;
        self.status = TransactionStatus::Completed;
        self.outcome = Some(outcome);
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, error: StateError, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.ensure_pending()?;
        self.status = TransactionStatus::Failed;
        self.error = Some(error);
        self.updated_at = now;
        Ok(())
    }

    /// Terminal states expire `completed_ttl` after resolving; pending states
    /// go stale `stale_pending_ttl` after creation.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: &Retention) -> bool {
        match self.status {
            TransactionStatus::Pending => now - self.created_at >= retention.stale_pending(),
            _ => now - self.updated_at >= retention.completed(),
        }
    }

    fn ensure_pending(&self) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::AlreadyTerminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }
}

/// Decide what `get_or_create` returns for the current slot content.
///
/// Pending and completed entries are reused as-is. A failed entry is replaced
/// by a fresh pending one. When the failed attempt had issued its mutating
/// call and got no definite answer, the fresh entry keeps the old idempotency
/// key so the processor can still collapse the retry onto the first effect.
pub(crate) fn admit(
    slot: Option<&TransactionState>,
    mut draft: NewTransaction,
    now: DateTime<Utc>,
) -> (TransactionState, bool) {
    match slot {
        Some(existing) if existing.status != TransactionStatus::Failed => (existing.clone(), false),
        Some(failed) => {
            if failed.error.as_ref().is_some_and(StateError::outcome_unknown) {
                draft.idempotency_key = failed.idempotency_key.clone();
            }
            (TransactionState::pending(draft, now), true)
        }
        None => (TransactionState::pending(draft, now), true),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coordinator::ErrorCategory;
    use crate::key;
    use crate::model::AccountOutcome;
    use chrono::Duration;

    pub(crate) fn draft(actor: &str) -> NewTransaction {
        let mut context = Metadata::new();
        context.insert("email".to_string(), format!("{actor}@example.com"));
        NewTransaction {
            id: key::fingerprint(Operation::CreateAccount, actor, &context),
            operation: Operation::CreateAccount,
            actor_id: actor.to_string(),
            idempotency_key: key::generate(Operation::CreateAccount, actor, &context),
            context,
        }
    }

    pub(crate) fn outcome() -> Outcome {
        Outcome::Account(AccountOutcome {
            account_id: "acct_1".to_string(),
        })
    }

    pub(crate) fn transient_error() -> StateError {
        StateError {
            category: ErrorCategory::Transient,
            message: "timeout".to_string(),
            retryable: true,
            effect_possible: true,
        }
    }

    #[test]
    fn complete_sets_outcome_once() {
        let now = Utc::now();
        let mut state = TransactionState::pending(draft("a"), now);
        assert_eq!(state.external_ref(), None);

        state.complete(outcome(), now).unwrap();
        assert_eq!(state.status, TransactionStatus::Completed);
        assert_eq!(state.external_ref(), Some("acct_1"));

        assert!(matches!(
            state.fail(transient_error(), now),
            Err(StoreError::AlreadyTerminal { .. })
        ));
        assert!(state.error.is_none());
    }

    #[test]
    fn failed_state_keeps_no_outcome() {
        let now = Utc::now();
        let mut state = TransactionState::pending(draft("a"), now);
        state.fail(transient_error(), now).unwrap();
        assert_eq!(state.external_ref(), None);
        assert!(state.complete(outcome(), now).is_err());
    }

    #[test]
    fn admit_reuses_pending_and_completed() {
        let now = Utc::now();
        let pending = TransactionState::pending(draft("a"), now);
        let (state, is_new) = admit(Some(&pending), draft("a"), now);
        assert!(!is_new);
        assert_eq!(state.idempotency_key, pending.idempotency_key);

        let mut done = pending.clone();
        done.complete(outcome(), now).unwrap();
        let (state, is_new) = admit(Some(&done), draft("a"), now);
        assert!(!is_new);
        assert_eq!(state.status, TransactionStatus::Completed);
    }

    #[test]
    fn admit_replaces_failed_and_inherits_key_when_outcome_unknown() {
        let now = Utc::now();
        let mut failed = TransactionState::pending(draft("a"), now);
        failed.fail(transient_error(), now).unwrap();

        let (state, is_new) = admit(Some(&failed), draft("a"), now);
        assert!(is_new);
        assert_eq!(state.status, TransactionStatus::Pending);
        assert_eq!(state.idempotency_key, failed.idempotency_key);

        let mut rejected = TransactionState::pending(draft("a"), now);
        rejected
            .fail(
                StateError {
                    category: ErrorCategory::Validation,
                    message: "not capturable".to_string(),
                    retryable: false,
                    effect_possible: false,
                },
                now,
            )
            .unwrap();
        let (state, is_new) = admit(Some(&rejected), draft("a"), now);
        assert!(is_new);
        assert_ne!(state.idempotency_key, rejected.idempotency_key);
    }

    #[test]
    fn admit_mints_new_key_when_only_a_lookup_failed() {
        let now = Utc::now();
        let mut failed = TransactionState::pending(draft("a"), now);
        let lookup_timeout = StateError {
            effect_possible: false,
            ..transient_error()
        };
        failed.fail(lookup_timeout, now).unwrap();

        let (state, is_new) = admit(Some(&failed), draft("a"), now);
        assert!(is_new);
        assert_ne!(state.idempotency_key, failed.idempotency_key);
    }

    #[test]
    fn expiry_windows() {
        let retention = Retention::default();
        let created = Utc::now();
        let mut state = TransactionState::pending(draft("a"), created);

        assert!(!state.is_expired(created + Duration::hours(23), &retention));
        assert!(state.is_expired(created + Duration::hours(24), &retention));

        state.complete(outcome(), created).unwrap();
        assert!(!state.is_expired(created + Duration::minutes(59), &retention));
        assert!(state.is_expired(created + Duration::hours(1), &retention));
    }
}
