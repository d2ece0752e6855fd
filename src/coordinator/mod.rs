//! Escrow transaction coordinator.
//!
//! Wraps the processor's account, authorization, capture, cancel and refund
//! calls with fingerprint de-duplication, bounded retry and audit logging.
//! Every operation follows the same path:
//!
//! 1. validate the request locally,
//! 2. take the fingerprint lock and `get_or_create` its state,
//! 3. answer a completed state from its cached outcome,
//! 4. otherwise check state preconditions and issue the processor call with
//!    the state's idempotency key, retrying transient failures,
//! 5. record the state as completed or failed and audit the transition.
//!
//! A state left pending by a crashed run is resumed with its original key and
//! without local precondition checks, since the first attempt may already
//! have moved the authorization; the processor replays its answer by key.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditAction, AuditLog};
use crate::config::CoordinatorConfig;
use crate::key::{self, IdempotencyKey};
use crate::model::{
    AccountOutcome, AccountType, ActorId, AuthorizationOutcome, AuthorizationStatus,
    CancelOutcome, CancelReason, CaptureOutcome, FromOutcome, Metadata, Operation, Outcome,
    RefundOutcome, RefundReason, TransactionStatus,
};
use crate::processor::{
    AccountRequest, AuthorizationRequest, CancelRequest, CaptureRequest, PaymentProcessor,
    ProcessorError, RefundRequest,
};
use crate::retry::RetryPolicy;
use crate::sanitize::{MetadataSanitizer, RawMetadata};
use crate::state::{NewTransaction, TransactionState};
use crate::store::{FingerprintLocks, StoreError, TransactionStore};
use crate::webhook;
use crate::Amount;

mod error;
mod sweeper;
mod validate;

pub use error::{ErrorCategory, EscrowError, StateError, ValidationError};
pub use sweeper::SweeperHandle;

/// Result of an operation together with the state that records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed<T> {
    pub state: TransactionState,
    pub result: T,
}

impl<T> Executed<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Executed<U> {
        Executed {
            state: self.state,
            result: f(self.result),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountParams {
    pub email: String,
    pub account_type: AccountType,
    pub metadata: RawMetadata,
}

impl AccountParams {
    pub fn new(email: impl Into<String>, account_type: AccountType) -> Self {
        Self {
            email: email.into(),
            account_type,
            metadata: RawMetadata::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationParams {
    pub amount: Amount,
    pub currency: String,
    pub destination_account: String,
    pub platform_fee: Amount,
    pub metadata: RawMetadata,
}

impl AuthorizationParams {
    pub fn new(
        amount: Amount,
        currency: impl Into<String>,
        destination_account: impl Into<String>,
        platform_fee: Amount,
    ) -> Self {
        Self {
            amount,
            currency: currency.into(),
            destination_account: destination_account.into(),
            platform_fee,
            metadata: RawMetadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: RawMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// `amount: None` refunds everything captured and not yet refunded.
#[derive(Debug, Clone)]
pub struct RefundParams {
    pub authorization_id: String,
    pub amount: Option<Amount>,
    pub reason: Option<RefundReason>,
}

impl RefundParams {
    pub fn full(authorization_id: impl Into<String>) -> Self {
        Self {
            authorization_id: authorization_id.into(),
            amount: None,
            reason: None,
        }
    }

    pub fn partial(authorization_id: impl Into<String>, amount: Amount) -> Self {
        Self {
            amount: Some(amount),
            ..Self::full(authorization_id)
        }
    }

    pub fn reason(mut self, reason: RefundReason) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// A request as received from an upstream handler.
#[derive(Debug, Clone)]
pub enum Request {
    CreateAccount {
        actor: ActorId,
        params: AccountParams,
    },
    CreateAuthorization {
        actor: ActorId,
        params: AuthorizationParams,
    },
    Capture {
        actor: ActorId,
        authorization_id: String,
    },
    Cancel {
        actor: ActorId,
        authorization_id: String,
        reason: Option<CancelReason>,
    },
    Refund {
        actor: ActorId,
        params: RefundParams,
    },
}

impl Request {
    pub fn operation(&self) -> Operation {
        match self {
            Request::CreateAccount { .. } => Operation::CreateAccount,
            Request::CreateAuthorization { .. } => Operation::CreateAuthorization,
            Request::Capture { .. } => Operation::Capture,
            Request::Cancel { .. } => Operation::Cancel,
            Request::Refund { .. } => Operation::Refund,
        }
    }

    pub fn actor(&self) -> &str {
        match self {
            Request::CreateAccount { actor, .. }
            | Request::CreateAuthorization { actor, .. }
            | Request::Capture { actor, .. }
            | Request::Cancel { actor, .. }
            | Request::Refund { actor, .. } => actor,
        }
    }
}

/// One request handled by [`EscrowCoordinator::run`].
#[derive(Debug)]
pub struct Handled {
    pub operation: Operation,
    pub actor: ActorId,
    pub result: Result<Executed<Outcome>, EscrowError>,
}

/// What the processor call of one operation runs with.
struct Attempt {
    key: IdempotencyKey,
    metadata: Metadata,
    /// The key was minted for this call, so no earlier attempt can have had
    /// an effect and local preconditions apply.
    fresh: bool,
    issued: Issued,
}

/// Set once the mutating processor call of an attempt has been sent.
#[derive(Debug, Clone, Default)]
struct Issued(Arc<AtomicBool>);

impl Issued {
    fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct EscrowCoordinator {
    processor: Arc<dyn PaymentProcessor>,
    store: Arc<dyn TransactionStore>,
    audit: AuditLog,
    locks: FingerprintLocks,
    sanitizer: MetadataSanitizer,
    retry: RetryPolicy,
    config: CoordinatorConfig,
}

/// Public API
impl EscrowCoordinator {
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        store: Arc<dyn TransactionStore>,
        audit: AuditLog,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            processor,
            store,
            audit,
            locks: FingerprintLocks::new(),
            sanitizer: MetadataSanitizer::new(config.metadata_value_limit),
            retry: config.retry_policy(),
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Create a connected account for a seller.
    pub async fn create_account(
        &self,
        actor: &str,
        params: AccountParams,
    ) -> Result<Executed<AccountOutcome>, EscrowError> {
        let email = validate::email(&params.email)?;
        let account_type = params.account_type;

        let mut context = self.sanitizer.sanitize(&params.metadata);
        context.insert("email".to_string(), email.clone());
        context.insert("account_type".to_string(), account_type.to_string());

        self.execute(Operation::CreateAccount, actor, context, |attempt| async move {
            let request = AccountRequest {
                email,
                account_type,
                metadata: attempt.metadata,
            };
            let key = attempt.key;
            let account = self
                .mutate(&attempt.issued, Operation::CreateAccount, || {
                    self.processor.create_account(&request, &key)
                })
                .await?;
            Ok(AccountOutcome {
                account_id: account.id,
            })
        })
        .await
    }

    /// Place a manual-capture hold routed to `destination_account` minus the platform fee.
    pub async fn create_authorization(
        &self,
        actor: &str,
        params: AuthorizationParams,
    ) -> Result<Executed<AuthorizationOutcome>, EscrowError> {
        validate::amounts(params.amount, params.platform_fee, self.config.max_amount)?;
        let currency = validate::currency(&params.currency)?;
        let destination = validate::required("destination_account", &params.destination_account)?;

        let mut context = self.sanitizer.sanitize(&params.metadata);
        context.insert("amount".to_string(), params.amount.minor().to_string());
        context.insert("currency".to_string(), currency.clone());
        context.insert("destination_account".to_string(), destination.clone());
        context.insert("platform_fee".to_string(), params.platform_fee.minor().to_string());

        self.execute(Operation::CreateAuthorization, actor, context, |attempt| async move {
            let request = AuthorizationRequest {
                amount: params.amount,
                currency,
                destination_account: destination,
                platform_fee: params.platform_fee,
                metadata: attempt.metadata,
            };
            let key = attempt.key;
            let auth = self
                .mutate(&attempt.issued, Operation::CreateAuthorization, || {
                    self.processor.create_authorization(&request, &key)
                })
                .await?;
            Ok(AuthorizationOutcome {
                authorization_id: auth.id,
                status: auth.status,
            })
        })
        .await
    }

    /// Capture held funds. The authorization must be in `requires_capture`.
    pub async fn capture_payment(
        &self,
        actor: &str,
        authorization_id: &str,
    ) -> Result<Executed<CaptureOutcome>, EscrowError> {
        let authorization_id = validate::required("authorization_id", authorization_id)?;
        let context = Metadata::from([("authorization_id".to_string(), authorization_id.clone())]);

        self.execute(Operation::Capture, actor, context, |attempt| async move {
            if attempt.fresh {
                let status = self
                    .authorization_status(Operation::Capture, &authorization_id)
                    .await?;
                if !status.is_capturable() {
                    return Err(ValidationError::NotCapturable {
                        authorization_id,
                        status,
                    }
                    .into());
                }
            }
            let request = CaptureRequest {
                authorization_id,
                metadata: attempt.metadata,
            };
            let key = attempt.key;
            let auth = self
                .mutate(&attempt.issued, Operation::Capture, || {
                    self.processor.capture(&request, &key)
                })
                .await?;
            Ok(CaptureOutcome {
                authorization_id: auth.id,
                captured_amount: auth.amount_captured,
            })
        })
        .await
    }

    /// Release a hold back to the payer. Only valid before capture.
    pub async fn cancel_payment(
        &self,
        actor: &str,
        authorization_id: &str,
        reason: Option<CancelReason>,
    ) -> Result<Executed<CancelOutcome>, EscrowError> {
        let authorization_id = validate::required("authorization_id", authorization_id)?;
        let mut context =
            Metadata::from([("authorization_id".to_string(), authorization_id.clone())]);
        if let Some(reason) = reason {
            context.insert("reason".to_string(), reason.to_string());
        }

        self.execute(Operation::Cancel, actor, context, |attempt| async move {
            if attempt.fresh {
                match self.authorization_status(Operation::Cancel, &authorization_id).await? {
                    AuthorizationStatus::Captured => {
                        return Err(ValidationError::AlreadyCaptured(authorization_id).into());
                    }
                    AuthorizationStatus::Canceled => {
                        return Err(ValidationError::AlreadyCanceled(authorization_id).into());
                    }
                    _ => {}
                }
            }
            let request = CancelRequest {
                authorization_id,
                reason,
                metadata: attempt.metadata,
            };
            let key = attempt.key;
            let auth = self
                .mutate(&attempt.issued, Operation::Cancel, || {
                    self.processor.cancel(&request, &key)
                })
                .await?;
            Ok(CancelOutcome {
                authorization_id: auth.id,
                status: auth.status,
            })
        })
        .await
    }

    /// Refund a captured authorization, in full or in part.
    pub async fn create_refund(
        &self,
        actor: &str,
        params: RefundParams,
    ) -> Result<Executed<RefundOutcome>, EscrowError> {
        let authorization_id = validate::required("authorization_id", &params.authorization_id)?;
        validate::refund_amount(params.amount)?;

        let mut context =
            Metadata::from([("authorization_id".to_string(), authorization_id.clone())]);
        if let Some(amount) = params.amount {
            context.insert("amount".to_string(), amount.minor().to_string());
        }
        if let Some(reason) = params.reason {
            context.insert("reason".to_string(), reason.to_string());
        }

        self.execute(Operation::Refund, actor, context, |attempt| async move {
            if attempt.fresh {
                let auth = self
                    .call(Operation::Refund, || {
                        self.processor.retrieve_authorization(&authorization_id)
                    })
                    .await?;
                if !auth.status.is_refundable() {
                    return Err(ValidationError::NotCaptured {
                        authorization_id,
                        status: auth.status,
                    }
                    .into());
                }
                let available = auth.refundable();
                let requested = params.amount.unwrap_or(available);
                if !requested.is_positive() || requested > available {
                    return Err(ValidationError::RefundExceedsCaptured {
                        requested,
                        available,
                    }
                    .into());
                }
            }
            let request = RefundRequest {
                authorization_id,
                amount: params.amount,
                reason: params.reason,
                metadata: attempt.metadata,
            };
            let key = attempt.key;
            let refund = self
                .mutate(&attempt.issued, Operation::Refund, || {
                    self.processor.refund(&request, &key)
                })
                .await?;
            Ok(RefundOutcome {
                refund_id: refund.id,
                refunded_amount: refund.amount,
            })
        })
        .await
    }

    /// Route a [`Request`] to its operation.
    pub async fn dispatch(&self, request: Request) -> Result<Executed<Outcome>, EscrowError> {
        match request {
            Request::CreateAccount { actor, params } => self
                .create_account(&actor, params)
                .await
                .map(|e| e.map(Outcome::from)),
            Request::CreateAuthorization { actor, params } => self
                .create_authorization(&actor, params)
                .await
                .map(|e| e.map(Outcome::from)),
            Request::Capture {
                actor,
                authorization_id,
            } => self
                .capture_payment(&actor, &authorization_id)
                .await
                .map(|e| e.map(Outcome::from)),
            Request::Cancel {
                actor,
                authorization_id,
                reason,
            } => self
                .cancel_payment(&actor, &authorization_id, reason)
                .await
                .map(|e| e.map(Outcome::from)),
            Request::Refund { actor, params } => self
                .create_refund(&actor, params)
                .await
                .map(|e| e.map(Outcome::from)),
        }
    }

    /// Handle a stream of requests in order. Failures are collected, not fatal.
    pub async fn run(&self, mut requests: impl Stream<Item = Request> + Unpin) -> Vec<Handled> {
        let mut handled = Vec::new();
        while let Some(request) = requests.next().await {
            let operation = request.operation();
            let actor = request.actor().to_string();
            let result = self.dispatch(request).await;
            handled.push(Handled {
                operation,
                actor,
                result,
            });
        }
        handled
    }

    /// Check a processor notification against the configured webhook secret.
    pub fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        let secret = &self.config.credentials.webhook_secret;
        webhook::verify_webhook_signature(payload, signature, secret)
    }
}

/// Private API
impl EscrowCoordinator {
    /// Run one logical operation under its fingerprint lock.
    async fn execute<T, F, Fut>(
        &self,
        operation: Operation,
        actor: &str,
        context: Metadata,
        body: F,
    ) -> Result<Executed<T>, EscrowError>
    where
        T: FromOutcome + Into<Outcome> + Clone,
        F: FnOnce(Attempt) -> Fut,
        Fut: Future<Output = Result<T, EscrowError>>,
    {
        let id = key::fingerprint(operation, actor, &context);
        let _guard = self.locks.lock(&id).await;

        let minted = key::generate(operation, actor, &context);
        let draft = NewTransaction {
            id: id.clone(),
            operation,
            actor_id: actor.to_string(),
            context,
            idempotency_key: minted.clone(),
        };
        let (state, is_new) = self.store.get_or_create(draft, Utc::now()).await?;

        match state.status {
            TransactionStatus::Completed => {
                let result = state
                    .outcome
                    .clone()
                    .and_then(T::from_outcome)
                    .ok_or_else(|| StoreError::OutcomeMismatch(id.clone()))?;
                info!(%operation, actor, fingerprint = %id, "answered from completed state");
                self.audit.record_state(AuditAction::Deduplicated, &state);
                return Ok(Executed { state, result });
            }
            TransactionStatus::Pending if is_new => {
                debug!(%operation, actor, fingerprint = %id, "started");
                self.audit.record_state(AuditAction::Started, &state);
            }
            TransactionStatus::Pending => {
                warn!(%operation, actor, fingerprint = %id, "resuming unresolved pending state");
                self.audit.record_state(AuditAction::Resumed, &state);
            }
            TransactionStatus::Failed => {
                return Err(StoreError::AlreadyTerminal {
                    id,
                    status: state.status,
                }
                .into());
            }
        }

        let issued = Issued::default();
        let attempt = Attempt {
            fresh: is_new && state.idempotency_key == minted,
            key: state.idempotency_key.clone(),
            metadata: processor_metadata(actor, &state.context),
            issued: issued.clone(),
        };

        match body(attempt).await {
            Ok(result) => {
                let state = self.store.complete(&id, result.clone().into(), Utc::now()).await?;
                info!(
                    %operation,
                    actor,
                    external_ref = ?state.external_ref(),
                    "completed"
                );
                self.audit.record_state(AuditAction::Completed, &state);
                Ok(Executed { state, result })
            }
            Err(err) => {
                let action = match &err {
                    EscrowError::Validation(_) => AuditAction::Rejected,
                    _ => AuditAction::Failed,
                };
                let failure = StateError {
                    effect_possible: issued.is_set(),
                    ..StateError::from(&err)
                };
                match self.store.fail(&id, failure, Utc::now()).await {
                    Ok(state) => self.audit.record_state(action, &state),
                    Err(store_err) => {
                        error!(
                            %operation,
                            actor,
                            fingerprint = %id,
                            reason = %store_err,
                            "could not record failure"
                        );
                    }
                }
                info!(%operation, actor, category = %err.category(), reason = %err, "skipped");
                Err(err)
            }
        }
    }

    /// One processor call under the call timeout, with retries.
    async fn call<T, F, Fut>(&self, operation: Operation, mut f: F) -> Result<T, ProcessorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProcessorError>>,
    {
        let timeout = self.config.call_timeout;
        self.retry
            .run(operation.as_str(), |attempt| {
                debug!(%operation, attempt, "calling processor");
                let call = f();
                async move {
                    tokio::time::timeout(timeout, call)
                        .await
                        .unwrap_or_else(|_| Err(ProcessorError::timeout(timeout)))
                }
            })
            .await
    }

    /// Like [`call`](Self::call), for a call that changes processor state.
    async fn mutate<T, F, Fut>(
        &self,
        issued: &Issued,
        operation: Operation,
        f: F,
    ) -> Result<T, ProcessorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProcessorError>>,
    {
        issued.mark();
        self.call(operation, f).await
    }

    async fn authorization_status(
        &self,
        operation: Operation,
        authorization_id: &str,
    ) -> Result<AuthorizationStatus, ProcessorError> {
        let auth = self
            .call(operation, || self.processor.retrieve_authorization(authorization_id))
            .await?;
        Ok(auth.status)
    }
}

/// Metadata sent to the processor: the request context plus who asked.
fn processor_metadata(actor: &str, context: &Metadata) -> Metadata {
    let mut metadata = context.clone();
    metadata.insert("actor_id".to_string(), actor.to_string());
    metadata
}

impl std::fmt::Debug for EscrowCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowCoordinator")
            .field("audit", &self.audit)
            .field("retry", &self.retry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
