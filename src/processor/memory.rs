//! In-process payment processor.
//!
//! Behaves like a manual-capture card processor: authorizations are confirmed
//! straight into `requires_capture`, capture takes the full authorized amount,
//! and refunds draw down the captured amount. Replies are remembered per
//! idempotency key. Faults can be queued per call to exercise retry paths.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{
    Account, AccountRequest, Authorization, AuthorizationRequest, CancelRequest, CaptureRequest,
    PaymentProcessor, ProcessorError, Refund, RefundRequest,
};
use crate::Amount;
use crate::key::IdempotencyKey;
use crate::model::AuthorizationStatus;

/// Processor entry points, for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorCall {
    CreateAccount,
    CreateAuthorization,
    RetrieveAuthorization,
    Capture,
    Cancel,
    Refund,
}

#[derive(Debug, Clone)]
struct Fault {
    error: ProcessorError,
    /// Apply the effect, then report the error (lost response).
    after_effect: bool,
}

#[derive(Debug, Clone)]
enum Reply {
    Account(Account),
    Authorization(Authorization),
    Refund(Refund),
}

#[derive(Debug, Default)]
struct Ledger {
    counters: HashMap<&'static str, u64>,
    accounts: HashMap<String, Account>,
    authorizations: HashMap<String, Authorization>,
    refunds: HashMap<String, Refund>,
    replies: HashMap<IdempotencyKey, (ProcessorCall, Reply)>,
    calls: HashMap<ProcessorCall, usize>,
    effects: HashMap<ProcessorCall, usize>,
    faults: HashMap<ProcessorCall, VecDeque<Fault>>,
}

impl Ledger {
    fn next_id(&mut self, prefix: &'static str) -> String {
        let counter = self.counters.entry(prefix).or_default();
        *counter += 1;
        format!("{prefix}_{counter}")
    }

    fn authorization(&self, id: &str) -> Result<Authorization, ProcessorError> {
        self.authorizations.get(id).cloned().ok_or_else(|| {
            ProcessorError::invalid_request(
                "resource_missing",
                format!("no such authorization: {id}"),
            )
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryProcessor {
    ledger: Mutex<Ledger>,
    latency: Option<Duration>,
}

impl MemoryProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `call` with `error` before it has any effect.
    pub fn fail_next(&self, call: ProcessorCall, error: ProcessorError) {
        self.push_fault(call, error, false);
    }

    /// Apply the next `call`, then report `error` as if the response was lost.
    pub fn fail_after_effect(&self, call: ProcessorCall, error: ProcessorError) {
        self.push_fault(call, error, true);
    }

    /// Physical calls received, including failed ones.
    pub fn calls(&self, call: ProcessorCall) -> usize {
        self.ledger().calls.get(&call).copied().unwrap_or(0)
    }

    /// Calls that actually changed processor state.
    pub fn effects(&self, call: ProcessorCall) -> usize {
        self.ledger().effects.get(&call).copied().unwrap_or(0)
    }

    pub fn authorization(&self, id: &str) -> Option<Authorization> {
        self.ledger().authorizations.get(id).cloned()
    }

    /// Force an authorization into `status`, as customer actions would.
    pub fn set_status(&self, id: &str, status: AuthorizationStatus) -> bool {
        match self.ledger().authorizations.get_mut(id) {
            Some(auth) => {
                auth.status = status;
                true
            }
            None => false,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_fault(&self, call: ProcessorCall, error: ProcessorError, after_effect: bool) {
        self.ledger()
            .faults
            .entry(call)
            .or_default()
            .push_back(Fault { error, after_effect });
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Common call path: count, replay by key, inject faults, apply.
    fn handle(
        &self,
        call: ProcessorCall,
        key: Option<&IdempotencyKey>,
        apply: impl FnOnce(&mut Ledger) -> Result<Reply, ProcessorError>,
    ) -> Result<Reply, ProcessorError> {
        let mut ledger = self.ledger();
        *ledger.calls.entry(call).or_default() += 1;

        let fault = match ledger.faults.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(fault) if !fault.after_effect => return Err(fault.error),
            other => other,
        };

        if let Some(key) = key {
            if let Some((original, reply)) = ledger.replies.get(key) {
                if *original != call {
                    return Err(ProcessorError::invalid_request(
                        "idempotency_key_in_use",
                        format!("key {key} was used for {original:?}"),
                    ));
                }
                debug!(%key, ?call, "replaying idempotent reply");
                let reply = reply.clone();
                return match fault {
                    Some(fault) => Err(fault.error),
                    None => Ok(reply),
                };
            }
        }

        let reply = apply(&mut ledger)?;
        *ledger.effects.entry(call).or_default() += 1;
        if let Some(key) = key {
            ledger.replies.insert(key.clone(), (call, reply.clone()));
        }

        match fault {
            Some(fault) => Err(fault.error),
            None => Ok(reply),
        }
    }
}

fn unexpected(call: ProcessorCall) -> ProcessorError {
    ProcessorError::permanent("unexpected_reply", format!("mismatched reply for {call:?}"))
}

#[async_trait]
impl PaymentProcessor for MemoryProcessor {
    async fn create_account(
        &self,
        request: &AccountRequest,
        key: &IdempotencyKey,
    ) -> Result<Account, ProcessorError> {
        self.delay().await;
        let reply = self.handle(ProcessorCall::CreateAccount, Some(key), |ledger| {
            let account = Account {
                id: ledger.next_id("acct"),
                email: request.email.clone(),
                account_type: request.account_type,
            };
            ledger.accounts.insert(account.id.clone(), account.clone());
            Ok(Reply::Account(account))
        })?;
        match reply {
            Reply::Account(account) => Ok(account),
            _ => Err(unexpected(ProcessorCall::CreateAccount)),
        }
    }

    async fn create_authorization(
        &self,
        request: &AuthorizationRequest,
        key: &IdempotencyKey,
    ) -> Result<Authorization, ProcessorError> {
        self.delay().await;
        let reply = self.handle(ProcessorCall::CreateAuthorization, Some(key), |ledger| {
            if !request.amount.is_positive() {
                return Err(ProcessorError::invalid_request(
                    "amount_too_small",
                    "amount must be positive",
                ));
            }
            if request.platform_fee > request.amount {
                return Err(ProcessorError::invalid_request(
                    "application_fee_too_large",
                    "fee exceeds amount",
                ));
            }
            let auth = Authorization {
                id: ledger.next_id("pi"),
                amount: request.amount,
                currency: request.currency.clone(),
                destination_account: request.destination_account.clone(),
                platform_fee: request.platform_fee,
                status: AuthorizationStatus::RequiresCapture,
                amount_captured: Amount::ZERO,
                amount_refunded: Amount::ZERO,
            };
            ledger.authorizations.insert(auth.id.clone(), auth.clone());
            Ok(Reply::Authorization(auth))
        })?;
        match reply {
            Reply::Authorization(auth) => Ok(auth),
            _ => Err(unexpected(ProcessorCall::CreateAuthorization)),
        }
    }

    async fn retrieve_authorization(
        &self,
        authorization_id: &str,
    ) -> Result<Authorization, ProcessorError> {
        self.delay().await;
        let reply = self.handle(ProcessorCall::RetrieveAuthorization, None, |ledger| {
            ledger.authorization(authorization_id).map(Reply::Authorization)
        })?;
        match reply {
            Reply::Authorization(auth) => Ok(auth),
            _ => Err(unexpected(ProcessorCall::RetrieveAuthorization)),
        }
    }

    async fn capture(
        &self,
        request: &CaptureRequest,
        key: &IdempotencyKey,
    ) -> Result<Authorization, ProcessorError> {
        self.delay().await;
        let reply = self.handle(ProcessorCall::Capture, Some(key), |ledger| {
            let mut auth = ledger.authorization(&request.authorization_id)?;
            if auth.status != AuthorizationStatus::RequiresCapture {
                return Err(ProcessorError::invalid_request(
                    "payment_intent_unexpected_state",
                    format!("authorization is {}", auth.status),
                ));
            }
            auth.status = AuthorizationStatus::Captured;
            auth.amount_captured = auth.amount;
            ledger.authorizations.insert(auth.id.clone(), auth.clone());
            Ok(Reply::Authorization(auth))
        })?;
        match reply {
            Reply::Authorization(auth) => Ok(auth),
            _ => Err(unexpected(ProcessorCall::Capture)),
        }
    }

    async fn cancel(
        &self,
        request: &CancelRequest,
        key: &IdempotencyKey,
    ) -> Result<Authorization, ProcessorError> {
        self.delay().await;
        let reply = self.handle(ProcessorCall::Cancel, Some(key), |ledger| {
            let mut auth = ledger.authorization(&request.authorization_id)?;
            if !auth.status.is_cancelable() {
                return Err(ProcessorError::invalid_request(
                    "payment_intent_unexpected_state",
                    format!("authorization is {}", auth.status),
                ));
            }
            auth.status = AuthorizationStatus::Canceled;
            ledger.authorizations.insert(auth.id.clone(), auth.clone());
            Ok(Reply::Authorization(auth))
        })?;
        match reply {
            Reply::Authorization(auth) => Ok(auth),
            _ => Err(unexpected(ProcessorCall::Cancel)),
        }
    }

    async fn refund(
        &self,
        request: &RefundRequest,
        key: &IdempotencyKey,
    ) -> Result<Refund, ProcessorError> {
        self.delay().await;
        let reply = self.handle(ProcessorCall::Refund, Some(key), |ledger| {
            let mut auth = ledger.authorization(&request.authorization_id)?;
            if auth.status != AuthorizationStatus::Captured {
                return Err(ProcessorError::invalid_request(
                    "charge_not_captured",
                    format!("authorization is {}", auth.status),
                ));
            }
            let remaining = auth.refundable();
            let amount = request.amount.unwrap_or(remaining);
            if !amount.is_positive() || amount > remaining {
                return Err(ProcessorError::invalid_request(
                    "amount_too_large",
                    format!("refund {amount} exceeds refundable {remaining}"),
                ));
            }
            auth.amount_refunded += amount;
            let refund = Refund {
                id: ledger.next_id("re"),
                authorization_id: auth.id.clone(),
                amount,
                reason: request.reason,
            };
            ledger.authorizations.insert(auth.id.clone(), auth);
            ledger.refunds.insert(refund.id.clone(), refund.clone());
            Ok(Reply::Refund(refund))
        })?;
        match reply {
            Reply::Refund(refund) => Ok(refund),
            _ => Err(unexpected(ProcessorCall::Refund)),
        }
    }
}
