use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::Instant;

use escrow_coord::audit::{AuditAction, AuditLog, JsonlAuditSink, MemoryAuditSink};
use escrow_coord::coordinator::ValidationError;
use escrow_coord::key;
use escrow_coord::model::{AuthorizationStatus, Metadata};
use escrow_coord::processor::{
    CaptureRequest, MemoryProcessor, PaymentProcessor, ProcessorCall, ProcessorError,
};
use escrow_coord::state::NewTransaction;
use escrow_coord::store::{FileStore, MemoryStore, TransactionStore};
use escrow_coord::webhook::sign_payload;
use escrow_coord::{
    Amount, AuthorizationParams, CoordinatorConfig, ErrorCategory, EscrowCoordinator, EscrowError,
    Operation, RefundParams, TransactionStatus, verify_webhook_signature,
};

fn coordinator(
    processor: Arc<MemoryProcessor>,
    store: Arc<dyn TransactionStore>,
    audit: AuditLog,
) -> EscrowCoordinator {
    EscrowCoordinator::new(processor, store, audit, CoordinatorConfig::default())
}

fn hold(amount: i64, destination: &str) -> AuthorizationParams {
    AuthorizationParams::new(
        Amount::from_minor(amount),
        "usd",
        destination,
        Amount::from_minor(250),
    )
}

#[tokio::test]
async fn authorization_scenario_is_idempotent() {
    let processor = Arc::new(MemoryProcessor::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let coordinator = coordinator(
        processor.clone(),
        Arc::new(MemoryStore::new()),
        AuditLog::new().with_sink(audit.clone()),
    );

    let first = coordinator
        .create_authorization("user_1", hold(9_999, "acct_123"))
        .await
        .unwrap();
    let second = coordinator
        .create_authorization("user_1", hold(9_999, "acct_123"))
        .await
        .unwrap();

    assert_eq!(first.result.authorization_id, second.result.authorization_id);
    assert_eq!(first.result.status, AuthorizationStatus::RequiresCapture);
    assert_eq!(second.state.status, TransactionStatus::Completed);
    assert_eq!(processor.calls(ProcessorCall::CreateAuthorization), 1);

    let auth = processor.authorization(&first.result.authorization_id).unwrap();
    assert_eq!(auth.amount, Amount::from_minor(9_999));
    assert_eq!(auth.platform_fee, Amount::from_minor(250));
    assert_eq!(auth.destination_account, "acct_123");

    let records = audit.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.operation == Operation::CreateAuthorization));
    assert_eq!(records[1].external_ref.as_deref(), Some("pi_1"));
    assert_eq!(records[2].action, AuditAction::Deduplicated);
}

#[tokio::test]
async fn distinct_requests_never_share_state() {
    let processor = Arc::new(MemoryProcessor::new());
    let coordinator = coordinator(processor.clone(), Arc::new(MemoryStore::new()), AuditLog::new());

    let by_alice = coordinator
        .create_authorization("alice", hold(9_999, "acct_123"))
        .await
        .unwrap();
    let by_bob = coordinator
        .create_authorization("bob", hold(9_999, "acct_123"))
        .await
        .unwrap();
    let other_amount = coordinator
        .create_authorization("alice", hold(10_000, "acct_123"))
        .await
        .unwrap();

    assert_ne!(by_alice.state.id, by_bob.state.id);
    assert_ne!(by_alice.state.id, other_amount.state.id);
    assert_ne!(by_alice.state.idempotency_key, by_bob.state.idempotency_key);
    assert_eq!(processor.effects(ProcessorCall::CreateAuthorization), 3);
}

#[tokio::test]
async fn refund_is_bounded_by_captured_amount() {
    let processor = Arc::new(MemoryProcessor::new());
    let coordinator = coordinator(processor.clone(), Arc::new(MemoryStore::new()), AuditLog::new());

    let auth = coordinator
        .create_authorization("buyer", hold(10_000, "acct_1"))
        .await
        .unwrap();
    let id = auth.result.authorization_id;
    coordinator.capture_payment("buyer", &id).await.unwrap();

    let err = coordinator
        .create_refund("buyer", RefundParams::partial(&id, Amount::from_minor(15_000)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EscrowError::Validation(ValidationError::RefundExceedsCaptured { requested, available })
            if requested == Amount::from_minor(15_000) && available == Amount::from_minor(10_000)
    ));
    assert_eq!(err.http_status(), 400);
    assert_eq!(processor.calls(ProcessorCall::Refund), 0);

    // a rejected refund does not block a valid one for the same authorization
    let refund = coordinator
        .create_refund("buyer", RefundParams::partial(&id, Amount::from_minor(10_000)))
        .await
        .unwrap();
    assert_eq!(refund.result.refunded_amount, Amount::from_minor(10_000));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_exponentially() {
    let processor = Arc::new(MemoryProcessor::new());
    let coordinator = coordinator(processor.clone(), Arc::new(MemoryStore::new()), AuditLog::new());
    for _ in 0..3 {
        processor.fail_next(
            ProcessorCall::CreateAuthorization,
            ProcessorError::from_http(503, "api_error", "service unavailable"),
        );
    }

    let start = Instant::now();
    let err = coordinator
        .create_authorization("buyer", hold(500, "acct_1"))
        .await
        .unwrap_err();

    // 1s before the second attempt, 2s before the third
    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(err.category(), ErrorCategory::Transient);
    assert_eq!(err.http_status(), 503);
    assert_eq!(processor.calls(ProcessorCall::CreateAuthorization), 3);
}

#[tokio::test(start_paused = true)]
async fn client_errors_are_not_retried() {
    let processor = Arc::new(MemoryProcessor::new());
    let coordinator = coordinator(processor.clone(), Arc::new(MemoryStore::new()), AuditLog::new());
    processor.fail_next(
        ProcessorCall::CreateAuthorization,
        ProcessorError::from_http(400, "parameter_invalid", "retry will not help"),
    );

    let start = Instant::now();
    let err = coordinator
        .create_authorization("buyer", hold(500, "acct_1"))
        .await
        .unwrap_err();

    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(err.category(), ErrorCategory::Permanent);
    assert_eq!(processor.calls(ProcessorCall::CreateAuthorization), 1);
}

#[tokio::test]
async fn restart_resumes_orphaned_pending_state_from_file() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("states.json");
    let audit_path = dir.path().join("audit.jsonl");
    let processor = Arc::new(MemoryProcessor::new());

    let authorization_id = {
        let store = Arc::new(FileStore::open(&store_path).unwrap());
        let first_run = coordinator(processor.clone(), store.clone(), AuditLog::new());
        let auth = first_run
            .create_authorization("buyer", hold(4_200, "acct_1"))
            .await
            .unwrap();
        let id = auth.result.authorization_id;

        // the first run records a pending capture, captures, then dies
        let context = Metadata::from([("authorization_id".to_string(), id.clone())]);
        let draft = NewTransaction {
            id: key::fingerprint(Operation::Capture, "buyer", &context),
            operation: Operation::Capture,
            actor_id: "buyer".to_string(),
            idempotency_key: key::generate(Operation::Capture, "buyer", &context),
            context,
        };
        let (pending, _) = store.get_or_create(draft, Utc::now()).await.unwrap();
        let request = CaptureRequest {
            authorization_id: id.clone(),
            metadata: Metadata::new(),
        };
        processor.capture(&request, &pending.idempotency_key).await.unwrap();
        id
    };

    let store = Arc::new(FileStore::open(&store_path).unwrap());
    let audit = AuditLog::new().with_sink(Arc::new(JsonlAuditSink::open(&audit_path).unwrap()));
    let second_run = coordinator(processor.clone(), store, audit);

    let again = second_run
        .create_authorization("buyer", hold(4_200, "acct_1"))
        .await
        .unwrap();
    assert_eq!(again.result.authorization_id, authorization_id);

    let captured = second_run.capture_payment("buyer", &authorization_id).await.unwrap();
    assert_eq!(captured.result.captured_amount, Amount::from_minor(4_200));
    assert_eq!(processor.effects(ProcessorCall::Capture), 1);
    assert_eq!(processor.effects(ProcessorCall::CreateAuthorization), 1);

    let log = std::fs::read_to_string(&audit_path).unwrap();
    let actions: Vec<String> = log
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["action"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(actions, vec!["deduplicated", "resumed", "completed"]);
}

#[tokio::test]
async fn stale_pending_state_stops_blocking_after_sweep() {
    let store = Arc::new(MemoryStore::new());
    let processor = Arc::new(MemoryProcessor::new());
    let coordinator = coordinator(processor.clone(), store.clone(), AuditLog::new());

    let auth = coordinator
        .create_authorization("buyer", hold(700, "acct_1"))
        .await
        .unwrap();
    let authorization_id = auth.result.authorization_id;

    // a capture that was recorded pending and never resolved
    let context = Metadata::from([("authorization_id".to_string(), authorization_id.clone())]);
    let draft = NewTransaction {
        id: key::fingerprint(Operation::Capture, "buyer", &context),
        operation: Operation::Capture,
        actor_id: "buyer".to_string(),
        idempotency_key: key::generate(Operation::Capture, "buyer", &context),
        context,
    };
    let id = draft.id.clone();
    let stale_key = draft.idempotency_key.clone();
    store
        .get_or_create(draft, Utc::now() - chrono::Duration::hours(25))
        .await
        .unwrap();

    assert_eq!(coordinator.sweep().await.unwrap(), 1);
    assert!(store.get(&id).await.unwrap().is_none());

    let captured = coordinator.capture_payment("buyer", &authorization_id).await.unwrap();
    assert_eq!(captured.state.id, id);
    assert_ne!(captured.state.idempotency_key, stale_key);
    assert_eq!(captured.result.captured_amount, Amount::from_minor(700));
}

#[tokio::test]
async fn hold_capture_and_full_refund() {
    let processor = Arc::new(MemoryProcessor::new());
    let coordinator = coordinator(processor.clone(), Arc::new(MemoryStore::new()), AuditLog::new());

    let auth = coordinator
        .create_authorization("user_1", hold(9_999, "acct_123"))
        .await
        .unwrap();
    assert!(auth.result.authorization_id.starts_with("pi_"));
    assert_eq!(auth.result.status, AuthorizationStatus::RequiresCapture);

    let id = auth.result.authorization_id;
    let captured = coordinator.capture_payment("user_1", &id).await.unwrap();
    assert_eq!(captured.result.captured_amount.to_string(), "99.99");

    let refund = coordinator
        .create_refund("user_1", RefundParams::full(&id))
        .await
        .unwrap();
    assert_eq!(refund.result.refunded_amount.to_string(), "99.99");
    assert_eq!(processor.authorization(&id).unwrap().refundable(), Amount::ZERO);
}

#[test]
fn webhook_signatures_are_checked_at_the_crate_root() {
    let payload = br#"{"id":"evt_1","type":"payment_intent.amount_capturable_updated"}"#;
    let ts = Utc::now().timestamp();
    let header = format!("t={ts},v1={}", sign_payload("whsec_live", ts, payload));

    assert!(verify_webhook_signature(payload, &header, "whsec_live"));
    assert!(!verify_webhook_signature(payload, &header, "whsec_other"));
    assert!(!verify_webhook_signature(payload, "t=1,v1=deadbeef", "whsec_live"));
}

#[tokio::test(start_paused = true)]
async fn unreachable_status_lookup_never_waives_capture_preconditions() {
    let processor = Arc::new(MemoryProcessor::new());
    let coordinator = coordinator(processor.clone(), Arc::new(MemoryStore::new()), AuditLog::new());

    let auth = coordinator
        .create_authorization("buyer", hold(1_000, "acct_1"))
        .await
        .unwrap();
    let id = auth.result.authorization_id;
    processor.set_status(&id, AuthorizationStatus::RequiresConfirmation);
    for _ in 0..3 {
        processor.fail_next(
            ProcessorCall::RetrieveAuthorization,
            ProcessorError::from_http(503, "api_error", "service unavailable"),
        );
    }

    let first = coordinator.capture_payment("buyer", &id).await.unwrap_err();
    assert_eq!(first.category(), ErrorCategory::Transient);

    let second = coordinator.capture_payment("buyer", &id).await.unwrap_err();
    assert_eq!(second.category(), ErrorCategory::Validation);
    assert_eq!(second.http_status(), 400);
    assert_eq!(processor.calls(ProcessorCall::Capture), 0);
}
