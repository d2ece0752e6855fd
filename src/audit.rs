//! Append-only audit trail of financial state transitions.
//!
//! Recording is best-effort: a failing sink is reported through `tracing` and
//! never interrupts the operation being audited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{ActorId, Metadata, Operation};
use crate::state::TransactionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A new pending state was created and the processor call issued.
    Started,
    /// A pending state left behind by an earlier run is being retried.
    Resumed,
    /// A repeated request was answered from a completed state.
    Deduplicated,
    Completed,
    Failed,
    /// A state precondition rejected the request before any effect.
    Rejected,
    /// The sweeper dropped an expired state.
    Swept,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action: AuditAction,
    pub operation: Operation,
    pub actor_id: ActorId,
    pub fingerprint: String,
    pub external_ref: Option<String>,
    pub metadata: Metadata,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn for_state(action: AuditAction, state: &TransactionState) -> Self {
        Self {
            action,
            operation: state.operation,
            actor_id: state.actor_id.clone(),
            fingerprint: state.id.to_string(),
            external_ref: state.external_ref().map(str::to_string),
            metadata: state.context.clone(),
            error: state.error.as_ref().map(ToString::to_string),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Emits each record as one JSON line on the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let json = serde_json::to_string(record)?;
        info!(target: "audit", "{json}");
        Ok(())
    }
}

/// Appends JSON lines to a file.
#[derive(Debug)]
pub struct JsonlAuditSink {
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonlAuditSink {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

/// Keeps records in memory, for tests and inspection.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.lock().clone()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.lock().iter().map(|r| r.action).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AuditRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AuditSink for MemoryAuditSink {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.lock().push(record.clone());
        Ok(())
    }
}

/// Fans records out to every configured sink.
#[derive(Clone, Default)]
pub struct AuditLog {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn record(&self, record: AuditRecord) {
        for sink in &self.sinks {
            if let Err(e) = sink.write(&record) {
                warn!(
                    action = ?record.action,
                    operation = %record.operation,
                    fingerprint = %record.fingerprint,
                    reason = %e,
                    "audit sink failed"
                );
            }
        }
    }

    pub fn record_state(&self, action: AuditAction, state: &TransactionState) {
        self.record(AuditRecord::for_state(action, state));
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
