pub mod amount;
pub mod audit;
pub mod config;
pub mod coordinator;
pub mod csv;
pub mod key;
pub mod model;
pub mod processor;
pub mod retry;
pub mod sanitize;
pub mod state;
pub mod store;
pub mod webhook;

pub use amount::Amount;
pub use config::CoordinatorConfig;
pub use coordinator::{
    AccountParams, AuthorizationParams, ErrorCategory, EscrowCoordinator, EscrowError, Executed,
    RefundParams, Request,
};
pub use model::{ActorId, Metadata, Operation, Outcome, TransactionStatus};
pub use state::TransactionState;
pub use webhook::verify_webhook_signature;
