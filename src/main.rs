use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use escrow_coord::audit::{AuditLog, TracingAuditSink};
use escrow_coord::csv::{read_requests, write_results};
use escrow_coord::processor::MemoryProcessor;
use escrow_coord::store::MemoryStore;
use escrow_coord::{CoordinatorConfig, EscrowCoordinator};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(path) = env::args().nth(1) else {
        eprintln!("usage: escrow-coord <requests.csv>");
        return ExitCode::FAILURE;
    };

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let requests = match read_requests(path.clone()) {
        Ok(requests) => requests,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let coordinator = EscrowCoordinator::new(
        Arc::new(MemoryProcessor::new()),
        Arc::new(MemoryStore::new()),
        AuditLog::new().with_sink(Arc::new(TracingAuditSink)),
        CoordinatorConfig::from_env(),
    );
    let (req_sender, req_receiver) = tokio::sync::mpsc::channel(16);

    tokio::task::spawn_blocking(move || {
        for result in requests {
            match result {
                Ok(request) => {
                    if req_sender.blocking_send(request).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    let handled = coordinator.run(ReceiverStream::new(req_receiver)).await;

    if let Err(e) = write_results(&handled) {
        error!("failed to write results: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
