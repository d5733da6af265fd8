use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use coordinator::{Command, Coordinator};
use host::{
    bridge::{HostBrowser, PendingReplies, DEFAULT_CALL_TIMEOUT},
    frames::OutboundFrame,
    run_writer, NativeHost,
};
use scheduler::{Scheduler, SchedulerConfig};
use storage::document_store::{DocumentStore, JsonDocumentStore};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::utils::clock::{Clock, DefaultClock};

pub mod alerts;
pub mod args;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod policy;
pub mod protocol;
pub mod scheduler;
pub mod settings;
pub mod shutdown;
pub mod storage;
pub mod tracking;
pub mod usage;

/// Requests and events queued for the coordinator. Triggers are dropped rather than queued
/// once it is full.
const COMMAND_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 256;

/// Represents the starting point for the host. Speaks native messaging over stdin and stdout
/// until the browser closes the port or the process is interrupted.
pub async fn start_daemon(dir: PathBuf) -> Result<()> {
    let store = JsonDocumentStore::new(dir.join("data")).context("Failed to open data dir")?;
    let shutdown_token = CancellationToken::new();

    serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        store,
        Arc::new(DefaultClock),
        shutdown_token,
    )
    .await
}

/// Wires every module together over the given streams and runs them to completion.
async fn serve<S: DocumentStore>(
    input: impl AsyncRead + Unpin + Send,
    output: impl AsyncWrite + Unpin,
    store: S,
    clock: Arc<dyn Clock>,
    shutdown_token: CancellationToken,
) -> Result<()> {
    let (command_sender, command_receiver) = mpsc::channel::<Command>(COMMAND_CAPACITY);
    let (outbound_sender, outbound_receiver) = mpsc::channel::<OutboundFrame>(OUTBOUND_CAPACITY);
    let pending = Arc::new(PendingReplies::new());

    let browser = HostBrowser::new(outbound_sender.clone(), pending.clone(), DEFAULT_CALL_TIMEOUT);
    let coordinator = Coordinator::load(
        command_receiver,
        command_sender.downgrade(),
        store,
        Box::new(browser),
        clock.clone(),
        shutdown_token.clone(),
    )
    .await?;

    let scheduler = Scheduler::new(
        command_sender.clone(),
        SchedulerConfig::with_backup_time(coordinator.settings().backup_time),
        clock,
        shutdown_token.clone(),
    );
    let host = NativeHost::new(
        input,
        command_sender,
        outbound_sender,
        pending,
        shutdown_token.clone(),
    );

    info!("Host started");
    let (_, host_result, coordinator_result, scheduler_result, writer_result) = tokio::join!(
        shutdown::detect_shutdown(shutdown_token),
        host.run(),
        coordinator.run(),
        scheduler.run(),
        run_writer(outbound_receiver, output),
    );

    if let Err(e) = host_result {
        error!("Host reader got an error {:?}", e);
    }

    if let Err(e) = scheduler_result {
        error!("Scheduler got an error {:?}", e);
    }

    if let Err(e) = writer_result {
        error!("Host writer got an error {:?}", e);
    }

    coordinator_result
}
