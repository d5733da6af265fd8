//! The native messaging side of the daemon. [NativeHost] reads frames from the browser and
//! routes them, [run_writer] is the only task touching the output stream.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bridge::PendingReplies;
use codec::{read_frame_bytes, write_frame};
use frames::{InboundFrame, OutboundFrame};

use super::{
    coordinator::Command,
    protocol::{Outcome, Request, Response},
};

pub mod bridge;
pub mod codec;
pub mod frames;

pub struct NativeHost<R> {
    reader: R,
    commands: mpsc::Sender<Command>,
    outbound: mpsc::Sender<OutboundFrame>,
    pending: Arc<PendingReplies>,
    shutdown: CancellationToken,
}

impl<R: AsyncRead + Unpin + Send> NativeHost<R> {
    pub fn new(
        reader: R,
        commands: mpsc::Sender<Command>,
        outbound: mpsc::Sender<OutboundFrame>,
        pending: Arc<PendingReplies>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reader,
            commands,
            outbound,
            pending,
            shutdown,
        }
    }

    /// Reads until the browser closes the port, which also shuts the daemon down.
    pub async fn run(mut self) -> Result<()> {
        info!("Listening for browser messages");
        loop {
            let frame = select! {
                _ = self.shutdown.cancelled() => {
                    return Ok(())
                }
                frame = read_frame_bytes(&mut self.reader) => frame
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Browser closed the connection");
                    self.shutdown.cancel();
                    return Ok(());
                }
                Err(e) => {
                    self.shutdown.cancel();
                    return Err(e).context("Failed to read from browser");
                }
            };

            // The body was consumed, so a frame that does not decode only costs itself.
            let frame = match serde_json::from_slice::<InboundFrame>(&frame) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Ignoring malformed message {e}");
                    continue;
                }
            };

            if !self.route(frame).await {
                debug!("Coordinator stopped, ending reader");
                return Ok(());
            }
        }
    }

    /// Returns false once the coordinator is gone.
    async fn route(&self, frame: InboundFrame) -> bool {
        match frame {
            InboundFrame::Event { event } => {
                self.commands.send(Command::Browser(event)).await.is_ok()
            }
            InboundFrame::Request {
                request_id,
                request,
            } => {
                let request = match serde_json::from_value::<Request>(request) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("Rejecting malformed request {request_id}: {e}");
                        let frame = OutboundFrame::Response {
                            request_id,
                            response: Response::Outcome(Outcome::failed(format!(
                                "Invalid request: {e}"
                            ))),
                        };
                        if self.outbound.send(frame).await.is_err() {
                            debug!("Writer gone, dropping response to {request_id}");
                        }
                        return true;
                    }
                };

                let (respond, response) = oneshot::channel();
                if self
                    .commands
                    .send(Command::Request { request, respond })
                    .await
                    .is_err()
                {
                    return false;
                }
                // Awaited off the read loop: the coordinator may need a REPLY frame before it can
                // answer.
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    match response.await {
                        Ok(response) => {
                            let frame = OutboundFrame::Response {
                                request_id,
                                response,
                            };
                            if outbound.send(frame).await.is_err() {
                                debug!("Writer gone, dropping response to {request_id}");
                            }
                        }
                        Err(_) => debug!("Request {request_id} dropped without a response"),
                    }
                });
                true
            }
            InboundFrame::Reply {
                reply_to,
                result,
                error,
            } => {
                let reply = match error {
                    Some(error) => Err(error),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                if !self.pending.resolve(reply_to, reply) {
                    debug!("Reply {reply_to} arrived after its call was abandoned");
                }
                true
            }
        }
    }
}

/// Writes outbound frames until every sender is gone.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    mut receiver: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
) -> Result<()> {
    while let Some(frame) = receiver.recv().await {
        write_frame(&mut writer, &frame)
            .await
            .context("Failed to write to browser")?;
    }
    debug!("Writer finished");
    Ok(())
}
