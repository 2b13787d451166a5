//! IPC server implementation
//!
//! Listens on localhost TCP for requests from the terminal UI and the agent.
//! Each client gets one line-framed connection carrying responses, pushed
//! hub events and the shell events of the channels it subscribed to.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use tl_core::CoreError;
use tl_protocol::{
    ChannelId, CoreEvent, ProtocolError, Request, RequestEnvelope, Response, ResponseEnvelope,
    ServerMessage, ShellEvent,
};
use tl_session::SessionHub;

use crate::handler::{error_response, handle_request};

/// Longest request line accepted from a client
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Messages queued per client before senders wait on the socket
const OUTBOUND_QUEUE: usize = 1024;

/// IPC server for front-end communication
///
/// Listens on localhost (127.0.0.1) only - not accessible from network.
pub struct IpcServer {
    /// Address to bind (127.0.0.1:port)
    pub address: String,
    hub: Arc<SessionHub>,
    shutdown_token: CancellationToken,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(address: String, hub: Arc<SessionHub>) -> Self {
        Self {
            address,
            hub,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Set the shutdown token (call before run)
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = token;
        self
    }

    /// Token that stops the server; a `shutdown` request cancels it too
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind IPC server to {}", self.address))?;

        tracing::info!("IPC server listening on {}", self.address);
        self.serve(listener).await
    }

    /// Serve clients from an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("IPC server stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        // Only accept connections from localhost
                        if !peer_addr.ip().is_loopback() {
                            tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                            continue;
                        }
                        tracing::debug!("IPC client connected from {}", peer_addr);

                        let hub = Arc::clone(&self.hub);
                        let shutdown = self.shutdown_token.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, hub, shutdown).await {
                                tracing::warn!("IPC client error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept IPC connection: {}", e);
                    }
                },
            }
        }
        Ok(())
    }
}

/// State for a single IPC client connection
struct ClientState {
    /// Shell channels this client receives events for
    subscriptions: HashMap<ChannelId, CancellationToken>,
    out: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
}

impl ClientState {
    fn new(out: mpsc::Sender<ServerMessage>, closed: CancellationToken) -> Self {
        Self {
            subscriptions: HashMap::new(),
            out,
            closed,
        }
    }

    async fn respond(&self, id: u64, response: Response) -> bool {
        self.out
            .send(ResponseEnvelope { id, response }.into())
            .await
            .is_ok()
    }

    /// Start forwarding a channel's shell events to this client
    async fn subscribe(&mut self, hub: &SessionHub, id: u64, channel_id: ChannelId) -> bool {
        if let Some(existing) = self.subscriptions.get(&channel_id) {
            if !existing.is_cancelled() {
                return self.respond(id, Response::Ok).await;
            }
        }

        let mut events = match hub.subscribe(&channel_id) {
            Ok(events) => events,
            Err(e) => return self.respond(id, error_response(e)).await,
        };
        let stop = self.closed.child_token();
        self.subscriptions.insert(channel_id.clone(), stop.clone());

        // The response goes out before any of the channel's events.
        if !self.respond(id, Response::Ok).await {
            return false;
        }

        let out = self.out.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let last = matches!(event, ShellEvent::Close { .. });
                if out.send(CoreEvent::Shell(event).into()).await.is_err() || last {
                    break;
                }
            }
            stop.cancel();
            tracing::trace!("Stopped forwarding {}", channel_id);
        });
        true
    }

    async fn unsubscribe(&mut self, id: u64, channel_id: &ChannelId) -> bool {
        if let Some(stop) = self.subscriptions.remove(channel_id) {
            stop.cancel();
        }
        self.respond(id, Response::Ok).await
    }
}

async fn handle_client(
    stream: TcpStream,
    hub: Arc<SessionHub>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut sink = FramedWrite::new(writer, LinesCodec::new());
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);
    let closed = shutdown.child_token();

    // The writer outlives the read loop until every in-flight request has
    // answered, so a `shutdown` still gets its response.
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let line = match message.to_line() {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("Failed to encode IPC message: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                tracing::debug!("IPC client went away: {}", e);
                break;
            }
        }
    });

    tokio::spawn(forward_events(hub.events(), out_tx.clone(), closed.clone()));

    let mut client = ClientState::new(out_tx.clone(), closed.clone());
    loop {
        let line = tokio::select! {
            _ = closed.cancelled() => break,
            next = lines.next() => match next {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    closed.cancel();
                    return Err(e).context("Failed to read IPC request");
                }
                None => break, // EOF
            },
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let RequestEnvelope { id, request } = match serde_json::from_str::<RequestEnvelope>(trimmed) {
            Ok(envelope) => envelope,
            Err(e) => {
                let error = CoreError::from(ProtocolError::from(e));
                if !client.respond(request_id(trimmed), error_response(error)).await {
                    break;
                }
                continue;
            }
        };
        tracing::trace!("IPC request {}", id);

        let alive = match request {
            Request::Subscribe { channel_id } => client.subscribe(&hub, id, channel_id).await,
            Request::Unsubscribe { channel_id } => client.unsubscribe(id, &channel_id).await,
            request => {
                // Requests run concurrently: a connect waiting on a challenge
                // must not hold up the challenge response on the same client.
                let hub = Arc::clone(&hub);
                let out = out_tx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let response = handle_request(&hub, request, &shutdown).await;
                    let _ = out.send(ResponseEnvelope { id, response }.into()).await;
                });
                true
            }
        };
        if !alive {
            break;
        }
    }

    closed.cancel();
    tracing::debug!("IPC client disconnected");
    Ok(())
}

/// Push every hub event to the client until it goes away
async fn forward_events(
    mut events: broadcast::Receiver<CoreEvent>,
    out: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = closed.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => {
                if out.send(event.into()).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("IPC client lagged by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Best-effort id of a request that failed to parse
fn request_id(line: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|value| value.get("id").and_then(|id| id.as_u64()))
        .unwrap_or(0)
}
