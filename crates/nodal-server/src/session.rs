//! One WebSocket connection: login, then a request loop that keeps serving
//! frames while runs are in flight.
//!
//! A single writer task owns the socket sink. The read loop, every run task
//! and the login reply all write through its channel, so frames from
//! different producers never interleave mid-message.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use libnodal::{EngineError, ExecutionWorker, OutputSink, RunGuard, User, Value, convert};
use nodal_protocol::{
    ClientMessage, GetVariableRequest, RunNodeRequest, ServerFrame, ServerMessage,
};

use crate::server::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Cloneable handle to the connection's writer task.
#[derive(Clone)]
struct Outbound {
    tx: mpsc::Sender<Message>,
}

impl Outbound {
    /// Queues `frame`; `false` once the writer is gone.
    async fn send(&self, frame: impl Into<ServerFrame>) -> bool {
        let text = match serde_json::to_string(&frame.into()) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode server frame");
                return true;
            }
        };
        self.tx.send(Message::text(text)).await.is_ok()
    }

    async fn error(&self, message: impl Into<String>) -> bool {
        self.send(ServerFrame::error(message)).await
    }

    async fn close(&self) {
        let _ = self.tx.send(Message::Close(None)).await;
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });
    let out = Outbound { tx };

    match await_login(&mut ws_receiver, state.settings.login_timeout).await {
        Some(identifier) => {
            let user = state.registry.get_or_create(&identifier);
            info!(user = %identifier, "session authenticated");
            if out
                .send(ServerMessage::login_success(state.settings.client))
                .await
            {
                serve_requests(&mut ws_receiver, &user, &state, &out).await;
            }
            debug!(user = %identifier, "session closed");
        }
        None => {
            debug!("login missing or invalid; closing");
            out.close().await;
        }
    }

    // Run tasks hold their own handle and finish writing on their own.
    drop(out);
    let _ = write_task.await;
}

/// Waits for the opening `login` frame. Control frames are skipped.
async fn await_login(
    receiver: &mut SplitStream<WebSocket>,
    timeout: Duration,
) -> Option<String> {
    let first_text = async {
        while let Some(msg) = receiver.next().await {
            match msg.ok()? {
                Message::Text(text) => return Some(text),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
        None
    };
    let text = tokio::time::timeout(timeout, first_text).await.ok()??;
    match serde_json::from_str::<ClientMessage>(text.as_str()) {
        Ok(ClientMessage::Login { identifier }) if !identifier.is_empty() => Some(identifier),
        _ => None,
    }
}

async fn serve_requests(
    receiver: &mut SplitStream<WebSocket>,
    user: &Arc<User>,
    state: &Arc<AppState>,
    out: &Outbound,
) {
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!("ws read error: {e}");
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let alive = match parse_client_message(text.as_str()) {
            Err(e) => out.error(e.to_string()).await,
            Ok(None) => true,
            Ok(Some(ClientMessage::Ping)) => out.send(ServerMessage::Pong).await,
            Ok(Some(ClientMessage::Login { .. })) => {
                debug!(user = %user.id(), "ignoring repeated login");
                true
            }
            Ok(Some(ClientMessage::RunNode(request))) => {
                start_run(user, request, state, out).await
            }
            Ok(Some(ClientMessage::GetVariable(request))) => {
                get_variable(user, request, out).await
            }
        };
        if !alive {
            warn!(user = %user.id(), "writer gone; closing session");
            break;
        }
    }
}

/// Parses a steady-state frame.
///
/// `Ok(None)` means a well-formed frame with an action this server does not
/// handle; such frames are ignored.
pub fn parse_client_message(text: &str) -> Result<Option<ClientMessage>, EngineError> {
    let raw: serde_json::Value =
        serde_json::from_str(text).map_err(|_| EngineError::MissingAction)?;
    let action = raw
        .get("action")
        .and_then(|a| a.as_str())
        .ok_or(EngineError::MissingAction)?;

    let context = match action {
        "login" => "login",
        "ping" => "ping",
        "run_node" => "run_code",
        "get_variable" => "get_variable",
        other => {
            debug!(action = %other, "ignoring unknown action");
            return Ok(None);
        }
    };
    serde_json::from_value(raw)
        .map(Some)
        .map_err(|_| EngineError::MissingArguments(context))
}

async fn start_run(
    user: &Arc<User>,
    request: RunNodeRequest,
    state: &Arc<AppState>,
    out: &Outbound,
) -> bool {
    let guard = match user.try_begin_run(&request.node) {
        Ok(guard) => guard,
        Err(e) => {
            debug!(user = %user.id(), node = %request.node, error = %e, "run rejected");
            return out.error(e.to_string()).await;
        }
    };
    if !out.send(ServerMessage::running(request.node.as_str())).await {
        return false;
    }

    tokio::spawn(run_task(
        guard,
        request,
        state.worker.clone(),
        state.settings.batch_interval,
        out.clone(),
    ));
    true
}

/// Drives one admitted run to completion, streaming its output in batches.
///
/// Keeps going when the client disconnects so the context is still saved
/// and the guard still released.
async fn run_task(
    guard: RunGuard,
    request: RunNodeRequest,
    worker: ExecutionWorker,
    batch_interval: Duration,
    out: Outbound,
) {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    let sink = OutputSink::new(&request.node, line_tx);
    let user = Arc::clone(guard.user());

    let mut pending = String::new();
    let mut batch_tick = tokio::time::interval(batch_interval);
    batch_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let outcome = {
        let run = user.run_node(&request, &worker, sink);
        tokio::pin!(run);
        loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                Some(line) = line_rx.recv() => pending.push_str(&line.text),
                _ = batch_tick.tick() => flush_output(&out, &request.node, &mut pending).await,
            }
        }
    };
    while let Ok(line) = line_rx.try_recv() {
        pending.push_str(&line.text);
    }
    flush_output(&out, &request.node, &mut pending).await;

    // Release before reporting so a client reacting to the final frame can
    // start the next run immediately.
    drop(guard);

    out.send(ServerMessage::RunCode {
        status: outcome.status,
        node: request.node,
        output: Some(outcome.output),
        error: Some(outcome.error),
    })
    .await;
}

async fn flush_output(out: &Outbound, node: &str, pending: &mut String) {
    if pending.is_empty() {
        return;
    }
    let text = std::mem::take(pending);
    out.send(ServerMessage::Output {
        node: node.to_string(),
        text,
    })
    .await;
}

async fn get_variable(user: &Arc<User>, request: GetVariableRequest, out: &Outbound) -> bool {
    let GetVariableRequest { node, name } = request;
    let lookup = {
        let user = Arc::clone(user);
        let (node, name) = (node.clone(), name.clone());
        // Image and figure encoding is CPU-bound.
        tokio::task::spawn_blocking(move || {
            convert(&user.get_variable(&node, &name).unwrap_or(Value::Nil))
        })
        .await
    };

    let reply = match lookup {
        Ok(converted) => ServerMessage::GetVariable {
            node,
            name,
            value: Some(converted.value),
            kind: Some(converted.kind),
            error: None,
        },
        Err(e) => {
            warn!(
                user = %user.id(),
                node = %node,
                name = %name,
                error = %e,
                "variable conversion failed"
            );
            ServerMessage::GetVariable {
                node,
                name,
                value: None,
                kind: None,
                error: Some(e.to_string()),
            }
        }
    };
    out.send(reply).await
}
