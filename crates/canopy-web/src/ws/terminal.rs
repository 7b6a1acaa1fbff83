//! Terminal channel: attaches a WebSocket to a PTY session
//!
//! Raw PTY output flows out as binary frames; control notifications
//! (`takeover`, `status`) as JSON text. Inbound frames are classified:
//! control envelopes act on the session, everything else is stdin.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use canopy_core::session::{
    classify, Agent, ClientTransport, ControlMessage, Inbound, ServerFrame,
};
use canopy_core::workspace::MAIN_WORKSPACE;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::AppState;

#[derive(Deserialize, Default)]
pub struct TerminalQuery {
    /// Agent to run; defaults to a plain shell
    #[serde(default)]
    pub command: Option<String>,
}

pub async fn terminal_ws_handler(
    ws: WebSocketUpgrade,
    Path(workspace): Path<String>,
    Query(query): Query<TerminalQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, workspace, query, state))
}

async fn handle_terminal_socket(
    mut socket: WebSocket,
    workspace: String,
    query: TerminalQuery,
    state: AppState,
) {
    let agent = query
        .command
        .as_deref()
        .and_then(Agent::parse)
        .unwrap_or(Agent::Shell);

    // Resolve the workspace to its checkout path.
    let cwd = if workspace == MAIN_WORKSPACE {
        state.ctx.config.repository_root.clone()
    } else {
        match state.ctx.engine.find(&workspace).await {
            Ok(listing) => listing.path,
            Err(e) => {
                let _ = socket
                    .send(Message::Text(
                        serde_json::json!({
                            "type": "error",
                            "message": e.to_string(),
                        })
                        .to_string()
                        .into(),
                    ))
                    .await;
                return;
            }
        }
    };

    let session = state.ctx.sessions.get_or_create(&workspace, agent, cwd);

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let transport = ClientTransport::new(frame_tx);
    let outcome = match session.attach(transport.clone()) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(
                category = "gateway",
                workspace = %workspace,
                error = %e,
                "Terminal attach failed"
            );
            let _ = socket
                .send(Message::Text(
                    serde_json::json!({
                        "type": "error",
                        "message": e.to_string(),
                    })
                    .to_string()
                    .into(),
                ))
                .await;
            return;
        }
    };

    debug!(
        category = "gateway",
        workspace = %workspace,
        session = session.id(),
        agent = %agent,
        "Terminal attached"
    );

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                let len = frame.len();
                let message = match &frame {
                    ServerFrame::Data(bytes) => Message::Binary(bytes.clone().into()),
                    other => match other.to_control_json() {
                        Some(json) => Message::Text(json.into()),
                        None => continue,
                    },
                };
                let sent = socket.send(message).await;
                // The bytes reached (or died with) the socket either way;
                // account for them so backpressure can observe the drain.
                transport.mark_written(len);
                if sent.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                let Some(Ok(message)) = inbound else { break };
                let bytes: Vec<u8> = match message {
                    Message::Text(text) => text.as_bytes().to_vec(),
                    Message::Binary(data) => data.to_vec(),
                    Message::Close(_) => break,
                    _ => continue,
                };
                handle_inbound(&session, &bytes);
            }
        }
    }

    session.detach(outcome.generation);
    debug!(
        category = "gateway",
        workspace = %workspace,
        session = session.id(),
        "Terminal transport closed"
    );
}

fn handle_inbound(session: &canopy_core::session::PtySession, bytes: &[u8]) {
    match classify(bytes) {
        Inbound::Control(ControlMessage::Resize { cols, rows }) => {
            if let Err(e) = session.resize(cols, rows) {
                debug!(category = "gateway", error = %e, "Resize failed");
            }
        }
        Inbound::Control(ControlMessage::Pause) => session.set_client_pause(true),
        Inbound::Control(ControlMessage::Resume) => session.set_client_pause(false),
        Inbound::UnknownControl => {
            debug!(category = "gateway", "Dropping unknown control message");
        }
        Inbound::Data => {
            if let Err(e) = session.write_input(bytes) {
                debug!(category = "gateway", error = %e, "PTY write failed");
            }
        }
    }
}
