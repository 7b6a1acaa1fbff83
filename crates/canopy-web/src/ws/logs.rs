//! Log streaming channel
//!
//! Spawns `compose logs -f` for a workspace (optionally one service)
//! and streams lines to the client, colour-coding each line by its
//! detected log level.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use crate::api::AppState;

/// Lines of history replayed on connect
const LOG_TAIL: &str = "200";

/// ANSI colours applied per detected level
const COLOR_RED: &str = "\x1b[31m";
const COLOR_YELLOW: &str = "\x1b[33m";
const COLOR_DIM: &str = "\x1b[2m";
const COLOR_RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Debug,
    Plain,
}

/// Cheap per-line level sniff.
pub fn detect_level(line: &str) -> LogLevel {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("fatal") || lower.contains("panic") {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warn
    } else if lower.contains("debug") || lower.contains("trace") {
        LogLevel::Debug
    } else {
        LogLevel::Plain
    }
}

/// Wrap a line in the colour for its level.
pub fn colorize_line(line: &str) -> String {
    match detect_level(line) {
        LogLevel::Error => format!("{COLOR_RED}{line}{COLOR_RESET}"),
        LogLevel::Warn => format!("{COLOR_YELLOW}{line}{COLOR_RESET}"),
        LogLevel::Debug => format!("{COLOR_DIM}{line}{COLOR_RESET}"),
        LogLevel::Plain => line.to_string(),
    }
}

/// Combined logs: every service of the workspace
pub async fn logs_ws_handler(
    ws: WebSocketUpgrade,
    Path(workspace): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_logs_socket(socket, workspace, None, state))
}

/// Logs filtered to one service
pub async fn service_logs_ws_handler(
    ws: WebSocketUpgrade,
    Path((workspace, service)): Path<(String, String)>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_logs_socket(socket, workspace, Some(service), state))
}

async fn handle_logs_socket(
    mut socket: WebSocket,
    workspace: String,
    service: Option<String>,
    state: AppState,
) {
    let listing = match state.ctx.engine.find(&workspace).await {
        Ok(listing) => listing,
        Err(e) => {
            let _ = socket.send(Message::Text(e.to_string().into())).await;
            return;
        }
    };

    let mut args = vec![
        "logs".to_string(),
        "-f".to_string(),
        "--tail".to_string(),
        LOG_TAIL.to_string(),
        "--no-log-prefix".to_string(),
    ];
    if let Some(service) = &service {
        args.push(service.clone());
    }
    let argv = state.ctx.runtime.compose(args);
    let Some((program, rest)) = argv.split_first() else {
        return;
    };

    let child = tokio::process::Command::new(program)
        .args(rest)
        .current_dir(&listing.path)
        .env(
            "COMPOSE_PROJECT_NAME",
            state.ctx.engine.project_name(&workspace),
        )
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            let _ = socket
                .send(Message::Text(format!("failed to start log stream: {e}").into()))
                .await;
            return;
        }
    };

    // Merge stdout and stderr line streams into one channel.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(line_tx);

    debug!(
        category = "gateway",
        workspace = %workspace,
        service = service.as_deref().unwrap_or("*"),
        "Log stream started"
    );

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                if socket
                    .send(Message::Text(colorize_line(&line).into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = child.kill().await;
    debug!(category = "gateway", workspace = %workspace, "Log stream closed");
}
