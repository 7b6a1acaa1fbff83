//! Control channel: engine events out to every connected client
//!
//! Events are coalesced per a small window and framed as a single
//! batch. A per-workspace token bucket caps broadcast volume, and a
//! debouncer collapses rapid duplicate progress events keyed by
//! `(workspace, step)`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use canopy_core::workspace::WorkspaceEvent;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::api::AppState;

/// Coalescing window for outbound event batches
const BATCH_WINDOW_MS: u64 = 100;

/// Maximum events per workspace per second
const EVENTS_PER_SECOND: f64 = 30.0;

pub async fn control_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_control_socket(socket, state))
}

async fn handle_control_socket(mut socket: WebSocket, state: AppState) {
    let mut events = state.ctx.engine.subscribe();
    let mut limiter = WorkspaceRateLimiter::new(EVENTS_PER_SECOND);
    let mut pending: Vec<WorkspaceEvent> = Vec::new();
    let mut flush = tokio::time::interval(Duration::from_millis(BATCH_WINDOW_MS));
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if limiter.allow(event.workspace(), Instant::now()) {
                            pending.push(event);
                        } else {
                            debug!(
                                category = "gateway",
                                workspace = event.workspace(),
                                "Rate-limited broadcast event"
                            );
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(category = "gateway", skipped = n, "Control subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = flush.tick() => {
                if pending.is_empty() {
                    continue;
                }
                let frame = render_flush(std::mem::take(&mut pending));
                if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
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
}

/// Debounce then frame a window's worth of events.
///
/// Intra-batch order is preserved; duplicate progress events for the
/// same `(workspace, step)` collapse to the latest one. One survivor is
/// sent unwrapped, several go out in a batch envelope.
pub fn render_flush(events: Vec<WorkspaceEvent>) -> serde_json::Value {
    let events = debounce(events);
    if events.len() == 1 {
        return events[0].frame();
    }
    serde_json::json!({
        "type": "batch",
        "messages": events.iter().map(|e| e.frame()).collect::<Vec<_>>(),
    })
}

/// Collapse rapid duplicate progress events keyed by `(workspace, step)`,
/// keeping the latest message in its original slot.
pub fn debounce(events: Vec<WorkspaceEvent>) -> Vec<WorkspaceEvent> {
    let mut kept: Vec<Option<WorkspaceEvent>> = Vec::with_capacity(events.len());
    let mut last_slot: HashMap<(String, &'static str), usize> = HashMap::new();

    for event in events {
        match event.step() {
            Some(step) if matches!(event, WorkspaceEvent::Progress { .. }) => {
                let key = (event.workspace().to_string(), step.as_str());
                if let Some(&slot) = last_slot.get(&key) {
                    kept[slot] = Some(event);
                } else {
                    last_slot.insert(key, kept.len());
                    kept.push(Some(event));
                }
            }
            _ => kept.push(Some(event)),
        }
    }
    kept.into_iter().flatten().collect()
}

/// Token bucket per workspace.
pub struct WorkspaceRateLimiter {
    rate: f64,
    buckets: HashMap<String, (f64, Instant)>,
}

impl WorkspaceRateLimiter {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            buckets: HashMap::new(),
        }
    }

    /// Whether one more event for `workspace` fits the budget at `now`.
    pub fn allow(&mut self, workspace: &str, now: Instant) -> bool {
        let (tokens, last) = self
            .buckets
            .entry(workspace.to_string())
            .or_insert((self.rate, now));
        let refill = now.duration_since(*last).as_secs_f64() * self.rate;
        *tokens = (*tokens + refill).min(self.rate);
        *last = now;
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::workspace::Step;

    fn progress(name: &str, step: Step, message: &str) -> WorkspaceEvent {
        WorkspaceEvent::Progress {
            name: name.to_string(),
            step,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_debounce_collapses_duplicate_steps() {
        let events = vec![
            progress("w", Step::Containers, "starting 1/3"),
            progress("w", Step::Containers, "starting 2/3"),
            progress("w", Step::Containers, "starting 3/3"),
        ];
        let out = debounce(events);
        assert_eq!(out.len(), 1);
        let WorkspaceEvent::Progress { message, .. } = &out[0] else {
            panic!("expected progress");
        };
        assert_eq!(message, "starting 3/3");
    }

    #[test]
    fn test_debounce_keeps_distinct_keys() {
        let events = vec![
            progress("w", Step::Git, "a"),
            progress("w", Step::Ports, "b"),
            progress("other", Step::Git, "c"),
        ];
        assert_eq!(debounce(events).len(), 3);
    }

    #[test]
    fn test_debounce_preserves_order() {
        let events = vec![
            progress("w", Step::Git, "first"),
            WorkspaceEvent::Created {
                name: "w".to_string(),
            },
            progress("w", Step::Git, "second"),
        ];
        let out = debounce(events);
        assert_eq!(out.len(), 2);
        // The collapsed progress keeps its original (first) slot.
        assert!(matches!(out[0], WorkspaceEvent::Progress { .. }));
        let WorkspaceEvent::Progress { ref message, .. } = out[0] else {
            unreachable!()
        };
        assert_eq!(message, "second");
        assert!(matches!(out[1], WorkspaceEvent::Created { .. }));
    }

    #[test]
    fn test_debounce_leaves_non_progress_alone() {
        let events = vec![
            WorkspaceEvent::Error {
                name: "w".to_string(),
                step: Step::Containers,
                message: "x".to_string(),
            },
            WorkspaceEvent::Error {
                name: "w".to_string(),
                step: Step::Containers,
                message: "y".to_string(),
            },
        ];
        // Errors are never collapsed.
        assert_eq!(debounce(events).len(), 2);
    }

    #[test]
    fn test_render_single_event_unwrapped() {
        let frame = render_flush(vec![WorkspaceEvent::Created {
            name: "w".to_string(),
        }]);
        assert_eq!(frame["event"], "worktree:created");
        assert!(frame.get("type").is_none());
    }

    #[test]
    fn test_render_batch_envelope() {
        let frame = render_flush(vec![
            WorkspaceEvent::Creating {
                name: "w".to_string(),
            },
            progress("w", Step::Git, "added"),
        ]);
        assert_eq!(frame["type"], "batch");
        let messages = frame["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["event"], "worktree:creating");
        assert_eq!(messages[1]["event"], "worktree:progress");
    }

    #[test]
    fn test_rate_limiter_caps_burst() {
        let mut limiter = WorkspaceRateLimiter::new(5.0);
        let now = Instant::now();
        let mut allowed = 0;
        for _ in 0..20 {
            if limiter.allow("w", now) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[test]
    fn test_rate_limiter_refills_over_time() {
        let mut limiter = WorkspaceRateLimiter::new(5.0);
        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.allow("w", start));
        }
        assert!(!limiter.allow("w", start));

        let later = start + Duration::from_secs(1);
        assert!(limiter.allow("w", later));
    }

    #[test]
    fn test_rate_limiter_is_per_workspace() {
        let mut limiter = WorkspaceRateLimiter::new(1.0);
        let now = Instant::now();
        assert!(limiter.allow("a", now));
        assert!(!limiter.allow("a", now));
        assert!(limiter.allow("b", now));
    }
}
