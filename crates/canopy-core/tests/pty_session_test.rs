//! End-to-end PTY session scenarios: attach, takeover, capture/replay.

use std::time::Duration;

use canopy_core::session::{
    Agent, ClientTransport, ScreenState, ServerFrame, SessionManager, SessionManagerConfig,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn manager(tmp: &TempDir) -> std::sync::Arc<SessionManager> {
    let mut config = SessionManagerConfig::new(tmp.path());
    config.capture_interval = Duration::from_millis(100);
    SessionManager::new(config)
}

/// Drain frames until one matches, with an overall deadline.
async fn wait_for_frame<F>(
    rx: &mut mpsc::UnboundedReceiver<ServerFrame>,
    mut predicate: F,
) -> Option<ServerFrame>
where
    F: FnMut(&ServerFrame) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let frame = rx.recv().await?;
            if predicate(&frame) {
                return Some(frame);
            }
        }
    })
    .await
    .ok()
    .flatten()
}

fn frame_text(frame: &ServerFrame) -> String {
    match frame {
        ServerFrame::Data(bytes) => String::from_utf8_lossy(bytes).to_string(),
        _ => String::new(),
    }
}

#[tokio::test]
async fn test_attach_receives_output_and_survives_detach() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(&tmp);
    let session = mgr.get_or_create("main", Agent::Shell, std::env::temp_dir());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = session.attach(ClientTransport::new(tx)).unwrap();
    assert!(outcome.spawned);

    session.write_input(b"printf 'MARKER_ONE\\n'\r").unwrap();
    let frame = wait_for_frame(&mut rx, |f| frame_text(f).contains("MARKER_ONE")).await;
    assert!(frame.is_some(), "expected MARKER_ONE in PTY output");

    // Disconnect: the session survives and is reattachable by id.
    session.detach(outcome.generation);
    let snap = session.snapshot();
    assert!(!snap.attached);
    assert!(snap.pid.is_some());

    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let outcome2 = session.attach(ClientTransport::new(tx2)).unwrap();
    assert!(!outcome2.spawned, "reattach must reuse the PTY");

    session.write_input(b"printf 'MARKER_TWO\\n'\r").unwrap();
    let frame = wait_for_frame(&mut rx2, |f| frame_text(f).contains("MARKER_TWO")).await;
    assert!(frame.is_some(), "expected MARKER_TWO after reattach");

    mgr.destroy(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_takeover_notifies_prior_client_and_reroutes_output() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(&tmp);
    let session = mgr.get_or_create("main", Agent::Shell, std::env::temp_dir());

    // Client A attaches and sees output.
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    session.attach(ClientTransport::new(tx_a)).unwrap();
    session.write_input(b"printf 'LINE_ONE\\n'\r").unwrap();
    assert!(
        wait_for_frame(&mut rx_a, |f| frame_text(f).contains("LINE_ONE"))
            .await
            .is_some()
    );

    // Client B attaches: A gets exactly one takeover notification.
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    session.attach(ClientTransport::new(tx_b)).unwrap();
    let takeover = wait_for_frame(&mut rx_a, |f| matches!(f, ServerFrame::Takeover)).await;
    assert!(takeover.is_some(), "client A must be notified of takeover");

    // Subsequent output goes to B, not A.
    session.write_input(b"printf 'LINE_TWO\\n'\r").unwrap();
    assert!(
        wait_for_frame(&mut rx_b, |f| frame_text(f).contains("LINE_TWO"))
            .await
            .is_some()
    );

    // A's channel carries nothing after the takeover frame.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(frame) = rx_a.try_recv() {
        assert!(
            !matches!(frame, ServerFrame::Data(_)),
            "client A must not receive output after takeover"
        );
    }

    mgr.destroy(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_capture_serialize_replay_reproduces_screen() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(&tmp);
    let session = mgr.get_or_create("main", Agent::Shell, std::env::temp_dir());

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.attach(ClientTransport::new(tx)).unwrap();

    // Write far more lines than the 30-row viewport holds, so the
    // early ones only survive through scrollback.
    session
        .write_input(b"for i in $(seq 1 60); do echo SCROLL_LINE_$i; done\r")
        .unwrap();
    assert!(
        wait_for_frame(&mut rx, |f| frame_text(f).contains("SCROLL_LINE_60"))
            .await
            .is_some()
    );

    // Give the forward loop a beat to mirror into the emulator.
    tokio::time::sleep(Duration::from_millis(200)).await;

    mgr.capture_all().await;
    let persisted = mgr.recover(session.id()).await.expect("state on disk");
    assert_eq!(persisted.session_id, session.id());

    let restored = ScreenState::restore(
        &persisted.serialized,
        persisted.dimensions.rows,
        persisted.dimensions.cols,
    );
    assert!(
        restored.contents().contains("SCROLL_LINE_60"),
        "replayed viewport must show the latest output"
    );
    let full = restored.full_contents();
    for i in [1, 15, 30, 45, 60] {
        assert!(
            full.contains(&format!("SCROLL_LINE_{i}")),
            "line {i} written before capture must survive replay"
        );
    }

    mgr.destroy(session.id()).await.unwrap();
    assert!(mgr.recover(session.id()).await.is_none());
}

#[tokio::test]
async fn test_resize_control_path() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(&tmp);
    let session = mgr.get_or_create("main", Agent::Shell, std::env::temp_dir());

    let (tx, _rx) = mpsc::unbounded_channel();
    session.attach(ClientTransport::new(tx)).unwrap();
    session.resize(100, 40).unwrap();

    let state = session.capture(0);
    assert_eq!(state.dimensions.cols, 100);
    assert_eq!(state.dimensions.rows, 40);

    mgr.destroy(session.id()).await.unwrap();
}
