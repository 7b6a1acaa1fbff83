//! Terminal channel message types
//!
//! Client frames are inspected cheaply for a control envelope (a small
//! JSON object whose first field is `type`); everything else is raw
//! terminal input. Unknown control types are dropped, never forwarded
//! as input.

use serde::{Deserialize, Serialize};

/// Prefix that marks a candidate control envelope
const CONTROL_PREFIX: &[u8] = b"{\"type\"";

/// In-band control messages from the client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Resize { cols: u16, rows: u16 },
    Pause,
    Resume,
}

/// Classification of one inbound client frame
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A recognized control message
    Control(ControlMessage),
    /// Control-shaped but not a recognized type: dropped
    UnknownControl,
    /// Raw bytes destined for the PTY stdin
    Data,
}

/// Inspect a client frame without copying it.
pub fn classify(bytes: &[u8]) -> Inbound {
    if !bytes.starts_with(CONTROL_PREFIX) {
        return Inbound::Data;
    }
    match serde_json::from_slice::<ControlMessage>(bytes) {
        Ok(message) => Inbound::Control(message),
        Err(_) => Inbound::UnknownControl,
    }
}

/// Frames the session sends to its attached client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Raw PTY output
    Data(Vec<u8>),
    /// Another client attached; this transport is detached
    Takeover,
    /// Flow-control state change
    Status { paused: bool, reason: String },
}

impl ServerFrame {
    /// Approximate transport size, used for outbound-buffer accounting.
    pub fn len(&self) -> usize {
        match self {
            Self::Data(bytes) => bytes.len(),
            Self::Takeover | Self::Status { .. } => 64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// JSON rendering for non-data frames.
    pub fn to_control_json(&self) -> Option<String> {
        #[derive(Serialize)]
        #[serde(tag = "type", rename_all = "lowercase")]
        enum Wire<'a> {
            Takeover,
            Status { paused: bool, reason: &'a str },
        }
        let wire = match self {
            Self::Data(_) => return None,
            Self::Takeover => Wire::Takeover,
            Self::Status { paused, reason } => Wire::Status {
                paused: *paused,
                reason,
            },
        };
        serde_json::to_string(&wire).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_resize() {
        let inbound = classify(br#"{"type":"resize","cols":120,"rows":40}"#);
        assert_eq!(
            inbound,
            Inbound::Control(ControlMessage::Resize {
                cols: 120,
                rows: 40
            })
        );
    }

    #[test]
    fn test_classify_pause_resume() {
        assert_eq!(
            classify(br#"{"type":"pause"}"#),
            Inbound::Control(ControlMessage::Pause)
        );
        assert_eq!(
            classify(br#"{"type":"resume"}"#),
            Inbound::Control(ControlMessage::Resume)
        );
    }

    #[test]
    fn test_unknown_control_is_dropped_not_forwarded() {
        assert_eq!(
            classify(br#"{"type":"reboot-the-host"}"#),
            Inbound::UnknownControl
        );
    }

    #[test]
    fn test_raw_input_passes_through() {
        assert_eq!(classify(b"ls -la\r"), Inbound::Data);
        assert_eq!(classify(b"\x1b[A"), Inbound::Data);
        // JSON-ish input that is not a control envelope is still input.
        assert_eq!(classify(br#"{"data": "x"}"#), Inbound::Data);
    }

    #[test]
    fn test_control_shaped_but_malformed_is_dropped() {
        assert_eq!(classify(br#"{"type":"resize","cols":"#), Inbound::UnknownControl);
    }

    #[test]
    fn test_takeover_serialization() {
        let json = ServerFrame::Takeover.to_control_json().unwrap();
        assert_eq!(json, r#"{"type":"takeover"}"#);
    }

    #[test]
    fn test_status_serialization() {
        let json = ServerFrame::Status {
            paused: true,
            reason: "backpressure".to_string(),
        }
        .to_control_json()
        .unwrap();
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""paused":true"#));
    }

    #[test]
    fn test_data_frame_has_no_control_json() {
        assert!(ServerFrame::Data(b"x".to_vec()).to_control_json().is_none());
    }

    #[test]
    fn test_frame_len_accounting() {
        assert_eq!(ServerFrame::Data(vec![0u8; 100]).len(), 100);
        assert!(!ServerFrame::Takeover.is_empty());
    }
}
