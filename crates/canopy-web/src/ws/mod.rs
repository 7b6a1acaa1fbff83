//! WebSocket surface
//!
//! Three channel kinds: the control channel broadcasting workspace
//! events in batches, per-session terminal attachment, and container
//! log streaming.

pub mod control;
pub mod logs;
pub mod terminal;

pub use control::control_ws_handler;
pub use logs::{logs_ws_handler, service_logs_ws_handler};
pub use terminal::terminal_ws_handler;
