//! canopy-web: HTTP and WebSocket gateway
//!
//! The thin edge between browsers and the canopy engine: REST routes
//! for workspace lifecycle, a control channel broadcasting engine
//! events in batches, terminal attachment, and log streaming.

pub mod api;
pub mod server;
pub mod ws;

pub use api::AppState;
pub use server::{build_router, serve, ServerConfig};
