//! HTTP and WebSocket surface of the crogia control plane.
//!
//! Key modules:
//! - [`http_api`]: axum REST API over sessions, processes and shells
//! - [`terminal_ws`]: the bridge between one PTY shell and one WebSocket
//! - [`events_ws`]: per-session task event stream
//! - [`reconnect`]: client-side reconnection policy driven by close codes
//! - [`event_bus`]: pub/sub fan-out of task events

pub mod api_error;
pub mod event_bus;
pub mod events_ws;
pub mod http_api;
pub mod protocol;
pub mod reconnect;
pub mod terminal_ws;
