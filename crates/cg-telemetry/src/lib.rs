//! Logging and request tracing for the crogia control plane.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   selected by `general.log_format`
//! - **Request IDs**: axum middleware that tags every request with an
//!   `X-Request-Id` and runs the handler inside a matching span

pub mod logging;
pub mod request_id;
