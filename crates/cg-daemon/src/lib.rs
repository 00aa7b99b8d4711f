//! crogia daemon: wires configuration, the container runtime, the session
//! manager and the HTTP/WebSocket API into one long-running process.

pub mod daemon;
pub mod environment;
