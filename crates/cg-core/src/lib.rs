//! Shared building blocks for the crogia control plane.
//!
//! - `config`: TOML configuration with `CROGIA_*` environment overrides
//! - `types`: sessions, conversation turns, process records
//! - `session_store`: the durable session index (`active_sessions.json`)
//! - `process_registry`: per-workspace background process records
//! - `shutdown`: cooperative shutdown coordination

pub mod config;
pub mod process_registry;
pub mod session_store;
pub mod shutdown;
pub mod types;
