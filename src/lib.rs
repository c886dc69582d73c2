// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Public library entry point.  Re-export everything for both `main.rs` and
// integration tests.

pub mod comms;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod enrich;
pub mod gateway;
pub mod queue;
pub mod sinks;
pub mod stream;
pub mod telemetry;

pub use gateway::Gateway;
