// src/db/mod.rs
//! Optional SQLite persistence of stream offsets.

pub mod connection;
pub mod offsets;

pub use offsets::{DbError, OffsetStore, run_checkpoints};
