//! Queue consumers that enrich events and hand them to the sinks.

pub mod worker;

pub use worker::{DispatchError, Dispatcher, spawn_dispatch_pool};
