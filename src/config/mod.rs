//! Public API for configuration

pub mod loader;
pub mod model;

// Re-export the main entrypoints:
pub use loader::{DEFAULT_CONFIG_PATH, load};
pub use model::{Backend, Config, ConfigError};
