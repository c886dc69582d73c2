//! Device enrichment for dispatched events.

pub mod cache;
pub mod device;

pub use cache::{DeviceCache, DeviceError};
pub use device::{CloudProvider, EnrichedEvent};
