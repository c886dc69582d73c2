//! Everything that talks to the vendor: wire event model, API seams and the
//! concrete HTTP client.

pub mod api;
pub mod events;
pub mod falcon;

pub use api::{ApiError, DeviceDirectory, DeviceRecord, FeedBody, Partition, StreamingApi};
pub use events::{Event, EventError, FeedId};
pub use falcon::FalconClient;
