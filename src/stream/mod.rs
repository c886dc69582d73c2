//! Stream consumption: partition supervision, lease refresh and ingestion.

pub mod ingest;
pub mod manager;
pub mod refresher;
pub mod session;

pub use ingest::{IngestFilter, Rejection, StreamIngestWorker};
pub use manager::{DiscoveryPolicy, ManagerError, SessionManager};
pub use refresher::SessionRefresher;
pub use session::StreamingSession;
