//! Memoizing sensor → device lookup.
//!
//! Each distinct sensor id costs at most one successful directory call for
//! the life of the process. Concurrent misses for the same id wait on the
//! same in-flight lookup instead of issuing their own. Failed lookups are not
//! remembered, so the next event from that sensor asks again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::comms::api::{ApiError, DeviceDirectory, DeviceRecord};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("cannot process event for device {0}: device not known")]
    Unknown(String),

    #[error("cannot process event for device {sensor_id}: {count} devices match")]
    Ambiguous { sensor_id: String, count: usize },

    #[error("device lookup failed: {0}")]
    Api(#[from] ApiError),
}

type Slot = Arc<OnceCell<Arc<DeviceRecord>>>;

pub struct DeviceCache {
    directory: Arc<dyn DeviceDirectory>,
    entries: Mutex<HashMap<String, Slot>>,
}

impl DeviceCache {
    pub fn new(directory: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            directory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Device record for `sensor_id`, looked up on first use.
    pub async fn device_details(&self, sensor_id: &str) -> Result<Arc<DeviceRecord>, DeviceError> {
        let slot = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(sensor_id.to_owned()).or_default())
        };
        slot.get_or_try_init(|| self.lookup(sensor_id))
            .await
            .map(Arc::clone)
    }

    /// Number of sensors with a cached record.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn lookup(&self, sensor_id: &str) -> Result<Arc<DeviceRecord>, DeviceError> {
        let mut records = self.directory.device_details(sensor_id).await?;
        match records.len() {
            1 => {
                let record = records.swap_remove(0);
                log::debug!(
                    "cached device {} for sensor {sensor_id} (provider={:?})",
                    record.hostname.as_deref().unwrap_or("?"),
                    record.service_provider
                );
                Ok(Arc::new(record))
            }
            0 => Err(DeviceError::Unknown(sensor_id.to_owned())),
            count => Err(DeviceError::Ambiguous {
                sensor_id: sensor_id.to_owned(),
                count,
            }),
        }
    }
}
