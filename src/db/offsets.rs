// src/db/offsets.rs

//! Durable copy of the queue's offset table.
//!
//! The store is only ever written from one task; all SQLite work is
//! synchronous so no `&Connection` is held across an `.await`.

use chrono::Utc;
use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::{thread::sleep, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::connection::init_database;
use crate::comms::events::FeedId;
use crate::queue::OffsetTrackingQueue;

const MAX_LOCK_RETRIES: u64 = 5;

/// Stored offsets only move forward.
const UPSERT_SQL: &str = "
INSERT INTO feed_offsets (feed_id, last_offset, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(feed_id) DO UPDATE SET
    last_offset = excluded.last_offset,
    updated_at  = excluded.updated_at
WHERE excluded.last_offset > feed_offsets.last_offset
";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct OffsetStore {
    conn: Connection,
}

impl OffsetStore {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            conn: init_database(path)?,
        })
    }

    /// Every persisted `feed_id → offset`.
    pub fn load(&self) -> Result<HashMap<FeedId, u64>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT feed_id, last_offset FROM feed_offsets")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let offset: i64 = row.get(1)?;
            Ok((FeedId::new(id), u64::try_from(offset).unwrap_or(0)))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (id, offset) = row?;
            out.insert(id, offset);
        }
        Ok(out)
    }

    /// Upsert a snapshot in one transaction, retrying while the file is locked.
    pub fn save(&mut self, snapshot: &HashMap<FeedId, u64>) -> Result<(), DbError> {
        if snapshot.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let mut attempts = 0;
        loop {
            match self.write(snapshot, now) {
                Ok(()) => return Ok(()),
                Err(e) if e.to_string().contains("database is locked") && attempts < MAX_LOCK_RETRIES => {
                    attempts += 1;
                    sleep(Duration::from_millis(50 * attempts));
                }
                Err(e) => return Err(DbError::Sql(e)),
            }
        }
    }

    fn write(&mut self, snapshot: &HashMap<FeedId, u64>, now: i64) -> rusqlite::Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
            for (feed, offset) in snapshot {
                let offset = i64::try_from(*offset).unwrap_or(i64::MAX);
                stmt.execute(params![feed.as_str(), offset, now])?;
            }
        }
        tx.commit()
    }
}

/// Persist the queue's offset table every `every`, and once more when
/// `shutdown` fires.
pub async fn run_checkpoints(
    mut store: OffsetStore,
    queue: Arc<OffsetTrackingQueue>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    log::info!("Offset checkpoints every {}", humantime::format_duration(every));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = store.save(&queue.snapshot()) {
                    log::error!("Offset checkpoint failed: {e}");
                }
            }
        }
    }

    match store.save(&queue.snapshot()) {
        Ok(()) => log::info!("Final offset checkpoint written"),
        Err(e) => log::error!("Final offset checkpoint failed: {e}"),
    }
}
