// src/db/connection.rs
//! Opening and initialising the offset checkpoint database.

use rusqlite::Connection;
use std::{path::Path, time::Duration};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS feed_offsets (
    feed_id     TEXT PRIMARY KEY,
    last_offset INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);
";

pub fn open_db_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(1_000))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

/// Open (creating if needed) the database at `path` and apply the schema.
pub fn init_database(path: &Path) -> rusqlite::Result<Connection> {
    let conn = open_db_connection(path)?;
    conn.execute_batch(SCHEMA)?;
    log::info!("Offset database ready at {}", path.display());
    Ok(conn)
}
