use crate::error::{GazecapError, Result};
use rusqlite::{Connection, Transaction};
use tracing::{info, warn};

pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Bring the database up to the current schema version.
///
/// A database stamped with a *newer* version than this build supports is
/// wiped and recreated; capture data does not survive a downgrade, and a
/// stale-schema store must never reject initialization.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| GazecapError::storage(format!("failed to read user_version: {}", e)))?;

    if version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database version {} is newer than supported schema {}; wiping store",
            version, CURRENT_SCHEMA_VERSION
        );
        wipe(conn)?;
        version = 0;
    }

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .map_err(|e| GazecapError::storage(format!("failed to open migration transaction: {}", e)))?;

    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)?;
        version = next_version;
    }

    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .map_err(|e| GazecapError::storage(format!("failed to update user_version: {}", e)))?;
    tx.commit()
        .map_err(|e| GazecapError::storage(format!("failed to commit migrations: {}", e)))?;

    info!("Database schema at version {}", CURRENT_SCHEMA_VERSION);
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<()> {
    let script = match version {
        1 => include_str!("schemas/schema_v1.sql"),
        2 => include_str!("schemas/schema_v2.sql"),
        _ => {
            return Err(GazecapError::storage(format!(
                "unknown migration target version: {}",
                version
            )))
        }
    };
    tx.execute_batch(script)
        .map_err(|e| GazecapError::storage(format!("migration to version {} failed: {}", version, e)))
}

/// Drop every application table and reset the version stamp.
fn wipe(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "DROP TABLE IF EXISTS chunk_payloads;
         DROP TABLE IF EXISTS video_chunks;
         DROP TABLE IF EXISTS gaze_samples;
         DROP TABLE IF EXISTS session_events;
         DROP TABLE IF EXISTS sessions;",
    )
    .map_err(|e| GazecapError::storage(format!("failed to wipe store: {}", e)))?;
    conn.pragma_update(None, "user_version", 0)
        .map_err(|e| GazecapError::storage(format!("failed to reset user_version: {}", e)))?;
    Ok(())
}
