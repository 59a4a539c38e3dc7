//! SQLite schema for the checkpoint log

use geoharvest_common::{PipelineError, Result};
use rusqlite::Connection;

/// Initialize checkpoint database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stage TEXT NOT NULL,
            unit_key TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('succeeded', 'failed')),
            detail TEXT,
            artifacts TEXT NOT NULL DEFAULT '[]',  -- JSON array of paths
            recorded_at TEXT NOT NULL
        )
        "#,
        [],
    )
    .map_err(|e| PipelineError::checkpoint(format!("Failed to create checkpoints table: {}", e)))?;

    // Latest-record lookups scan (stage, unit_key) by descending id
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_stage_key ON checkpoints (stage, unit_key, id)",
        [],
    )
    .map_err(|e| PipelineError::checkpoint(format!("Failed to create checkpoint index: {}", e)))?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'checkpoints'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_status_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO checkpoints (stage, unit_key, status, recorded_at) VALUES ('fetch', '06', 'maybe', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err());
    }
}
