//! SQLite-backed checkpoint store

use crate::checkpoint::{schema, CheckpointRecord, CheckpointStore};
use async_trait::async_trait;
use geoharvest_common::{CheckpointStatus, PipelineError, Result, Stage, UnitKey};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const RECORD_COLUMNS: &str = "id, stage, unit_key, status, detail, artifacts, recorded_at";

/// Checkpoint log in a single SQLite file
///
/// One connection is shared by all workers behind a mutex; statements are short
/// and the stage runner's concurrency is bounded, so contention stays low.
pub struct SqliteCheckpointStore {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteCheckpointStore {
    /// Open (or create) the checkpoint database at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path).map_err(|e| {
            PipelineError::checkpoint(format!(
                "Failed to open checkpoint database {}: {}",
                db_path.display(),
                e
            ))
        })?;

        // WAL keeps readers off the writer; FULL makes each committed record survive power loss
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| PipelineError::checkpoint(format!("Failed to enable WAL: {}", e)))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| PipelineError::checkpoint(format!("Failed to set synchronous: {}", e)))?;

        schema::init_schema(&conn)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path: Some(db_path.to_path_buf()),
        })
    }

    /// Create an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            PipelineError::checkpoint(format!("Failed to create in-memory database: {}", e))
        })?;

        schema::init_schema(&conn)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| PipelineError::checkpoint(format!("Failed to acquire database lock: {}", e)))
    }
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CheckpointRecord> {
    let stage = row
        .get::<_, String>(1)?
        .parse::<Stage>()
        .map_err(|e| conversion_error(1, e))?;

    let unit_key = UnitKey::parse(&row.get::<_, String>(2)?).map_err(|e| conversion_error(2, e))?;

    let status = row
        .get::<_, String>(3)?
        .parse::<CheckpointStatus>()
        .map_err(|e| conversion_error(3, e))?;

    let artifacts: Vec<PathBuf> =
        serde_json::from_str(&row.get::<_, String>(5)?).map_err(|e| conversion_error(5, e))?;

    let recorded_at = chrono::DateTime::parse_from_rfc3339(&row.get::<_, String>(6)?)
        .map_err(|e| conversion_error(6, e))?
        .with_timezone(&chrono::Utc);

    Ok(CheckpointRecord {
        id: Some(row.get(0)?),
        stage,
        unit_key,
        status,
        detail: row.get(4)?,
        artifacts,
        recorded_at,
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn record(&self, record: CheckpointRecord) -> Result<i64> {
        let artifacts_json = serde_json::to_string(&record.artifacts)?;
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO checkpoints (stage, unit_key, status, detail, artifacts, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.stage.as_str(),
                record.unit_key.as_str(),
                record.status.as_str(),
                record.detail,
                artifacts_json,
                record.recorded_at.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            PipelineError::checkpoint(format!(
                "Failed to record {} checkpoint for '{}': {}",
                record.stage, record.unit_key, e
            ))
        })?;

        Ok(conn.last_insert_rowid())
    }

    async fn latest(&self, stage: Stage, unit_key: &UnitKey) -> Result<Option<CheckpointRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM checkpoints WHERE stage = ?1 AND unit_key = ?2 ORDER BY id DESC LIMIT 1",
            RECORD_COLUMNS
        );

        conn.query_row(&sql, params![stage.as_str(), unit_key.as_str()], record_from_row)
            .optional()
            .map_err(|e| {
                PipelineError::checkpoint(format!(
                    "Failed to read {} checkpoint for '{}': {}",
                    stage, unit_key, e
                ))
            })
    }

    async fn latest_records(
        &self,
        stage: Stage,
        status: Option<CheckpointStatus>,
    ) -> Result<Vec<CheckpointRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            r#"
            SELECT {cols} FROM checkpoints
            WHERE id IN (
                SELECT MAX(id) FROM checkpoints WHERE stage = ?1 GROUP BY unit_key
            )
            AND (?2 IS NULL OR status = ?2)
            ORDER BY unit_key ASC
            "#,
            cols = RECORD_COLUMNS
        );

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| PipelineError::checkpoint(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(
                params![stage.as_str(), status.map(|s| s.as_str())],
                record_from_row,
            )
            .map_err(|e| PipelineError::checkpoint(format!("Failed to query checkpoints: {}", e)))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::checkpoint(format!("Failed to read checkpoints: {}", e)))
    }

    async fn invalidate(&self, stage: Stage, prefix: Option<&UnitKey>) -> Result<usize> {
        let conn = self.conn()?;

        let removed = match prefix {
            None => conn.execute(
                "DELETE FROM checkpoints WHERE stage = ?1",
                params![stage.as_str()],
            ),
            Some(prefix) => {
                // Component-wise: "06" matches "06" and "06/..." but not "060"
                let below = format!("{}{}", prefix.as_str(), geoharvest_common::types::KEY_SEPARATOR);
                conn.execute(
                    r#"
                    DELETE FROM checkpoints
                    WHERE stage = ?1
                      AND (unit_key = ?2 OR substr(unit_key, 1, length(?3)) = ?3)
                    "#,
                    params![stage.as_str(), prefix.as_str(), below],
                )
            }
        }
        .map_err(|e| {
            PipelineError::checkpoint(format!("Failed to invalidate {} checkpoints: {}", stage, e))
        })?;

        Ok(removed)
    }
}
