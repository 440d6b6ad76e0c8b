//! SQLite-backed [`DiffStore`].

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use super::{DiffStore, StoredDiff};
use crate::domain::{FileId, ImageSide, MapDiffEntry, Region, RepositoryKey};
use crate::error::{MapDiffError, Result};

/// Stores map diffs in a single SQLite database file.
#[derive(Clone)]
pub struct SqliteDiffStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteDiffStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(path)?;
        Self::init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS map_diffs (
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                number INTEGER NOT NULL,
                file_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                min_x INTEGER,
                min_y INTEGER,
                max_x INTEGER,
                max_y INTEGER,
                before_image BLOB,
                after_image BLOB,
                created_at TEXT NOT NULL,
                PRIMARY KEY (owner, name, number, file_id)
            );
            "#,
        )?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| MapDiffError::Storage(format!("Storage task failed: {}", e)))?
    }
}

fn side_column(side: ImageSide) -> &'static str {
    match side {
        ImageSide::Before => "before_image",
        ImageSide::After => "after_image",
    }
}

fn number_param(number: u64) -> Result<i64> {
    i64::try_from(number).map_err(|_| MapDiffError::Storage(format!("Pull request number out of range: {}", number)))
}

#[async_trait]
impl DiffStore for SqliteDiffStore {
    async fn save(&self, entries: &[MapDiffEntry]) -> Result<()> {
        let entries = entries.to_vec();
        let created_at = Utc::now().to_rfc3339();

        self.with_db(move |conn| {
            let tx = conn.transaction()?;

            let pull_requests: BTreeSet<(String, String, u64)> = entries
                .iter()
                .map(|e| (e.repository.owner.clone(), e.repository.name.clone(), e.pull_request))
                .collect();
            for (owner, name, number) in &pull_requests {
                tx.execute(
                    "DELETE FROM map_diffs WHERE owner = ?1 AND name = ?2 AND number = ?3",
                    params![owner, name, number_param(*number)?],
                )?;
            }

            for entry in &entries {
                let region = entry.region;
                tx.execute(
                    "INSERT OR REPLACE INTO map_diffs
                        (owner, name, number, file_id, file_path, min_x, min_y, max_x, max_y,
                         before_image, after_image, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        entry.repository.owner,
                        entry.repository.name,
                        number_param(entry.pull_request)?,
                        entry.file_id.as_str(),
                        entry.file_path,
                        region.map(|r| r.min_x),
                        region.map(|r| r.min_y),
                        region.map(|r| r.max_x),
                        region.map(|r| r.max_y),
                        entry.before,
                        entry.after,
                        created_at,
                    ],
                )?;
            }

            tx.commit()?;
            debug!(entries = entries.len(), "Saved map diffs");
            Ok(())
        })
        .await
    }

    async fn load_image(
        &self,
        repository: &RepositoryKey,
        number: u64,
        file_id: &FileId,
        side: ImageSide,
    ) -> Result<Option<Vec<u8>>> {
        let repository = repository.clone();
        let file_id = file_id.clone();
        let number = number_param(number)?;

        self.with_db(move |conn| {
            let sql = format!(
                "SELECT {} FROM map_diffs WHERE owner = ?1 AND name = ?2 AND number = ?3 AND file_id = ?4",
                side_column(side)
            );
            let image: Option<Option<Vec<u8>>> = conn
                .query_row(
                    &sql,
                    params![repository.owner, repository.name, number, file_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(image.flatten())
        })
        .await
    }

    async fn list(&self, repository: &RepositoryKey, number: u64) -> Result<Vec<StoredDiff>> {
        let repository = repository.clone();
        let number = number_param(number)?;

        self.with_db(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT file_id, file_path, min_x, min_y, max_x, max_y,
                        before_image IS NOT NULL, after_image IS NOT NULL, created_at
                 FROM map_diffs
                 WHERE owner = ?1 AND name = ?2 AND number = ?3
                 ORDER BY file_path",
            )?;
            let rows = stmt.query_map(params![repository.owner, repository.name, number], |row| {
                let bounds: (Option<i32>, Option<i32>, Option<i32>, Option<i32>) =
                    (row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?);
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    bounds,
                    row.get::<_, bool>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?;

            let mut diffs = Vec::new();
            for row in rows {
                let (file_id, file_path, bounds, has_before, has_after, created_at) = row?;
                let region = match bounds {
                    (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) => {
                        Some(Region::new(min_x, min_y, max_x, max_y))
                    }
                    _ => None,
                };
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| MapDiffError::Storage(format!("Bad timestamp {}: {}", created_at, e)))?
                    .with_timezone(&Utc);
                diffs.push(StoredDiff {
                    file_id: FileId::from_raw(file_id),
                    file_path,
                    region,
                    has_before,
                    has_after,
                    created_at,
                });
            }
            Ok(diffs)
        })
        .await
    }
}
