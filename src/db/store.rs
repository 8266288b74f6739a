//! SQLite-backed measurement store.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::filter::{Column, MeasurementFilter, SortOrder, WhereClause};
use super::models::{parse_timestamp, ImageRole, MeasurementRecord, NewMeasurement, TIMESTAMP_FORMAT};
use super::schema::{Migration, MIGRATIONS, SELECT_COLUMNS, TABLE};
use super::{StoreError, IMAGE_DIR_NAME};

/// Handle to the measurement database and its canonical image directory.
///
/// The connection may be moved between threads, but the store does no
/// locking of its own: callers that share it must serialize writes.
pub struct MeasurementStore {
    conn: Connection,
    db_path: PathBuf,
    image_dir: PathBuf,
}

impl MeasurementStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// The parent directory and `<parent>/images/` are created if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        let parent = db_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let image_dir = parent.join(IMAGE_DIR_NAME);
        create_dir(&parent)?;
        create_dir(&image_dir)?;

        let conn = Connection::open(&db_path).map_err(|source| StoreError::Open {
            path: db_path.clone(),
            source,
        })?;

        let store = Self {
            conn,
            db_path,
            image_dir,
        };
        let applied = store.migrate()?;
        info!(path = ?store.db_path, applied, "Measurement store opened");
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    /// Resolve a stored image filename inside the canonical directory.
    ///
    /// Returns `None` for anything that is not a bare filename.
    pub fn image_path(&self, name: &str) -> Option<PathBuf> {
        let file_name = Path::new(name).file_name()?;
        if file_name != name {
            return None;
        }
        Some(self.image_dir.join(file_name))
    }

    // ========================================================================
    // Schema
    // ========================================================================

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let version = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;
        Ok(version)
    }

    /// Apply every migration newer than the recorded `user_version`.
    ///
    /// Returns the number of steps that issued DDL; zero when the schema is
    /// already current.
    pub fn migrate(&self) -> Result<usize, StoreError> {
        let current = self.schema_version()?;
        let mut applied = 0;
        for (index, migration) in MIGRATIONS.iter().enumerate() {
            let version = index as i64 + 1;
            if version <= current {
                continue;
            }
            let ran_ddl = self
                .apply_migration(version, migration)
                .map_err(|source| StoreError::Migration { version, source })?;
            if ran_ddl {
                applied += 1;
            }
            info!(version, ran_ddl, "Schema migration applied");
        }
        Ok(applied)
    }

    fn apply_migration(&self, version: i64, migration: &Migration) -> rusqlite::Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let ran_ddl = match migration {
            Migration::Batch(sql) => {
                tx.execute_batch(sql)?;
                true
            }
            Migration::AddColumn { column, definition } => {
                // Databases created before versioning may already carry the column
                if table_columns(&tx)?
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(column))
                {
                    false
                } else {
                    tx.execute_batch(&format!(
                        "ALTER TABLE {TABLE} ADD COLUMN {column} {definition}"
                    ))?;
                    true
                }
            }
        };
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        Ok(ran_ddl)
    }

    // ========================================================================
    // Records
    // ========================================================================

    /// Insert a measurement and return its new id.
    pub fn save(&self, measurement: &NewMeasurement) -> Result<i64, StoreError> {
        measurement.validate()?;

        let timestamp = measurement
            .timestamp
            .unwrap_or_else(|| Local::now().naive_local());
        let result = self.conn.execute(
            r#"
            INSERT INTO measurements (Date, Name, Layer, Wavelength, RefImage, MatImage, Shelf, Book, Page, Note)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                timestamp.format(TIMESTAMP_FORMAT).to_string(),
                measurement.name,
                measurement.thickness,
                measurement.wavelength,
                measurement.ref_image,
                measurement.mat_image,
                measurement.shelf,
                measurement.book,
                measurement.page,
                measurement.note,
            ],
        );

        match result {
            Ok(_) => {
                let id = self.conn.last_insert_rowid();
                debug!(id, "Measurement saved");
                Ok(id)
            }
            Err(e) => {
                error!(error = %e, "Failed to save measurement");
                Err(e.into())
            }
        }
    }

    pub fn get(&self, id: i64) -> Option<MeasurementRecord> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM {TABLE} WHERE id = ?1"),
                [id],
                record_from_row,
            )
            .optional();
        result.unwrap_or_else(|e| {
            error!(id, error = %e, "Failed to fetch measurement");
            None
        })
    }

    /// Delete a measurement. Returns whether a row was removed.
    ///
    /// Its image files are removed too unless another row still uses them.
    pub fn delete(&self, id: i64) -> bool {
        match self.try_delete(id) {
            Ok(removed) => removed,
            Err(e) => {
                error!(id, error = %e, "Failed to delete measurement");
                false
            }
        }
    }

    fn try_delete(&self, id: i64) -> Result<bool, StoreError> {
        let images: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT RefImage, MatImage FROM measurements WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((ref_image, mat_image)) = images else {
            return Ok(false);
        };

        let removed = self
            .conn
            .execute("DELETE FROM measurements WHERE id = ?1", [id])?
            > 0;
        if removed {
            self.release_image(&ref_image);
            self.release_image(&mat_image);
        }
        Ok(removed)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// One page of matching records. `page_num` is 1-based.
    pub fn query(
        &self,
        filter: &MeasurementFilter,
        order: SortOrder,
        page_num: usize,
        page_size: usize,
    ) -> Vec<MeasurementRecord> {
        if page_size == 0 {
            return Vec::new();
        }
        let offset = (page_num.max(1) - 1).saturating_mul(page_size);
        let page = (to_i64(page_size), to_i64(offset));
        self.select(filter, order, Some(page)).unwrap_or_else(|e| {
            error!(error = %e, "Failed to query measurements");
            Vec::new()
        })
    }

    /// Every matching record, unpaginated.
    pub fn query_all(&self, filter: &MeasurementFilter, order: SortOrder) -> Vec<MeasurementRecord> {
        self.try_query_all(filter, order).unwrap_or_else(|e| {
            error!(error = %e, "Failed to query measurements");
            Vec::new()
        })
    }

    /// Like [`query_all`](Self::query_all), but database errors are returned
    /// instead of reading as an empty result.
    pub fn try_query_all(
        &self,
        filter: &MeasurementFilter,
        order: SortOrder,
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        self.select(filter, order, None)
    }

    pub fn count(&self, filter: &MeasurementFilter) -> i64 {
        let WhereClause { sql, params } = filter.where_clause();
        let result = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {TABLE} {sql}"),
            params_from_iter(params.iter()),
            |row| row.get::<_, i64>(0),
        );
        result.unwrap_or_else(|e| {
            error!(error = %e, "Failed to count measurements");
            0
        })
    }

    /// Unique non-empty values of `column`, ascending.
    pub fn distinct(&self, column: Column) -> Vec<String> {
        self.try_distinct(column).unwrap_or_else(|e| {
            error!(column = column.sql_name(), error = %e, "Failed to list distinct values");
            Vec::new()
        })
    }

    fn try_distinct(&self, column: Column) -> Result<Vec<String>, StoreError> {
        let col = column.sql_name();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT {col} FROM {TABLE}
             WHERE {col} IS NOT NULL AND CAST({col} AS TEXT) != ''
             ORDER BY {col} ASC"
        ))?;
        let values = stmt
            .query_map([], |row| row.get::<_, Value>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(values.into_iter().filter_map(value_to_string).collect())
    }

    fn select(
        &self,
        filter: &MeasurementFilter,
        order: SortOrder,
        page: Option<(i64, i64)>,
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        let WhereClause { sql: where_sql, mut params } = filter.where_clause();
        let mut sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {TABLE} {where_sql} {}",
            order.order_by_clause()
        );
        if let Some((limit, offset)) = page {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(Value::Integer(limit));
            params.push(Value::Integer(offset));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(params.iter()), record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    // ========================================================================
    // Images
    // ========================================================================

    /// Copy an image into the canonical directory under a fresh
    /// `<prefix>_<uuid>.png` name and return that name.
    pub fn copy_image_in(&self, source: &Path, role: ImageRole) -> Result<String, StoreError> {
        let name = format!("{}_{}.png", role.prefix(), Uuid::new_v4());
        fs::copy(source, self.image_dir.join(&name))?;
        debug!(source = ?source, name = %name, "Image copied into store");
        Ok(name)
    }

    /// Remove a canonical image file unless a row still references it.
    pub(crate) fn release_image(&self, name: &str) {
        let referenced = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM measurements WHERE RefImage = ?1 OR MatImage = ?1)",
            [name],
            |row| row.get::<_, bool>(0),
        );
        match referenced {
            Ok(false) => {}
            Ok(true) => return,
            Err(e) => {
                warn!(name, error = %e, "Could not check image references, keeping file");
                return;
            }
        }

        let Some(path) = self.image_path(name) else {
            return;
        };
        if path.is_file() {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = ?path, error = %e, "Failed to remove image file");
            }
        }
    }
}

fn create_dir(path: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(path).map_err(|source| StoreError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// A `Date` that cannot be read (legacy rows, other writers) is reported as
/// the Unix epoch so the row stays listed and counted.
fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MeasurementRecord> {
    let id: i64 = row.get(0)?;
    let date = row.get::<_, Value>(1)?;
    let timestamp = value_to_string(date.clone())
        .and_then(|text| parse_timestamp(&text).ok())
        .unwrap_or_else(|| {
            warn!(id, date = ?date, "Unreadable measurement date");
            unreadable_timestamp()
        });
    Ok(MeasurementRecord {
        id,
        timestamp,
        name: row.get(2)?,
        thickness: row.get(3)?,
        wavelength: row.get(4)?,
        ref_image: row.get(5)?,
        mat_image: row.get(6)?,
        shelf: row.get(7)?,
        book: row.get(8)?,
        page: row.get(9)?,
        note: row.get(10)?,
    })
}

fn unreadable_timestamp() -> NaiveDateTime {
    DateTime::<Utc>::UNIX_EPOCH.naive_utc()
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(f.to_string()),
        Value::Text(s) => Some(s),
        Value::Null | Value::Blob(_) => None,
    }
}

fn table_columns(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({TABLE})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}
