//! Measurement persistence: schema, migrations and the query surface.

mod filter;
mod models;
mod schema;
mod store;

use std::io;
use std::path::PathBuf;

pub use filter::{Column, MeasurementFilter, SortDirection, SortOrder};
pub use models::{parse_timestamp, ImageRole, MeasurementRecord, NewMeasurement, TIMESTAMP_FORMAT};
pub use schema::{latest_version, Migration, MIGRATIONS};
pub use store::MeasurementStore;

/// Subdirectory of the database's parent that holds every stored image.
pub const IMAGE_DIR_NAME: &str = "images";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("migration to schema version {version} failed: {source}")]
    Migration {
        version: i64,
        #[source]
        source: rusqlite::Error,
    },

    #[error("required field `{0}` is missing")]
    MissingField(&'static str),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
