//! Persistent store for layer thickness measurements, with ZIP archive
//! export and import.
//!
//! [`MeasurementStore`] owns the SQLite database and the canonical image
//! directory next to it. [`export_to_archive`] and [`import_from_archive`]
//! move filtered sets of records, with their images, in and out of
//! self-contained archives.

pub mod config;
pub mod db;
pub mod export;
pub mod import;
pub mod logging;
pub mod manifest;

pub use db::{
    Column, ImageRole, MeasurementFilter, MeasurementRecord, MeasurementStore, NewMeasurement,
    SortDirection, SortOrder, StoreError,
};
pub use export::export_to_archive;
pub use import::{import_from_archive, ImportSummary, RowFailure};
pub use manifest::ExchangeError;
