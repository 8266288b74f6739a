//! Record types for the measurements table.

use chrono::NaiveDateTime;

use super::StoreError;

/// Format of the `Date` column, matching SQLite's `datetime()` output.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a `Date` value. Fractional seconds and a `T` separator are accepted
/// for rows written by other tools.
pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
}

/// A persisted measurement row.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub id: i64,
    pub timestamp: NaiveDateTime,
    pub name: Option<String>,
    /// Layer thickness in nanometers
    pub thickness: f64,
    pub wavelength: Option<f64>,
    /// Filename inside the canonical image directory
    pub ref_image: String,
    /// Filename inside the canonical image directory
    pub mat_image: String,
    pub shelf: String,
    pub book: String,
    pub page: String,
    pub note: Option<String>,
}

/// Payload for inserting a new measurement.
///
/// The store assigns `id`, and assigns `timestamp` when it is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMeasurement {
    pub timestamp: Option<NaiveDateTime>,
    pub name: Option<String>,
    pub thickness: f64,
    pub wavelength: Option<f64>,
    pub ref_image: String,
    pub mat_image: String,
    pub shelf: String,
    pub book: String,
    pub page: String,
    pub note: Option<String>,
}

impl NewMeasurement {
    pub fn new(
        thickness: f64,
        ref_image: impl Into<String>,
        mat_image: impl Into<String>,
        shelf: impl Into<String>,
        book: impl Into<String>,
        page: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: None,
            name: None,
            thickness,
            wavelength: None,
            ref_image: ref_image.into(),
            mat_image: mat_image.into(),
            shelf: shelf.into(),
            book: book.into(),
            page: page.into(),
            note: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_wavelength(mut self, wavelength: f64) -> Self {
        self.wavelength = Some(wavelength);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: NaiveDateTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Check the NOT NULL columns before anything touches the database.
    ///
    /// A NaN thickness counts as missing since SQLite binds NaN as NULL.
    pub fn validate(&self) -> Result<(), StoreError> {
        if !self.thickness.is_finite() {
            return Err(StoreError::MissingField("Layer"));
        }
        let required = [
            ("RefImage", &self.ref_image),
            ("MatImage", &self.mat_image),
            ("Shelf", &self.shelf),
            ("Book", &self.book),
            ("Page", &self.page),
        ];
        for (column, value) in required {
            if value.trim().is_empty() {
                return Err(StoreError::MissingField(column));
            }
        }
        Ok(())
    }
}

/// Which of the two captured images a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    Reference,
    Material,
}

impl ImageRole {
    /// Filename prefix used both in the canonical directory and in archives.
    pub fn prefix(&self) -> &'static str {
        match self {
            ImageRole::Reference => "ref",
            ImageRole::Material => "mat",
        }
    }
}
