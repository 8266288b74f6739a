//! Archive manifest format shared by export and import.
//!
//! An archive holds `measurements.csv` at its root and every referenced image
//! under `img/`. The manifest carries all record columns except `id`.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;

use crate::db::{parse_timestamp, ImageRole, MeasurementRecord, StoreError, TIMESTAMP_FORMAT};

pub const MANIFEST_FILE: &str = "measurements.csv";
pub const IMAGE_DIR: &str = "img";

/// Manifest header, in the order columns are written.
pub const COLUMNS: [&str; 10] = [
    "Date",
    "Name",
    "Layer",
    "Wavelength",
    "RefImage",
    "MatImage",
    "Shelf",
    "Book",
    "Page",
    "Note",
];

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("manifest error: {0}")]
    Csv(#[from] csv::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("archive has no measurements.csv at its root")]
    MissingManifest,

    #[error("manifest is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<&'static str>),

    #[error("invalid value {value:?} for {column}")]
    InvalidField { column: &'static str, value: String },

    #[error("referenced image not found: {}", .0.display())]
    MissingImage(PathBuf),
}

/// Archive-relative path for a record's image, e.g. `img/ref_12.png`.
pub fn archive_image_path(role: ImageRole, id: i64) -> String {
    format!("{}/{}_{}.png", IMAGE_DIR, role.prefix(), id)
}

/// Required columns absent from a manifest header.
pub fn missing_columns(headers: &csv::StringRecord) -> Vec<&'static str> {
    COLUMNS
        .into_iter()
        .filter(|column| !headers.iter().any(|h| h.trim() == *column))
        .collect()
}

/// One manifest row as written by export.
#[derive(Debug, Serialize)]
pub struct ManifestEntry<'a> {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Name")]
    name: Option<&'a str>,
    #[serde(rename = "Layer")]
    layer: f64,
    #[serde(rename = "Wavelength")]
    wavelength: Option<f64>,
    #[serde(rename = "RefImage")]
    ref_image: String,
    #[serde(rename = "MatImage")]
    mat_image: String,
    #[serde(rename = "Shelf")]
    shelf: &'a str,
    #[serde(rename = "Book")]
    book: &'a str,
    #[serde(rename = "Page")]
    page: &'a str,
    #[serde(rename = "Note")]
    note: Option<&'a str>,
}

impl<'a> ManifestEntry<'a> {
    /// Image columns point at the archive copies rather than the store files.
    pub fn new(record: &'a MeasurementRecord) -> Self {
        Self {
            date: record.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            name: record.name.as_deref(),
            layer: record.thickness,
            wavelength: record.wavelength,
            ref_image: archive_image_path(ImageRole::Reference, record.id),
            mat_image: archive_image_path(ImageRole::Material, record.id),
            shelf: &record.shelf,
            book: &record.book,
            page: &record.page,
            note: record.note.as_deref(),
        }
    }
}

/// One manifest row as read by import. Every cell stays raw text so each
/// column can be coerced with its own failure rule.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestRow {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Layer")]
    pub layer: String,
    #[serde(rename = "Wavelength")]
    pub wavelength: String,
    #[serde(rename = "RefImage")]
    pub ref_image: String,
    #[serde(rename = "MatImage")]
    pub mat_image: String,
    #[serde(rename = "Shelf")]
    pub shelf: String,
    #[serde(rename = "Book")]
    pub book: String,
    #[serde(rename = "Page")]
    pub page: String,
    #[serde(rename = "Note")]
    pub note: String,
}

impl ManifestRow {
    pub fn thickness(&self) -> Result<f64, ExchangeError> {
        self.layer
            .trim()
            .parse::<f64>()
            .map_err(|_| ExchangeError::InvalidField {
                column: "Layer",
                value: self.layer.clone(),
            })
    }

    /// Blank or unparseable wavelengths become `None`.
    pub fn wavelength(&self) -> Option<f64> {
        let raw = self.wavelength.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.parse::<f64>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(value = raw, "Invalid Wavelength in manifest, storing NULL");
                None
            }
        }
    }

    /// Blank or unparseable dates become `None` so the store stamps the row.
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        let raw = self.date.trim();
        if raw.is_empty() {
            return None;
        }
        match parse_timestamp(raw) {
            Ok(timestamp) => Some(timestamp),
            Err(_) => {
                tracing::warn!(value = raw, "Invalid Date in manifest, using import time");
                None
            }
        }
    }

    pub fn name(&self) -> Option<String> {
        optional(&self.name)
    }

    pub fn note(&self) -> Option<String> {
        optional(&self.note)
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> ManifestRow {
        ManifestRow {
            date: "2024-05-01 10:00:00".to_string(),
            name: String::new(),
            layer: " 150.7 ".to_string(),
            wavelength: "633".to_string(),
            ref_image: "img/ref_1.png".to_string(),
            mat_image: "img/mat_1.png".to_string(),
            shelf: "main".to_string(),
            book: "Si".to_string(),
            page: "Johnson".to_string(),
            note: "n".to_string(),
        }
    }

    #[test]
    fn test_archive_image_path() {
        assert_eq!(archive_image_path(ImageRole::Reference, 7), "img/ref_7.png");
        assert_eq!(archive_image_path(ImageRole::Material, 7), "img/mat_7.png");
    }

    #[test]
    fn test_missing_columns() {
        let full = csv::StringRecord::from(COLUMNS.to_vec());
        assert!(missing_columns(&full).is_empty());

        let partial = csv::StringRecord::from(vec!["Note", "Date", "Name", "Wavelength"]);
        let missing = missing_columns(&partial);
        assert!(missing.contains(&"Layer"));
        assert!(missing.contains(&"RefImage"));
        assert!(!missing.contains(&"Note"));
    }

    #[test]
    fn test_thickness_coercion() {
        assert_eq!(row().thickness().unwrap(), 150.7);

        let mut bad = row();
        bad.layer = String::new();
        assert!(matches!(
            bad.thickness(),
            Err(ExchangeError::InvalidField { column: "Layer", .. })
        ));
    }

    #[test]
    fn test_wavelength_is_lenient() {
        assert_eq!(row().wavelength(), Some(633.0));

        let mut blank = row();
        blank.wavelength = "  ".to_string();
        assert_eq!(blank.wavelength(), None);

        let mut bad = row();
        bad.wavelength = "red".to_string();
        assert_eq!(bad.wavelength(), None);
    }

    #[test]
    fn test_blank_optional_text_is_none() {
        let r = row();
        assert_eq!(r.name(), None);
        assert_eq!(r.note().as_deref(), Some("n"));
        assert!(r.timestamp().is_some());
    }
}
