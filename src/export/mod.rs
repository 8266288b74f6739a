//! Export a filtered view of the store as a self-contained ZIP archive.

use chrono::{DateTime, Local};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::db::{ImageRole, MeasurementFilter, MeasurementRecord, MeasurementStore, SortOrder};
use crate::manifest::{archive_image_path, ExchangeError, ManifestEntry, IMAGE_DIR, MANIFEST_FILE};

/// Export every record matching `filter` into a timestamped archive inside
/// `target_dir`.
///
/// Returns `Ok(None)` without touching the filesystem when nothing matches.
/// Missing source images are logged and skipped; any other I/O failure
/// aborts the export. The staging directory is removed on every path.
pub fn export_to_archive(
    store: &MeasurementStore,
    filter: &MeasurementFilter,
    target_dir: &Path,
) -> Result<Option<PathBuf>, ExchangeError> {
    export_to_archive_in(store, filter, target_dir, &std::env::temp_dir())
}

/// [`export_to_archive`] with the staging directory created under
/// `staging_parent`.
pub(crate) fn export_to_archive_in(
    store: &MeasurementStore,
    filter: &MeasurementFilter,
    target_dir: &Path,
    staging_parent: &Path,
) -> Result<Option<PathBuf>, ExchangeError> {
    let records = store.try_query_all(filter, SortOrder::default())?;
    if records.is_empty() {
        info!("No measurements match the export filter");
        return Ok(None);
    }

    let staging = tempfile::Builder::new()
        .prefix("layerstore-export-")
        .tempdir_in(staging_parent)?;
    let image_dir = staging.path().join(IMAGE_DIR);
    fs::create_dir_all(&image_dir)?;

    let mut missing_images = 0;
    let mut writer = csv::Writer::from_path(staging.path().join(MANIFEST_FILE))?;
    for record in &records {
        for role in [ImageRole::Reference, ImageRole::Material] {
            if !stage_image(store, record, role, staging.path())? {
                missing_images += 1;
            }
        }
        writer.serialize(ManifestEntry::new(record))?;
    }
    writer.flush()?;
    drop(writer);

    fs::create_dir_all(target_dir)?;
    let archive_path = unique_archive_path(target_dir, Local::now());
    if let Err(e) = write_archive(staging.path(), &archive_path) {
        let _ = fs::remove_file(&archive_path);
        return Err(e);
    }

    if let Err(e) = staging.close() {
        warn!(error = %e, "Failed to remove export staging directory");
    }

    info!(
        path = ?archive_path,
        rows = records.len(),
        missing_images,
        "Export complete"
    );
    Ok(Some(archive_path))
}

/// Copy one of a record's images into the staging tree.
///
/// Returns `Ok(false)` when the source file is missing.
fn stage_image(
    store: &MeasurementStore,
    record: &MeasurementRecord,
    role: ImageRole,
    staging_root: &Path,
) -> Result<bool, ExchangeError> {
    let name = match role {
        ImageRole::Reference => &record.ref_image,
        ImageRole::Material => &record.mat_image,
    };
    let source = match store.image_path(name) {
        Some(path) if path.is_file() => path,
        _ => {
            warn!(id = record.id, image = %name, "Image missing from store, exporting row without it");
            return Ok(false);
        }
    };

    fs::copy(&source, staging_root.join(archive_image_path(role, record.id)))?;
    Ok(true)
}

fn archive_file_name(now: DateTime<Local>) -> String {
    format!("measurements_export_{}.zip", now.format("%Y%m%d_%H%M%S"))
}

/// Timestamped archive path, suffixed when an export from the same second
/// already exists.
fn unique_archive_path(target_dir: &Path, now: DateTime<Local>) -> PathBuf {
    let base = archive_file_name(now);
    let mut candidate = target_dir.join(&base);
    let stem = base.trim_end_matches(".zip");
    let mut n = 1;
    while candidate.exists() {
        candidate = target_dir.join(format!("{stem}_{n}.zip"));
        n += 1;
    }
    candidate
}

/// Zip the staging tree. PNGs are stored as-is; the manifest is deflated.
fn write_archive(root: &Path, archive_path: &Path) -> Result<(), ExchangeError> {
    let mut zip = ZipWriter::new(File::create(archive_path)?);
    let options = |method| SimpleFileOptions::default().compression_method(method);

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            zip.add_directory(name, options(CompressionMethod::Deflated))?;
        } else {
            let is_png = entry
                .path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
            let method = if is_png {
                CompressionMethod::Stored
            } else {
                CompressionMethod::Deflated
            };
            zip.start_file(name, options(method))?;
            io::copy(&mut File::open(entry.path())?, &mut zip)?;
        }
    }

    zip.finish()?;
    Ok(())
}
