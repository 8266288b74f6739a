//! Import a previously exported archive, isolating failures per row.

use std::fs::File;
use std::path::{Component, Path, PathBuf};
use tracing::{error, info, warn};
use zip::ZipArchive;

use crate::db::{ImageRole, MeasurementStore, NewMeasurement};
use crate::manifest::{missing_columns, ExchangeError, ManifestRow, MANIFEST_FILE};

/// A manifest row that could not be imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// 1-based line in the manifest, header included
    pub line: u64,
    pub reason: String,
}

/// Outcome of one import call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<RowFailure>,
}

impl ImportSummary {
    /// `(succeeded, failed)`
    pub fn counts(&self) -> (usize, usize) {
        (self.succeeded, self.failed)
    }

    fn record_failure(&mut self, line: u64, reason: &ExchangeError) {
        warn!(line, error = %reason, "Skipping manifest row");
        self.failed += 1;
        self.failures.push(RowFailure {
            line,
            reason: reason.to_string(),
        });
    }
}

/// Import every row of the archive's manifest into `store`.
///
/// Only an unreadable archive, a missing manifest, or a manifest lacking a
/// required column aborts the whole batch (returning `(0, 0)`). Any other
/// problem fails just the row it occurs in. The extraction directory is
/// removed on every path. Re-importing an archive creates duplicates.
pub fn import_from_archive(store: &MeasurementStore, archive_path: &Path) -> ImportSummary {
    import_from_archive_in(store, archive_path, &std::env::temp_dir())
}

/// [`import_from_archive`] with the extraction directory created under
/// `extraction_parent`.
pub(crate) fn import_from_archive_in(
    store: &MeasurementStore,
    archive_path: &Path,
    extraction_parent: &Path,
) -> ImportSummary {
    info!(path = ?archive_path, "Starting import");
    match try_import(store, archive_path, extraction_parent) {
        Ok(summary) => {
            info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                "Import complete"
            );
            summary
        }
        Err(e) => {
            error!(path = ?archive_path, error = %e, "Import aborted");
            ImportSummary::default()
        }
    }
}

fn try_import(
    store: &MeasurementStore,
    archive_path: &Path,
    extraction_parent: &Path,
) -> Result<ImportSummary, ExchangeError> {
    let extraction = tempfile::Builder::new()
        .prefix("layerstore-import-")
        .tempdir_in(extraction_parent)?;
    let root_buf = extraction.path().canonicalize()?;
    let root = root_buf.as_path();

    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    archive.extract(root)?;

    let manifest_path = root.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(ExchangeError::MissingManifest);
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_path(&manifest_path)?;
    let headers = reader.headers()?.clone();
    let missing = missing_columns(&headers);
    if !missing.is_empty() {
        return Err(ExchangeError::MissingColumns(missing));
    }

    let mut summary = ImportSummary::default();
    for (index, result) in reader.records().enumerate() {
        let fallback_line = index as u64 + 2;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                let line = e.position().map_or(fallback_line, |p| p.line());
                summary.record_failure(line, &e.into());
                continue;
            }
        };
        let line = record.position().map_or(fallback_line, |p| p.line());

        let outcome = record
            .deserialize::<ManifestRow>(Some(&headers))
            .map_err(ExchangeError::from)
            .and_then(|row| import_row(store, root, &row));
        match outcome {
            Ok(_) => summary.succeeded += 1,
            Err(e) => summary.record_failure(line, &e),
        }
    }

    drop(reader);
    if let Err(e) = extraction.close() {
        warn!(error = %e, "Failed to remove import extraction directory");
    }
    Ok(summary)
}

/// Translate one manifest row and persist it, returning the new id.
///
/// Images copied into the store are removed again if the row fails later.
fn import_row(store: &MeasurementStore, root: &Path, row: &ManifestRow) -> Result<i64, ExchangeError> {
    let thickness = row.thickness()?;
    let wavelength = row.wavelength();
    let ref_source = resolve_archive_file(root, &row.ref_image)?;
    let mat_source = resolve_archive_file(root, &row.mat_image)?;

    let ref_image = store.copy_image_in(&ref_source, ImageRole::Reference)?;
    let mat_image = match store.copy_image_in(&mat_source, ImageRole::Material) {
        Ok(name) => name,
        Err(e) => {
            store.release_image(&ref_image);
            return Err(e.into());
        }
    };

    let measurement = NewMeasurement {
        timestamp: row.timestamp(),
        name: row.name(),
        thickness,
        wavelength,
        ref_image,
        mat_image,
        shelf: row.shelf.clone(),
        book: row.book.clone(),
        page: row.page.clone(),
        note: row.note(),
    };
    store.save(&measurement).map_err(|e| {
        store.release_image(&measurement.ref_image);
        store.release_image(&measurement.mat_image);
        e.into()
    })
}

/// Resolve an archive-relative path, refusing anything that could leave the
/// extraction root, symlinks included.
///
/// `root` must already be canonical.
fn resolve_archive_file(root: &Path, relative: &str) -> Result<PathBuf, ExchangeError> {
    let relative_path = Path::new(relative.trim());
    let lexically_contained = !relative_path.as_os_str().is_empty()
        && relative_path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    let resolved = if lexically_contained {
        root.join(relative_path).canonicalize().ok()
    } else {
        None
    };
    match resolved {
        Some(path) if path.starts_with(root) && path.is_file() => Ok(path),
        _ => Err(ExchangeError::MissingImage(relative_path.to_path_buf())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MeasurementFilter, SortOrder};
    use crate::export::export_to_archive;
    use crate::manifest::COLUMNS;
    use std::fs;
    use std::io::Write;
    use tempfile::{tempdir, TempDir};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn open_store(dir: &TempDir) -> MeasurementStore {
        MeasurementStore::open(dir.path().join("data").join("measurements.db")).unwrap()
    }

    /// Build an archive from a manifest body and a list of image entries.
    fn write_zip(path: &Path, manifest: Option<&str>, images: &[&str]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default();
        if let Some(manifest) = manifest {
            zip.start_file(MANIFEST_FILE, options).unwrap();
            zip.write_all(manifest.as_bytes()).unwrap();
        }
        for image in images {
            zip.start_file(*image, options).unwrap();
            zip.write_all(b"\x89PNG fake").unwrap();
        }
        zip.finish().unwrap();
    }

    fn manifest_row(n: usize, layer: &str) -> String {
        format!("2024-05-0{n} 10:00:00,Sample {n},{layer},633,img/ref_{n}.png,img/mat_{n}.png,main,Si,Johnson,note {n}\n")
    }

    fn images_for(rows: &[usize]) -> Vec<String> {
        rows.iter()
            .flat_map(|n| [format!("img/ref_{n}.png"), format!("img/mat_{n}.png")])
            .collect()
    }

    fn total(store: &MeasurementStore) -> i64 {
        store.count(&MeasurementFilter::default())
    }

    #[test]
    fn test_import_valid_and_malformed_rows() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let mut manifest = format!("{}\n", COLUMNS.join(","));
        manifest.push_str(&manifest_row(1, "150.7"));
        manifest.push_str(&manifest_row(2, ""));
        manifest.push_str(&manifest_row(3, "95.5"));
        manifest.push_str(&manifest_row(4, "120"));
        let images = images_for(&[1, 2, 3, 4]);
        let image_refs: Vec<&str> = images.iter().map(String::as_str).collect();
        let archive = dir.path().join("in.zip");
        write_zip(&archive, Some(&manifest), &image_refs);

        let summary = import_from_archive(&store, &archive);
        assert_eq!(summary.counts(), (3, 1));
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].line, 3);
        assert_eq!(total(&store), 3);

        let records = store.query_all(&MeasurementFilter::default(), SortOrder::parse("Layer", "asc"));
        assert_eq!(records[0].thickness, 95.5);
        assert_eq!(records[0].name.as_deref(), Some("Sample 3"));
        assert_eq!(records[0].wavelength, Some(633.0));
        assert_eq!(records[0].note.as_deref(), Some("note 3"));
        assert_eq!(
            records[0].timestamp.format("%Y-%m-%d").to_string(),
            "2024-05-03"
        );
        for record in &records {
            assert!(record.ref_image.starts_with("ref_"));
            assert!(record.mat_image.starts_with("mat_"));
            assert!(store.image_path(&record.ref_image).unwrap().is_file());
            assert!(store.image_path(&record.mat_image).unwrap().is_file());
        }
        // Only the successful rows left images behind
        assert_eq!(fs::read_dir(store.image_dir()).unwrap().count(), 6);
    }

    #[test]
    fn test_import_missing_column_aborts() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let header: Vec<&str> = COLUMNS.iter().copied().filter(|c| *c != "Layer").collect();
        let manifest = format!(
            "{}\n2024-05-01 10:00:00,n,633,img/ref_1.png,img/mat_1.png,main,Si,Johnson,\n",
            header.join(",")
        );
        let archive = dir.path().join("in.zip");
        write_zip(&archive, Some(&manifest), &["img/ref_1.png", "img/mat_1.png"]);

        let summary = import_from_archive(&store, &archive);
        assert_eq!(summary.counts(), (0, 0));
        assert_eq!(total(&store), 0);
        assert_eq!(fs::read_dir(store.image_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_import_without_manifest_returns_zero() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let archive = dir.path().join("in.zip");
        write_zip(&archive, None, &["img/ref_1.png"]);

        assert_eq!(import_from_archive(&store, &archive).counts(), (0, 0));
    }

    #[test]
    fn test_import_unreadable_archive_returns_zero() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"this is not a zip file").unwrap();

        assert_eq!(import_from_archive(&store, &archive).counts(), (0, 0));
        assert_eq!(
            import_from_archive(&store, &dir.path().join("absent.zip")).counts(),
            (0, 0)
        );
    }

    #[test]
    fn test_import_missing_image_fails_row_only() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let mut manifest = format!("{}\n", COLUMNS.join(","));
        manifest.push_str(&manifest_row(1, "150.7"));
        manifest.push_str(&manifest_row(2, "160.0"));
        let archive = dir.path().join("in.zip");
        // Row 2's material image is absent
        write_zip(
            &archive,
            Some(&manifest),
            &["img/ref_1.png", "img/mat_1.png", "img/ref_2.png"],
        );

        let summary = import_from_archive(&store, &archive);
        assert_eq!(summary.counts(), (1, 1));
        assert!(summary.failures[0].reason.contains("img/mat_2.png"));
        assert_eq!(fs::read_dir(store.image_dir()).unwrap().count(), 2);
    }

    #[test]
    fn test_import_bad_wavelength_is_stored_as_null() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let manifest = format!(
            "{}\n2024-05-01 10:00:00,,150.7,n/a,img/ref_1.png,img/mat_1.png,main,Si,Johnson,\n",
            COLUMNS.join(",")
        );
        let archive = dir.path().join("in.zip");
        write_zip(&archive, Some(&manifest), &["img/ref_1.png", "img/mat_1.png"]);

        assert_eq!(import_from_archive(&store, &archive).counts(), (1, 0));
        let record = &store.query_all(&MeasurementFilter::default(), SortOrder::default())[0];
        assert_eq!(record.wavelength, None);
        assert_eq!(record.name, None);
        assert_eq!(record.note, None);
    }

    #[test]
    fn test_import_rejects_paths_outside_archive() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        fs::write(dir.path().join("outside.png"), b"secret").unwrap();
        let manifest = format!(
            "{}\n2024-05-01 10:00:00,,1.0,,../outside.png,img/mat_1.png,main,Si,Johnson,\n",
            COLUMNS.join(",")
        );
        let archive = dir.path().join("in.zip");
        write_zip(&archive, Some(&manifest), &["img/mat_1.png"]);

        assert_eq!(import_from_archive(&store, &archive).counts(), (0, 1));
    }

    #[cfg(unix)]
    #[test]
    fn test_import_rejects_symlinks_leaving_archive() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let outside = dir.path().join("secret.txt");
        fs::write(&outside, b"not part of the archive").unwrap();

        let manifest = format!(
            "{}\n2024-05-01 10:00:00,,1.0,,img/ref_1.png,img/mat_1.png,main,Si,Johnson,\n",
            COLUMNS.join(",")
        );
        let archive = dir.path().join("in.zip");
        let mut zip = ZipWriter::new(File::create(&archive).unwrap());
        let options = SimpleFileOptions::default();
        zip.start_file(MANIFEST_FILE, options).unwrap();
        zip.write_all(manifest.as_bytes()).unwrap();
        zip.add_symlink("img/ref_1.png", outside.to_string_lossy(), options)
            .unwrap();
        zip.start_file("img/mat_1.png", options).unwrap();
        zip.write_all(b"\x89PNG fake").unwrap();
        zip.finish().unwrap();

        let summary = import_from_archive(&store, &archive);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(total(&store), 0);
        assert_eq!(fs::read_dir(store.image_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_resolve_accepts_files_inside_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("img")).unwrap();
        fs::write(root.join("img").join("a.png"), b"png").unwrap();

        assert!(resolve_archive_file(&root, "img/a.png").is_ok());
        assert!(resolve_archive_file(&root, "./img/a.png").is_ok());
        assert!(resolve_archive_file(&root, "img").is_err());
        assert!(resolve_archive_file(&root, "").is_err());
        assert!(resolve_archive_file(&root, "img/../../a.png").is_err());
    }

    fn extraction_parent(dir: &TempDir) -> PathBuf {
        let parent = dir.path().join("tmp");
        fs::create_dir_all(&parent).unwrap();
        parent
    }

    #[test]
    fn test_extraction_removed_after_import() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let parent = extraction_parent(&dir);
        let manifest = format!("{}\n{}", COLUMNS.join(","), manifest_row(1, "150.7"));
        let archive = dir.path().join("in.zip");
        write_zip(&archive, Some(&manifest), &["img/ref_1.png", "img/mat_1.png"]);

        let summary = import_from_archive_in(&store, &archive, &parent);
        assert_eq!(summary.counts(), (1, 0));
        assert_eq!(fs::read_dir(&parent).unwrap().count(), 0);
    }

    #[test]
    fn test_extraction_removed_when_import_aborts() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let parent = extraction_parent(&dir);
        let archive = dir.path().join("in.zip");
        write_zip(&archive, Some("Date,Name\n2024-05-01 10:00:00,x\n"), &[]);

        let summary = import_from_archive_in(&store, &archive, &parent);
        assert_eq!(summary.counts(), (0, 0));
        assert_eq!(fs::read_dir(&parent).unwrap().count(), 0);

        let broken = dir.path().join("broken.zip");
        fs::write(&broken, b"not a zip").unwrap();
        assert_eq!(import_from_archive_in(&store, &broken, &parent).counts(), (0, 0));
        assert_eq!(fs::read_dir(&parent).unwrap().count(), 0);
    }

    #[test]
    fn test_header_order_does_not_matter() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let manifest = "Note,Page,Book,Shelf,MatImage,RefImage,Wavelength,Layer,Name,Date\n\
                        hello,Johnson,Si,main,img/mat_1.png,img/ref_1.png,,42.0,Reordered,2024-05-01 10:00:00\n";
        let archive = dir.path().join("in.zip");
        write_zip(&archive, Some(manifest), &["img/ref_1.png", "img/mat_1.png"]);

        assert_eq!(import_from_archive(&store, &archive).counts(), (1, 0));
        let record = &store.query_all(&MeasurementFilter::default(), SortOrder::default())[0];
        assert_eq!(record.thickness, 42.0);
        assert_eq!(record.name.as_deref(), Some("Reordered"));
        assert_eq!(record.note.as_deref(), Some("hello"));
    }

    #[test]
    fn test_export_then_import_duplicates_records() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let capture = dir.path().join("capture.png");
        fs::write(&capture, b"\x89PNG fake").unwrap();
        for layer in [100.0, 200.0] {
            let ref_image = store.copy_image_in(&capture, ImageRole::Reference).unwrap();
            let mat_image = store.copy_image_in(&capture, ImageRole::Material).unwrap();
            store
                .save(
                    &NewMeasurement::new(layer, ref_image, mat_image, "main", "Si", "Johnson")
                        .with_name("wafer"),
                )
                .unwrap();
        }

        let archive = export_to_archive(&store, &MeasurementFilter::default(), dir.path())
            .unwrap()
            .unwrap();
        assert_eq!(import_from_archive(&store, &archive).counts(), (2, 0));
        assert_eq!(import_from_archive(&store, &archive).counts(), (2, 0));
        assert_eq!(total(&store), 6);

        let mut names: Vec<String> = store
            .query_all(&MeasurementFilter::default(), SortOrder::default())
            .into_iter()
            .map(|r| r.ref_image)
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 6);
    }
}
