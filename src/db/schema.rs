pub const TABLE: &str = "measurements";

/// Base table as first shipped. Later columns arrive through [`MIGRATIONS`].
const CREATE_MEASUREMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS measurements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    Date TIMESTAMP DEFAULT (DATETIME('now', 'localtime')),
    Name TEXT,
    Layer REAL NOT NULL,
    RefImage TEXT NOT NULL,
    MatImage TEXT NOT NULL,
    Shelf TEXT NOT NULL,
    Book TEXT NOT NULL,
    Page TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_measurements_date ON measurements(Date);
"#;

/// One schema step. Steps only ever create tables/indexes or add nullable
/// columns.
#[derive(Debug, Clone, Copy)]
pub enum Migration {
    Batch(&'static str),
    AddColumn {
        column: &'static str,
        definition: &'static str,
    },
}

/// Applied in order; step `n` (1-based) brings `PRAGMA user_version` to `n`.
pub const MIGRATIONS: &[Migration] = &[
    Migration::Batch(CREATE_MEASUREMENTS),
    Migration::AddColumn {
        column: "Wavelength",
        definition: "REAL",
    },
    Migration::AddColumn {
        column: "Note",
        definition: "TEXT",
    },
];

pub fn latest_version() -> i64 {
    MIGRATIONS.len() as i64
}

/// Columns every row is read with, in `MeasurementRecord` field order.
pub const SELECT_COLUMNS: &str =
    "id, Date, Name, Layer, Wavelength, RefImage, MatImage, Shelf, Book, Page, Note";
