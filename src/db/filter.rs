//! Filter, sort and pagination inputs for measurement queries.
//!
//! Column names reach SQL only through [`Column::sql_name`]; every caller
//! supplied value is bound as a parameter.

use chrono::NaiveDate;
use rusqlite::types::Value;

/// Columns exposed for sorting, filtering and distinct-value lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Id,
    Date,
    Name,
    Layer,
    Wavelength,
    Shelf,
    Book,
    Page,
    Note,
}

impl Column {
    pub const ALL: [Column; 9] = [
        Column::Id,
        Column::Date,
        Column::Name,
        Column::Layer,
        Column::Wavelength,
        Column::Shelf,
        Column::Book,
        Column::Page,
        Column::Note,
    ];

    pub fn sql_name(&self) -> &'static str {
        match self {
            Column::Id => "id",
            Column::Date => "Date",
            Column::Name => "Name",
            Column::Layer => "Layer",
            Column::Wavelength => "Wavelength",
            Column::Shelf => "Shelf",
            Column::Book => "Book",
            Column::Page => "Page",
            Column::Note => "Note",
        }
    }

    /// Case-insensitive lookup; `None` for anything outside the whitelist.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.sql_name().eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("asc") {
            SortDirection::Asc
        } else {
            SortDirection::Desc
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// Primary sort key. `id DESC` is always appended as a tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortOrder {
    pub column: Column,
    pub direction: SortDirection,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self {
            column: Column::Date,
            direction: SortDirection::Desc,
        }
    }
}

impl SortOrder {
    pub fn new(column: Column, direction: SortDirection) -> Self {
        Self { column, direction }
    }

    /// Build from caller strings. An unknown column falls back to the default
    /// order entirely.
    pub fn parse(order_by: &str, order_dir: &str) -> Self {
        match Column::from_name(order_by) {
            Some(column) => Self::new(column, SortDirection::parse(order_dir)),
            None => {
                tracing::debug!(order_by, "Unknown sort column, using default order");
                Self::default()
            }
        }
    }

    pub(crate) fn order_by_clause(&self) -> String {
        match self.column {
            Column::Id => format!("ORDER BY id {}", self.direction.sql()),
            column => format!(
                "ORDER BY {} {}, id DESC",
                column.sql_name(),
                self.direction.sql()
            ),
        }
    }
}

/// Conjunctive filter over measurements. `None` and blank strings are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasurementFilter {
    /// Case-insensitive substring of `Name`
    pub name: Option<String>,
    /// Case-insensitive substring of `Note`
    pub note: Option<String>,
    pub shelf: Option<String>,
    pub book: Option<String>,
    pub page: Option<String>,
    /// Inclusive, compared by calendar day
    pub start_date: Option<NaiveDate>,
    /// Inclusive, compared by calendar day
    pub end_date: Option<NaiveDate>,
}

/// A rendered WHERE clause and its positional parameters.
#[derive(Debug, Default)]
pub(crate) struct WhereClause {
    pub sql: String,
    pub params: Vec<Value>,
}

impl MeasurementFilter {
    pub fn is_empty(&self) -> bool {
        self.where_clause().params.is_empty()
    }

    pub(crate) fn where_clause(&self) -> WhereClause {
        let mut conditions: Vec<&'static str> = Vec::new();
        let mut params = Vec::new();

        if let Some(name) = non_blank(&self.name) {
            conditions.push(r"Name LIKE ? ESCAPE '\'");
            params.push(Value::Text(like_pattern(name)));
        }
        if let Some(note) = non_blank(&self.note) {
            conditions.push(r"Note LIKE ? ESCAPE '\'");
            params.push(Value::Text(like_pattern(note)));
        }
        if let Some(shelf) = non_blank(&self.shelf) {
            conditions.push("Shelf = ?");
            params.push(Value::Text(shelf.to_string()));
        }
        if let Some(book) = non_blank(&self.book) {
            conditions.push("Book = ?");
            params.push(Value::Text(book.to_string()));
        }
        if let Some(page) = non_blank(&self.page) {
            conditions.push("Page = ?");
            params.push(Value::Text(page.to_string()));
        }
        if let Some(start) = self.start_date {
            conditions.push("date(Date) >= ?");
            params.push(Value::Text(start.format("%Y-%m-%d").to_string()));
        }
        if let Some(end) = self.end_date {
            conditions.push("date(Date) <= ?");
            params.push(Value::Text(end.format("%Y-%m-%d").to_string()));
        }

        let sql = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        WhereClause { sql, params }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Wrap a search term for `LIKE`, escaping its own wildcards.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}
