//! Core listing model and declared table schema for the THS reconciler.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ths-core";

pub const ENTITY_ID_COLUMN: &str = "id";
pub const ASSIGNMENT_ID_COLUMN: &str = "assignments_id";
pub const DATE_SCRAPED_COLUMN: &str = "date_scraped";
pub const ACTIVE_COLUMN: &str = "active";

/// Natural key of one (listing, assignment) pair across all of its row versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompositeKey {
    pub entity_id: i64,
    pub assignment_id: i64,
}

impl CompositeKey {
    pub fn new(entity_id: i64, assignment_id: i64) -> Self {
        Self {
            entity_id,
            assignment_id,
        }
    }

    /// Textual form of both key parts, as compared by the store.
    pub fn canonical_parts(&self) -> (String, String) {
        (self.entity_id.to_string(), self.assignment_id.to_string())
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_id, self.assignment_id)
    }
}

/// Coercion rule and storage type of a declared column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnClass {
    Key,
    ShortText { max_len: usize },
    LongText,
    Integer,
    Flag,
    Timestamp,
}

impl ColumnClass {
    pub fn sql_type(&self) -> String {
        match self {
            ColumnClass::Key | ColumnClass::Integer | ColumnClass::Flag => "INTEGER".to_string(),
            ColumnClass::ShortText { max_len } => format!("VARCHAR({max_len})"),
            ColumnClass::LongText => "TEXT".to_string(),
            ColumnClass::Timestamp => "DATETIME".to_string(),
        }
    }

    /// Value a missing source field is defaulted to.
    pub fn default_cell(&self) -> Cell {
        match self {
            ColumnClass::ShortText { .. } | ColumnClass::LongText => Cell::Text(String::new()),
            ColumnClass::Key | ColumnClass::Integer | ColumnClass::Flag => Cell::Integer(0),
            ColumnClass::Timestamp => Cell::Timestamp(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub class: ColumnClass,
}

const fn col(name: &'static str, class: ColumnClass) -> ColumnDef {
    ColumnDef { name, class }
}

const fn short(max_len: usize) -> ColumnClass {
    ColumnClass::ShortText { max_len }
}

/// Declared listing schema, in table column order. Key columns come first.
pub const LISTING_COLUMNS: [ColumnDef; 27] = [
    col(ENTITY_ID_COLUMN, ColumnClass::Key),
    col(ASSIGNMENT_ID_COLUMN, ColumnClass::Key),
    col("user_firstname", short(50)),
    col("published", ColumnClass::Timestamp),
    col("title", ColumnClass::LongText),
    col("assignments_durationindays", ColumnClass::Integer),
    col("assignments_startdate", ColumnClass::Timestamp),
    col("assignments_enddate", ColumnClass::Timestamp),
    col("assignments_isconfirmed", ColumnClass::Flag),
    col("assignments_isreviewing", ColumnClass::Flag),
    col("assignments_lastmodified", ColumnClass::Timestamp),
    col("assignments_numberofapplicants", ColumnClass::Integer),
    col("features", ColumnClass::LongText),
    col("hometype", short(50)),
    col("indexeddate", ColumnClass::Timestamp),
    col("introduction", ColumnClass::LongText),
    col("location_name", short(100)),
    col("pets_animal_name", short(500)),
    col("pets_breed", short(500)),
    col("pets_name", short(500)),
    col("responsibilities", ColumnClass::LongText),
    col("user_membershiptier", short(50)),
    col("amenities_bedtypes", short(100)),
    col("amenities_hasbikeaccess", ColumnClass::Flag),
    col("amenities_workspacetypes", short(100)),
    col("assignments_feedback_description", ColumnClass::LongText),
    col("carincluded", ColumnClass::Flag),
];

const KEY_COLUMN_COUNT: usize = 2;

/// Non-key columns, aligned with [`ListingRow::cells`].
pub fn attribute_columns() -> &'static [ColumnDef] {
    &LISTING_COLUMNS[KEY_COLUMN_COUNT..]
}

pub fn attribute_index(name: &str) -> Option<usize> {
    attribute_columns().iter().position(|c| c.name == name)
}

/// One typed value. Flags are stored as 0/1 integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cell {
    Text(String),
    Integer(i64),
    Timestamp(Option<DateTime<Utc>>),
}

impl Cell {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Cell::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Cell::Timestamp(v) => *v,
            _ => None,
        }
    }
}

/// A normalized listing row: key, attribute cells in schema order, scrape stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRow {
    pub key: CompositeKey,
    pub cells: Vec<Cell>,
    pub date_scraped: DateTime<Utc>,
}

impl ListingRow {
    /// Row with every attribute set to its class default.
    pub fn with_defaults(key: CompositeKey, date_scraped: DateTime<Utc>) -> Self {
        Self {
            key,
            cells: attribute_columns()
                .iter()
                .map(|c| c.class.default_cell())
                .collect(),
            date_scraped,
        }
    }

    pub fn cell(&self, column: &str) -> Option<&Cell> {
        attribute_index(column).and_then(|idx| self.cells.get(idx))
    }

    /// Replace one attribute; returns false for unknown columns.
    pub fn set(&mut self, column: &str, cell: Cell) -> bool {
        match attribute_index(column) {
            Some(idx) if idx < self.cells.len() => {
                self.cells[idx] = cell;
                true
            }
            _ => false,
        }
    }

    pub fn with_cell(mut self, column: &str, cell: Cell) -> Self {
        self.set(column, cell);
        self
    }

    /// Attribute columns whose values differ, skipping `ignore`.
    pub fn differing_columns(&self, other: &ListingRow, ignore: &[String]) -> Vec<&'static str> {
        attribute_columns()
            .iter()
            .zip(self.cells.iter().zip(other.cells.iter()))
            .filter(|(def, _)| !ignore.iter().any(|name| name == def.name))
            .filter(|(_, (a, b))| a != b)
            .map(|(def, _)| def.name)
            .collect()
    }
}

/// A persisted row version together with its soft-delete flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    pub row: ListingRow,
    pub active: bool,
}

/// Current contents of the target table, or the fact that it does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Absent,
    Present(Vec<StoredRow>),
}

/// Writes one batch needs, as decided by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSet {
    /// Table does not exist: create it and insert every row as active.
    Bootstrap { rows: Vec<ListingRow> },
    Delta(Delta),
}

impl ChangeSet {
    pub fn is_noop(&self) -> bool {
        match self {
            ChangeSet::Bootstrap { .. } => false,
            ChangeSet::Delta(delta) => delta.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub new: Vec<ListingRow>,
    pub changed: Vec<ListingRow>,
    pub removed: Vec<CompositeKey>,
    pub unchanged: usize,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Keys whose active version must be switched off: changed, then removed.
    pub fn deactivations(&self) -> Vec<CompositeKey> {
        self.changed
            .iter()
            .map(|row| row.key)
            .chain(self.removed.iter().copied())
            .collect()
    }

    /// Row versions to append as active: changed, then new.
    pub fn insertions(&self) -> Vec<&ListingRow> {
        self.changed.iter().chain(self.new.iter()).collect()
    }
}

/// What the normalizer does with a missing or non-numeric key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPolicy {
    #[default]
    Reject,
    Coerce,
}

impl FromStr for KeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(KeyPolicy::Reject),
            "coerce" => Ok(KeyPolicy::Coerce),
            other => Err(format!("unknown key policy '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).single().unwrap()
    }

    #[test]
    fn schema_starts_with_key_columns() {
        assert_eq!(LISTING_COLUMNS[0].name, ENTITY_ID_COLUMN);
        assert_eq!(LISTING_COLUMNS[1].name, ASSIGNMENT_ID_COLUMN);
        assert!(attribute_columns()
            .iter()
            .all(|c| c.class != ColumnClass::Key));
    }

    #[test]
    fn defaults_follow_column_class() {
        let row = ListingRow::with_defaults(CompositeKey::new(1, 10), stamp());
        assert_eq!(row.cell("title"), Some(&Cell::Text(String::new())));
        assert_eq!(row.cell("carincluded"), Some(&Cell::Integer(0)));
        assert_eq!(row.cell("published"), Some(&Cell::Timestamp(None)));
        assert_eq!(row.cell("date_scraped"), None);
    }

    #[test]
    fn differing_columns_honours_ignore_list() {
        let a = ListingRow::with_defaults(CompositeKey::new(1, 10), stamp())
            .with_cell("title", Cell::Text("Cat sit".into()))
            .with_cell("indexeddate", Cell::Timestamp(Some(stamp())));
        let b = a
            .clone()
            .with_cell("title", Cell::Text("Cat sit urgent".into()))
            .with_cell("indexeddate", Cell::Timestamp(None));

        assert_eq!(a.differing_columns(&b, &[]), vec!["title", "indexeddate"]);
        assert_eq!(
            a.differing_columns(&b, &["indexeddate".to_string()]),
            vec!["title"]
        );
    }

    #[test]
    fn key_policy_parses_case_insensitively() {
        assert_eq!("Coerce".parse::<KeyPolicy>(), Ok(KeyPolicy::Coerce));
        assert_eq!(" reject ".parse::<KeyPolicy>(), Ok(KeyPolicy::Reject));
        assert!("skip".parse::<KeyPolicy>().is_err());
    }

    #[test]
    fn delta_orders_writes() {
        let changed = ListingRow::with_defaults(CompositeKey::new(1, 10), stamp());
        let new = ListingRow::with_defaults(CompositeKey::new(2, 20), stamp());
        let delta = Delta {
            new: vec![new.clone()],
            changed: vec![changed.clone()],
            removed: vec![CompositeKey::new(3, 30)],
            unchanged: 4,
        };

        assert!(!delta.is_empty());
        assert_eq!(
            delta.deactivations(),
            vec![CompositeKey::new(1, 10), CompositeKey::new(3, 30)]
        );
        assert_eq!(delta.insertions(), vec![&changed, &new]);
        assert!(ChangeSet::Delta(Delta::default()).is_noop());
        assert!(!ChangeSet::Bootstrap { rows: vec![] }.is_noop());
    }

    #[test]
    fn key_displays_canonically() {
        let key = CompositeKey::new(42, 7);
        assert_eq!(key.to_string(), "42:7");
        assert_eq!(key.canonical_parts(), ("42".to_string(), "7".to_string()));
    }
}
