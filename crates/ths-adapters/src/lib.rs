//! Listing source contracts and the record normalizer.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::header::ACCEPT;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use ths_core::{
    attribute_columns, Cell, ColumnClass, CompositeKey, KeyPolicy, ListingRow,
    ASSIGNMENT_ID_COLUMN, ENTITY_ID_COLUMN,
};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ths-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Extraction collaborator: yields one batch of raw nested listing records.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_batch(&self) -> Result<Vec<JsonValue>, AdapterError>;
}

/// Reads a batch from a JSON array on disk.
#[derive(Debug, Clone)]
pub struct FileListingSource {
    path: PathBuf,
}

impl FileListingSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ListingSource for FileListingSource {
    fn source_id(&self) -> &str {
        "file"
    }

    async fn fetch_batch(&self) -> Result<Vec<JsonValue>, AdapterError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let value: JsonValue = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        into_records(value, &self.path.display().to_string())
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub url: String,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// Fetches a JSON array of listing details from an authenticated endpoint.
#[derive(Debug)]
pub struct HttpListingSource {
    client: reqwest::Client,
    url: String,
    credentials: Option<Credentials>,
}

impl HttpListingSource {
    pub fn new(config: HttpSourceConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            url: config.url,
            credentials: config.credentials,
        })
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    fn source_id(&self) -> &str {
        "http"
    }

    async fn fetch_batch(&self) -> Result<Vec<JsonValue>, AdapterError> {
        let mut request = self.client.get(&self.url).header(ACCEPT, "application/json");
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.email, Some(&credentials.password));
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let value: JsonValue = resp.json().await?;
        into_records(value, &self.url)
    }
}

fn into_records(value: JsonValue, origin: &str) -> Result<Vec<JsonValue>, AdapterError> {
    match value {
        JsonValue::Array(items) => Ok(items),
        other => Err(AdapterError::Message(format!(
            "{origin}: expected a JSON array of listings, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("record {index} is a {kind}, expected an object")]
    NotAnObject { index: usize, kind: &'static str },
    #[error("record {index}: sequence at '{path}' mixes objects and scalars")]
    MixedSequence { index: usize, path: String },
    #[error("record {index}: key column '{column}' is not numeric (got {raw})")]
    InvalidKey {
        index: usize,
        column: &'static str,
        raw: String,
    },
}

/// Flattens raw nested records into typed rows of the declared listing schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    key_policy: KeyPolicy,
}

impl Normalizer {
    pub fn new(key_policy: KeyPolicy) -> Self {
        Self { key_policy }
    }

    pub fn key_policy(&self) -> KeyPolicy {
        self.key_policy
    }

    /// Normalize a whole batch. Fails on the first bad record; never returns a partial batch.
    pub fn normalize(
        &self,
        records: &[JsonValue],
        date_scraped: DateTime<Utc>,
    ) -> Result<Vec<ListingRow>, NormalizeError> {
        records
            .iter()
            .enumerate()
            .map(|(index, record)| self.normalize_record(index, record, date_scraped))
            .collect()
    }

    pub fn normalize_record(
        &self,
        index: usize,
        record: &JsonValue,
        date_scraped: DateTime<Utc>,
    ) -> Result<ListingRow, NormalizeError> {
        let JsonValue::Object(map) = record else {
            return Err(NormalizeError::NotAnObject {
                index,
                kind: json_kind(record),
            });
        };

        let flat = flatten_record(map)
            .map_err(|path| NormalizeError::MixedSequence { index, path })?;

        let key = CompositeKey::new(
            self.key_value(index, ENTITY_ID_COLUMN, flat.get(ENTITY_ID_COLUMN))?,
            self.key_value(index, ASSIGNMENT_ID_COLUMN, flat.get(ASSIGNMENT_ID_COLUMN))?,
        );

        let cells = attribute_columns()
            .iter()
            .map(|def| coerce_cell(def.class, flat.get(def.name)))
            .collect();

        Ok(ListingRow {
            key,
            cells,
            date_scraped,
        })
    }

    fn key_value(
        &self,
        index: usize,
        column: &'static str,
        raw: Option<&JsonValue>,
    ) -> Result<i64, NormalizeError> {
        if let Some(value) = raw.and_then(key_integer) {
            return Ok(value);
        }

        let raw = raw.map(|v| v.to_string()).unwrap_or_else(|| "nothing".to_string());
        match self.key_policy {
            KeyPolicy::Reject => Err(NormalizeError::InvalidKey { index, column, raw }),
            KeyPolicy::Coerce => {
                warn!(index, column, %raw, "coercing unresolved key to 0");
                Ok(0)
            }
        }
    }
}

/// Flatten one record into lower-cased, underscore-joined paths.
///
/// Purely numeric path segments are dropped so indexed sub-records share one
/// namespace. On a mixed object/scalar sequence, returns the offending path.
pub fn flatten_record(record: &Map<String, JsonValue>) -> Result<BTreeMap<String, JsonValue>, String> {
    let mut out = BTreeMap::new();
    flatten_into(record, "", &mut out)?;
    Ok(out)
}

fn flatten_into(
    map: &Map<String, JsonValue>,
    prefix: &str,
    out: &mut BTreeMap<String, JsonValue>,
) -> Result<(), String> {
    for (key, value) in map {
        let path = join_path(prefix, key);
        match value {
            JsonValue::Object(child) => flatten_into(child, &path, out)?,
            JsonValue::Array(items) if matches!(items.first(), Some(JsonValue::Object(_))) => {
                for item in items {
                    let JsonValue::Object(child) = item else {
                        return Err(path);
                    };
                    flatten_into(child, &path, out)?;
                }
            }
            JsonValue::Array(items) => {
                out.insert(path, JsonValue::String(join_scalars(items)));
            }
            JsonValue::String(s) => {
                out.insert(path, JsonValue::String(strip_non_ascii(s)));
            }
            other => {
                out.insert(path, other.clone());
            }
        }
    }
    Ok(())
}

fn join_path(prefix: &str, key: &str) -> String {
    let joined = if prefix.is_empty() {
        key.to_lowercase()
    } else {
        format!("{prefix}_{key}").to_lowercase()
    };
    joined
        .split('_')
        .filter(|segment| segment.is_empty() || !segment.chars().all(|c| c.is_ascii_digit()))
        .collect::<Vec<_>>()
        .join("_")
}

fn join_scalars(items: &[JsonValue]) -> String {
    items
        .iter()
        .map(|item| match item {
            JsonValue::String(s) => strip_non_ascii(s),
            JsonValue::Null => String::new(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Drop every character outside 7-bit ASCII.
pub fn strip_non_ascii(input: &str) -> String {
    input.chars().filter(char::is_ascii).collect()
}

fn coerce_cell(class: ColumnClass, raw: Option<&JsonValue>) -> Cell {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return class.default_cell();
    };

    match class {
        ColumnClass::ShortText { max_len } => {
            let mut text = text_value(raw);
            if text.chars().count() > max_len {
                debug!(max_len, "truncating short text value");
                text = text.chars().take(max_len).collect();
            }
            Cell::Text(text)
        }
        ColumnClass::LongText => Cell::Text(text_value(raw)),
        ColumnClass::Key | ColumnClass::Integer => Cell::Integer(integral_value(raw).unwrap_or(0)),
        ColumnClass::Flag => Cell::Integer(i64::from(flag_value(raw))),
        ColumnClass::Timestamp => Cell::Timestamp(raw.as_str().and_then(parse_timestamp)),
    }
}

fn text_value(raw: &JsonValue) -> String {
    match raw {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn integral_value(raw: &JsonValue) -> Option<i64> {
    match raw {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral_f64)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral_f64))
        }
        JsonValue::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

/// Keys accept only JSON numbers and numeric strings; booleans and containers are not keys.
fn key_integer(raw: &JsonValue) -> Option<i64> {
    match raw {
        JsonValue::Number(_) | JsonValue::String(_) => integral_value(raw),
        _ => None,
    }
}

fn integral_f64(v: f64) -> Option<i64> {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

fn flag_value(raw: &JsonValue) -> bool {
    match raw {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        JsonValue::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

/// Parse the timestamp shapes the listing API emits; anything else is `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).single().unwrap()
    }

    fn listing() -> JsonValue {
        json!({
            "id": "1001",
            "title": "Cat sit in Fremont",
            "homeType": "apartment",
            "published": "2025-02-20T08:15:00Z",
            "user": {"firstName": "Dana", "membershipTier": "premium"},
            "location": {"name": "Seattle", "coordinates": {"lat": 47.6, "lon": -122.3}},
            "assignments": [
                {"id": "55", "startDate": "2025-04-01", "endDate": "2025-04-09", "durationInDays": 8,
                 "isConfirmed": false, "isReviewing": true, "numberOfApplicants": 3}
            ],
            "pets": [
                {"name": "Miso", "breed": "Tabby", "animal": {"name": "Cat"}},
                {"name": "Rex", "breed": "Beagle", "animal": {"name": "Dog"}}
            ],
            "amenities": {"bedTypes": ["double", "sofa bed"], "hasBikeAccess": true, "workspaceTypes": []},
            "carIncluded": false
        })
    }

    #[test]
    fn flattens_nested_maps_with_lowercased_paths() {
        let flat = flatten_record(listing().as_object().unwrap()).unwrap();
        assert_eq!(flat["user_firstname"], json!("Dana"));
        assert_eq!(flat["location_coordinates_lat"], json!(47.6));
        assert_eq!(flat["assignments_id"], json!("55"));
        assert_eq!(flat["amenities_bedtypes"], json!("double,sofa bed"));
        assert_eq!(flat["amenities_workspacetypes"], json!(""));
    }

    #[test]
    fn sequence_of_maps_is_last_writer_wins() {
        let flat = flatten_record(listing().as_object().unwrap()).unwrap();
        assert_eq!(flat["pets_name"], json!("Rex"));
        assert_eq!(flat["pets_animal_name"], json!("Dog"));
    }

    #[test]
    fn numeric_segments_are_stripped() {
        let record = json!({"id": 1, "assignments": {"0": {"id": 7}, "1": {"id": 9, "durationInDays": 4}}});
        let flat = flatten_record(record.as_object().unwrap()).unwrap();
        assert_eq!(flat["assignments_id"], json!(9));
        assert_eq!(flat["assignments_durationindays"], json!(4));
        assert!(!flat.keys().any(|k| k.contains("_0_") || k.contains("_1_")));
    }

    #[test]
    fn indexed_sub_records_resolve_in_document_order() {
        let assignments = (0..12)
            .map(|i| (i.to_string(), json!({"id": 100 + i})))
            .collect::<Map<String, JsonValue>>();
        let record = json!({"id": 1, "assignments": assignments});
        let flat = flatten_record(record.as_object().unwrap()).unwrap();
        assert_eq!(flat["assignments_id"], json!(111));

        let row = Normalizer::default()
            .normalize_record(0, &record, stamp())
            .unwrap();
        assert_eq!(row.key, CompositeKey::new(1, 111));
    }

    #[test]
    fn later_index_wins_even_when_it_sorts_first() {
        let record = json!({"id": 1, "assignments": {"9": {"id": 9}, "10": {"id": 10}}});
        let flat = flatten_record(record.as_object().unwrap()).unwrap();
        assert_eq!(flat["assignments_id"], json!(10));
    }

    #[test]
    fn mixed_sequences_are_structural_errors() {
        let record = json!({"id": 1, "pets": [{"name": "Miso"}, "stray"]});
        let err = Normalizer::default()
            .normalize(&[record], stamp())
            .unwrap_err();
        assert_eq!(
            err,
            NormalizeError::MixedSequence {
                index: 0,
                path: "pets".into()
            }
        );
    }

    #[test]
    fn normalizes_into_declared_schema() {
        let rows = Normalizer::default().normalize(&[listing()], stamp()).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];

        assert_eq!(row.key, CompositeKey::new(1001, 55));
        assert_eq!(row.cells.len(), attribute_columns().len());
        assert_eq!(row.date_scraped, stamp());
        assert_eq!(row.cell("hometype"), Some(&Cell::Text("apartment".into())));
        assert_eq!(row.cell("assignments_durationindays"), Some(&Cell::Integer(8)));
        assert_eq!(row.cell("assignments_isreviewing"), Some(&Cell::Integer(1)));
        assert_eq!(row.cell("assignments_isconfirmed"), Some(&Cell::Integer(0)));
        assert_eq!(row.cell("amenities_hasbikeaccess"), Some(&Cell::Integer(1)));
        assert_eq!(
            row.cell("assignments_startdate"),
            Some(&Cell::Timestamp(Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).single()))
        );
        assert_eq!(
            row.cell("published"),
            Some(&Cell::Timestamp(Utc.with_ymd_and_hms(2025, 2, 20, 8, 15, 0).single()))
        );
    }

    #[test]
    fn missing_values_take_class_defaults() {
        let record = json!({"id": 3, "assignments": [{"id": 4}], "title": null});
        let row = Normalizer::default()
            .normalize_record(0, &record, stamp())
            .unwrap();
        assert_eq!(row.cell("title"), Some(&Cell::Text(String::new())));
        assert_eq!(row.cell("features"), Some(&Cell::Text(String::new())));
        assert_eq!(row.cell("assignments_numberofapplicants"), Some(&Cell::Integer(0)));
        assert_eq!(row.cell("carincluded"), Some(&Cell::Integer(0)));
        assert_eq!(row.cell("indexeddate"), Some(&Cell::Timestamp(None)));
    }

    #[test]
    fn strips_characters_outside_ascii() {
        let record = json!({"id": 3, "assignments": [{"id": 4}], "title": "Cat sit \u{1F408} caf\u{e9}"});
        let row = Normalizer::default()
            .normalize_record(0, &record, stamp())
            .unwrap();
        assert_eq!(row.cell("title"), Some(&Cell::Text("Cat sit  caf".into())));
    }

    #[test]
    fn short_text_is_truncated_to_declared_length() {
        let long_name = "x".repeat(80);
        let record = json!({"id": 3, "assignments": [{"id": 4}], "user": {"firstName": long_name}});
        let row = Normalizer::default()
            .normalize_record(0, &record, stamp())
            .unwrap();
        assert_eq!(row.cell("user_firstname"), Some(&Cell::Text("x".repeat(50))));
    }

    #[test]
    fn unparseable_timestamps_become_null() {
        let record = json!({"id": 3, "assignments": [{"id": 4, "startDate": "soon"}], "indexedDate": 1700000000});
        let row = Normalizer::default()
            .normalize_record(0, &record, stamp())
            .unwrap();
        assert_eq!(row.cell("assignments_startdate"), Some(&Cell::Timestamp(None)));
        assert_eq!(row.cell("indexeddate"), Some(&Cell::Timestamp(None)));
    }

    #[test]
    fn timestamp_shapes_are_accepted() {
        let expected = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).single();
        assert_eq!(parse_timestamp("2025-01-02T03:04:05Z"), expected);
        assert_eq!(parse_timestamp("2025-01-02T03:04:05.000+0000"), expected);
        assert_eq!(parse_timestamp("2025-01-02T03:04:05"), expected);
        assert_eq!(parse_timestamp("2025-01-02 03:04:05"), expected);
        assert_eq!(
            parse_timestamp("2025-01-02"),
            Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).single()
        );
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn bad_key_is_rejected_by_default() {
        let record = json!({"id": "abc", "assignments": [{"id": 4}]});
        let err = Normalizer::default()
            .normalize(&[listing(), record], stamp())
            .unwrap_err();
        assert_eq!(
            err,
            NormalizeError::InvalidKey {
                index: 1,
                column: ENTITY_ID_COLUMN,
                raw: "\"abc\"".into()
            }
        );
    }

    #[test]
    fn non_numeric_key_shapes_are_rejected() {
        let shapes = [json!(true), json!(false), json!({"value": 7}), json!([7]), json!("")];
        for shape in shapes {
            let record = json!({"id": shape.clone(), "assignments": [{"id": 4}]});
            let err = Normalizer::new(KeyPolicy::Reject)
                .normalize_record(0, &record, stamp())
                .unwrap_err();
            assert!(
                matches!(err, NormalizeError::InvalidKey { column: ENTITY_ID_COLUMN, .. }),
                "{shape} should not resolve to a key"
            );
        }
    }

    #[test]
    fn boolean_counters_still_coerce() {
        let record = json!({"id": 3, "assignments": [{"id": 4, "numberOfApplicants": true}]});
        let row = Normalizer::default()
            .normalize_record(0, &record, stamp())
            .unwrap();
        assert_eq!(row.cell("assignments_numberofapplicants"), Some(&Cell::Integer(1)));
    }

    #[test]
    fn missing_assignment_key_is_rejected() {
        let record = json!({"id": 12, "error": "timeout"});
        let err = Normalizer::new(KeyPolicy::Reject)
            .normalize_record(0, &record, stamp())
            .unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::InvalidKey { column: ASSIGNMENT_ID_COLUMN, .. }
        ));
    }

    #[test]
    fn bad_key_is_coerced_when_configured() {
        let record = json!({"id": "abc", "assignments": [{"id": "4.0"}]});
        let row = Normalizer::new(KeyPolicy::Coerce)
            .normalize_record(0, &record, stamp())
            .unwrap();
        assert_eq!(row.key, CompositeKey::new(0, 4));
    }

    #[test]
    fn non_object_element_fails_the_batch() {
        let err = Normalizer::default()
            .normalize(&[listing(), json!([1, 2])], stamp())
            .unwrap_err();
        assert_eq!(err, NormalizeError::NotAnObject { index: 1, kind: "array" });
    }

    #[tokio::test]
    async fn file_source_reads_json_array() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("batch.json");
        std::fs::write(&path, serde_json::to_vec(&json!([listing()])).unwrap()).unwrap();

        let records = FileListingSource::new(&path).fetch_batch().await.expect("fetch");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["id"], json!("1001"));
    }

    #[tokio::test]
    async fn file_source_rejects_non_array_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("batch.json");
        std::fs::write(&path, br#"{"results": []}"#).unwrap();

        let err = FileListingSource::new(&path).fetch_batch().await.unwrap_err();
        assert!(err.to_string().contains("expected a JSON array"));
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials {
            email: "sitter@example.com".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("sitter@example.com"));
        assert!(!rendered.contains("hunter2"));
    }
}
