//! Listing table persistence (snapshot load + transactional apply) and raw batch archive.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use thiserror::Error;
use ths_core::{
    attribute_columns, Cell, ChangeSet, ColumnClass, CompositeKey, Delta, ListingRow, Snapshot,
    StoredRow, ACTIVE_COLUMN, ASSIGNMENT_ID_COLUMN, DATE_SCRAPED_COLUMN, ENTITY_ID_COLUMN,
    LISTING_COLUMNS,
};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ths-storage";

/// Keys per deactivation statement (two binds each).
const DEACTIVATE_CHUNK: usize = 100;
/// Rows per multi-row insert; keeps binds well under SQLite's variable limit.
const INSERT_CHUNK: usize = 30;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid table name '{0}': use letters, digits and underscores, not starting with a digit")]
pub struct InvalidTableName(pub String);

/// A validated SQL identifier for the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidTableName> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if !valid_start
            || name.len() > 63
            || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(InvalidTableName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl FromStr for TableName {
    type Err = InvalidTableName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("reading snapshot of {table}: {source}")]
    Query { table: String, source: sqlx::Error },
    #[error("decoding snapshot row of {table}: {reason}")]
    Decode { table: String, reason: String },
    #[error("snapshot read of {table} timed out after {timeout:?}")]
    Timeout { table: String, timeout: Duration },
}

/// Failure of one apply step. The transaction has been rolled back when this is returned.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("opening transaction on {table}: {source}")]
    Begin { table: String, source: sqlx::Error },
    #[error("creating table {table}: {source}")]
    CreateTable { table: String, source: sqlx::Error },
    #[error("deactivating {keys} keys in {table}: {source}")]
    Deactivate {
        table: String,
        keys: usize,
        source: sqlx::Error,
    },
    #[error("inserting {rows} rows into {table}: {source}")]
    Insert {
        table: String,
        rows: usize,
        source: sqlx::Error,
    },
    #[error("committing batch on {table}: {source}")]
    Commit { table: String, source: sqlx::Error },
    #[error("apply on {table} timed out after {timeout:?}")]
    Timeout { table: String, timeout: Duration },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub created_table: bool,
    pub deactivated: u64,
    pub inserted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStatus {
    pub total: i64,
    pub active: i64,
    pub inactive: i64,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub timeout: Duration,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://ths.db".to_string(),
            timeout: Duration::from_secs(30),
            max_connections: 4,
        }
    }
}

/// One listing table with soft-delete row versions.
#[derive(Debug, Clone)]
pub struct ListingStore {
    pool: SqlitePool,
    table: TableName,
    timeout: Duration,
}

impl ListingStore {
    pub async fn connect(config: &StoreConfig, table: TableName) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .with_context(|| format!("parsing database url {}", config.database_url))?
            .create_if_missing(true)
            .busy_timeout(config.timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.timeout)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        Ok(Self::from_pool(pool, table, config.timeout))
    }

    pub fn from_pool(pool: SqlitePool, table: TableName, timeout: Duration) -> Self {
        Self {
            pool,
            table,
            timeout,
        }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn table_exists(&self) -> Result<bool, sqlx::Error> {
        let found: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(self.table.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    /// Load every row version (active and inactive), or `Snapshot::Absent`.
    pub async fn load_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        match tokio::time::timeout(self.timeout, self.read_snapshot()).await {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::Timeout {
                table: self.table.as_str().to_string(),
                timeout: self.timeout,
            }),
        }
    }

    async fn read_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        let query_err = |source: sqlx::Error| SnapshotError::Query {
            table: self.table.as_str().to_string(),
            source,
        };

        if !self.table_exists().await.map_err(query_err)? {
            return Ok(Snapshot::Absent);
        }

        let sql = format!(
            "SELECT CAST({e} AS TEXT) AS {e}, CAST({a} AS TEXT) AS {a}, {attrs}, {ds}, {act} FROM {t} ORDER BY rowid",
            e = ENTITY_ID_COLUMN,
            a = ASSIGNMENT_ID_COLUMN,
            attrs = attribute_column_list(),
            ds = DATE_SCRAPED_COLUMN,
            act = ACTIVE_COLUMN,
            t = self.table.quoted(),
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err)?;

        let stored = rows
            .iter()
            .map(decode_stored_row)
            .collect::<Result<Vec<_>, String>>()
            .map_err(|reason| SnapshotError::Decode {
                table: self.table.as_str().to_string(),
                reason,
            })?;
        debug!(table = self.table.as_str(), rows = stored.len(), "loaded snapshot");
        Ok(Snapshot::Present(stored))
    }

    /// Apply a change set inside a single transaction. Nothing is visible unless every step succeeds.
    pub async fn apply(&self, change_set: &ChangeSet) -> Result<ApplyReport, ApplyError> {
        if change_set.is_noop() {
            return Ok(ApplyReport::default());
        }
        match tokio::time::timeout(self.timeout, self.apply_in_transaction(change_set)).await {
            Ok(result) => result,
            Err(_) => Err(ApplyError::Timeout {
                table: self.table.as_str().to_string(),
                timeout: self.timeout,
            }),
        }
    }

    async fn apply_in_transaction(&self, change_set: &ChangeSet) -> Result<ApplyReport, ApplyError> {
        let table = self.table.as_str().to_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| ApplyError::Begin {
                table: table.clone(),
                source,
            })?;

        // An early return drops `tx`, which rolls the transaction back.
        let report = match change_set {
            ChangeSet::Bootstrap { rows } => {
                self.create_table(&mut tx).await?;
                let inserted = self.insert_rows(&mut tx, rows.iter()).await?;
                ApplyReport {
                    created_table: true,
                    deactivated: 0,
                    inserted,
                }
            }
            ChangeSet::Delta(delta) => self.apply_delta(&mut tx, delta).await?,
        };

        tx.commit()
            .await
            .map_err(|source| ApplyError::Commit { table, source })?;
        info!(
            table = self.table.as_str(),
            created_table = report.created_table,
            deactivated = report.deactivated,
            inserted = report.inserted,
            "batch committed"
        );
        Ok(report)
    }

    async fn apply_delta(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        delta: &Delta,
    ) -> Result<ApplyReport, ApplyError> {
        let deactivated = self.deactivate_keys(tx, &delta.deactivations()).await?;
        let inserted = self.insert_rows(tx, delta.insertions().into_iter()).await?;
        Ok(ApplyReport {
            created_table: false,
            deactivated,
            inserted,
        })
    }

    async fn create_table(&self, tx: &mut Transaction<'static, Sqlite>) -> Result<(), ApplyError> {
        let table = self.table.as_str();
        for statement in create_table_statements(&self.table) {
            sqlx::query(&statement)
                .execute(&mut **tx)
                .await
                .map_err(|source| ApplyError::CreateTable {
                    table: table.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    async fn deactivate_keys(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        keys: &[CompositeKey],
    ) -> Result<u64, ApplyError> {
        let mut affected = 0;
        for chunk in keys.chunks(DEACTIVATE_CHUNK) {
            let mut qb = deactivation_query(&self.table, chunk);
            let result = qb
                .build()
                .execute(&mut **tx)
                .await
                .map_err(|source| ApplyError::Deactivate {
                    table: self.table.as_str().to_string(),
                    keys: keys.len(),
                    source,
                })?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }

    async fn insert_rows<'r>(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        rows: impl Iterator<Item = &'r ListingRow>,
    ) -> Result<u64, ApplyError> {
        let rows = rows.collect::<Vec<_>>();
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO {} ({}) ",
                self.table.quoted(),
                insert_column_list()
            ));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.key.entity_id).push_bind(row.key.assignment_id);
                for cell in &row.cells {
                    match cell {
                        Cell::Text(text) => b.push_bind(text.clone()),
                        Cell::Integer(value) => b.push_bind(*value),
                        Cell::Timestamp(ts) => b.push_bind(*ts),
                    };
                }
                b.push_bind(row.date_scraped).push_bind(1_i64);
            });

            let result = qb
                .build()
                .execute(&mut **tx)
                .await
                .map_err(|source| ApplyError::Insert {
                    table: self.table.as_str().to_string(),
                    rows: rows.len(),
                    source,
                })?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    /// Row counts for the table, or `None` when it does not exist.
    pub async fn status(&self) -> Result<Option<TableStatus>, SnapshotError> {
        let query_err = |source: sqlx::Error| SnapshotError::Query {
            table: self.table.as_str().to_string(),
            source,
        };
        if !self.table_exists().await.map_err(query_err)? {
            return Ok(None);
        }
        let (total, active): (i64, i64) = sqlx::query_as(&format!(
            "SELECT COUNT(*), COALESCE(SUM({ACTIVE_COLUMN}), 0) FROM {}",
            self.table.quoted()
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(Some(TableStatus {
            total,
            active,
            inactive: total - active,
        }))
    }
}

/// Switch off the active version of each key. Keys compare as canonical text, matching the
/// expression index created with the table.
fn deactivation_query<'a>(table: &TableName, keys: &[CompositeKey]) -> QueryBuilder<'a, Sqlite> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "UPDATE {} SET {act} = 0 WHERE {act} = 1 AND (",
        table.quoted(),
        act = ACTIVE_COLUMN,
    ));
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        let (entity_id, assignment_id) = key.canonical_parts();
        qb.push(format!("(CAST({ENTITY_ID_COLUMN} AS TEXT) = "))
            .push_bind(entity_id)
            .push(format!(" AND CAST({ASSIGNMENT_ID_COLUMN} AS TEXT) = "))
            .push_bind(assignment_id)
            .push(")");
    }
    qb.push(")");
    qb
}

fn attribute_column_list() -> String {
    attribute_columns()
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_column_list() -> String {
    LISTING_COLUMNS
        .iter()
        .map(|c| c.name)
        .chain([DATE_SCRAPED_COLUMN, ACTIVE_COLUMN])
        .collect::<Vec<_>>()
        .join(", ")
}

/// DDL for a fresh listing table: declared columns, derived columns, key indexes.
pub fn create_table_statements(table: &TableName) -> Vec<String> {
    let mut columns = LISTING_COLUMNS
        .iter()
        .map(|c| {
            let constraint = match c.class {
                ColumnClass::Timestamp => "",
                ColumnClass::ShortText { .. } | ColumnClass::LongText => " NOT NULL DEFAULT ''",
                _ => " NOT NULL DEFAULT 0",
            };
            format!("    {} {}{}", c.name, c.class.sql_type(), constraint)
        })
        .collect::<Vec<_>>();
    columns.push(format!("    {DATE_SCRAPED_COLUMN} DATETIME NOT NULL"));
    columns.push(format!(
        "    {ACTIVE_COLUMN} INTEGER NOT NULL DEFAULT 1 CHECK ({ACTIVE_COLUMN} IN (0, 1))"
    ));

    vec![
        format!("CREATE TABLE {} (\n{}\n)", table.quoted(), columns.join(",\n")),
        format!(
            "CREATE UNIQUE INDEX \"{name}_one_active_per_key\" ON {t} ({ENTITY_ID_COLUMN}, {ASSIGNMENT_ID_COLUMN}) WHERE {ACTIVE_COLUMN} = 1",
            name = table.as_str(),
            t = table.quoted(),
        ),
        format!(
            "CREATE INDEX \"{name}_key\" ON {t} (CAST({ENTITY_ID_COLUMN} AS TEXT), CAST({ASSIGNMENT_ID_COLUMN} AS TEXT))",
            name = table.as_str(),
            t = table.quoted(),
        ),
    ]
}

fn decode_stored_row(row: &SqliteRow) -> Result<StoredRow, String> {
    let key = CompositeKey::new(
        decode_key(row, ENTITY_ID_COLUMN)?,
        decode_key(row, ASSIGNMENT_ID_COLUMN)?,
    );

    let mut cells = Vec::with_capacity(attribute_columns().len());
    for def in attribute_columns() {
        let cell = match def.class {
            ColumnClass::ShortText { .. } | ColumnClass::LongText => Cell::Text(
                row.try_get::<Option<String>, _>(def.name)
                    .map_err(|e| format!("{key} column {}: {e}", def.name))?
                    .unwrap_or_default(),
            ),
            ColumnClass::Key | ColumnClass::Integer | ColumnClass::Flag => Cell::Integer(
                row.try_get::<Option<i64>, _>(def.name)
                    .map_err(|e| format!("{key} column {}: {e}", def.name))?
                    .unwrap_or_default(),
            ),
            ColumnClass::Timestamp => Cell::Timestamp(
                row.try_get::<Option<DateTime<Utc>>, _>(def.name)
                    .map_err(|e| format!("{key} column {}: {e}", def.name))?,
            ),
        };
        cells.push(cell);
    }

    let date_scraped: DateTime<Utc> = row
        .try_get(DATE_SCRAPED_COLUMN)
        .map_err(|e| format!("{key} column {DATE_SCRAPED_COLUMN}: {e}"))?;
    let active: i64 = row
        .try_get(ACTIVE_COLUMN)
        .map_err(|e| format!("{key} column {ACTIVE_COLUMN}: {e}"))?;

    Ok(StoredRow {
        row: ListingRow {
            key,
            cells,
            date_scraped,
        },
        active: active == 1,
    })
}

fn decode_key(row: &SqliteRow, column: &str) -> Result<i64, String> {
    let text: Option<String> = row
        .try_get(column)
        .map_err(|e| format!("key column {column}: {e}"))?;
    let text = text.ok_or_else(|| format!("key column {column} is NULL"))?;
    text.trim()
        .parse::<i64>()
        .map_err(|_| format!("key column {column} is not an integer: '{text}'"))
}

#[derive(Debug, Clone)]
pub struct ArchivedBatch {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once archive of raw fetched batches.
#[derive(Debug, Clone)]
pub struct BatchArchive {
    root: PathBuf,
}

impl BatchArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn batch_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        table: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(table)
            .join(format!("{content_hash}.json"))
    }

    /// Write the batch once; an identical batch at the same path is reported as deduplicated.
    pub async fn store_batch(
        &self,
        fetched_at: DateTime<Utc>,
        table: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedBatch> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.batch_relative_path(fetched_at, table, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("archive path {} has no parent", absolute_path.display()))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedBatch {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}
