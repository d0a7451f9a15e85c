//! Reconciliation pipeline: normalize → snapshot → reconcile → apply, plus the hourly scheduler.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use ths_adapters::{
    AdapterError, Credentials, FileListingSource, HttpListingSource, HttpSourceConfig,
    ListingSource, NormalizeError, Normalizer,
};
use ths_core::{ChangeSet, CompositeKey, Delta, KeyPolicy, ListingRow, Snapshot};
use ths_storage::{
    ApplyError, ApplyReport, BatchArchive, ListingStore, SnapshotError, StoreConfig, TableName,
};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ths-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    File,
    Http,
}

impl FromStr for SourceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(SourceMode::File),
            "http" => Ok(SourceMode::Http),
            other => Err(format!("unknown source mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub table: String,
    pub source_mode: SourceMode,
    pub source_path: PathBuf,
    pub source_url: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub key_policy: KeyPolicy,
    pub compare_ignore: Vec<String>,
    pub store_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub sync_cron: String,
    pub archive_dir: Option<PathBuf>,
    pub user_agent: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://ths.db".to_string(),
            table: "seattle".to_string(),
            source_mode: SourceMode::File,
            source_path: PathBuf::from("./fixtures/listings_sample.json"),
            source_url: None,
            email: None,
            password: None,
            key_policy: KeyPolicy::Reject,
            compare_ignore: Vec::new(),
            store_timeout_secs: 30,
            http_timeout_secs: 60,
            sync_cron: "0 0 * * * *".to_string(),
            archive_dir: None,
            user_agent: "ths-reconciler/0.1".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            table: std::env::var("THS_TABLE").unwrap_or(defaults.table),
            source_mode: env_parsed("THS_SOURCE_MODE", defaults.source_mode),
            source_path: std::env::var("THS_SOURCE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.source_path),
            source_url: std::env::var("THS_SOURCE_URL").ok(),
            email: std::env::var("THS_EMAIL").ok(),
            password: std::env::var("THS_PASSWORD").ok(),
            key_policy: env_parsed("THS_KEY_POLICY", defaults.key_policy),
            compare_ignore: std::env::var("THS_COMPARE_IGNORE")
                .map(|v| parse_column_list(&v))
                .unwrap_or(defaults.compare_ignore),
            store_timeout_secs: env_parsed("THS_STORE_TIMEOUT_SECS", defaults.store_timeout_secs),
            http_timeout_secs: env_parsed("THS_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            sync_cron: std::env::var("THS_SYNC_CRON").unwrap_or(defaults.sync_cron),
            archive_dir: std::env::var("THS_ARCHIVE_DIR").ok().map(PathBuf::from),
            user_agent: std::env::var("THS_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            database_url: self.database_url.clone(),
            timeout: Duration::from_secs(self.store_timeout_secs),
            ..StoreConfig::default()
        }
    }

    pub fn table_name(&self) -> Result<TableName> {
        TableName::new(self.table.clone()).context("THS_TABLE")
    }

    pub fn build_source(&self) -> Result<Box<dyn ListingSource>> {
        match self.source_mode {
            SourceMode::File => Ok(Box::new(FileListingSource::new(self.source_path.clone()))),
            SourceMode::Http => {
                let url = self
                    .source_url
                    .clone()
                    .context("THS_SOURCE_URL is required when THS_SOURCE_MODE=http")?;
                let credentials = match (&self.email, &self.password) {
                    (Some(email), Some(password)) => Some(Credentials {
                        email: email.clone(),
                        password: password.clone(),
                    }),
                    _ => None,
                };
                let source = HttpListingSource::new(HttpSourceConfig {
                    url,
                    credentials,
                    timeout: Duration::from_secs(self.http_timeout_secs),
                    user_agent: Some(self.user_agent.clone()),
                })?;
                Ok(Box::new(source))
            }
        }
    }
}

fn env_parsed<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => parse_or_default(name, &raw, default),
        Err(_) => default,
    }
}

/// A setting that is present but unparseable falls back to the default, loudly.
fn parse_or_default<T>(name: &str, raw: &str, default: T) -> T
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw.trim().parse() {
        Ok(value) => value,
        Err(err) => {
            warn!(variable = name, value = raw, error = %err, "ignoring unparseable setting; using default");
            default
        }
    }
}

fn parse_column_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Outcome of diffing one normalized batch against the table snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub change_set: ChangeSet,
    pub duplicate_keys: usize,
}

/// Three-way partition of a batch into new / changed / removed keys.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    compare_ignore: Vec<String>,
}

impl Reconciler {
    pub fn new(compare_ignore: Vec<String>) -> Self {
        Self { compare_ignore }
    }

    pub fn reconcile(&self, batch: Vec<ListingRow>, snapshot: Snapshot) -> Reconciliation {
        let (incoming, duplicate_keys) = collapse_duplicate_keys(batch);

        let stored = match snapshot {
            Snapshot::Absent => {
                return Reconciliation {
                    change_set: ChangeSet::Bootstrap { rows: incoming },
                    duplicate_keys,
                }
            }
            Snapshot::Present(stored) => stored,
        };

        // Inactive history never participates in the comparison.
        let mut active: BTreeMap<CompositeKey, Vec<ListingRow>> = BTreeMap::new();
        for version in stored.into_iter().filter(|v| v.active) {
            active.entry(version.row.key).or_default().push(version.row);
        }

        let mut delta = Delta::default();
        for row in &incoming {
            match active.get(&row.key).map(Vec::as_slice) {
                None | Some([]) => delta.new.push(row.clone()),
                Some([current]) => {
                    let differing = current.differing_columns(row, &self.compare_ignore);
                    if differing.is_empty() {
                        delta.unchanged += 1;
                    } else {
                        debug!(key = %row.key, columns = ?differing, "row changed");
                        delta.changed.push(row.clone());
                    }
                }
                Some(versions) => {
                    warn!(
                        key = %row.key,
                        active_versions = versions.len(),
                        "key has several active versions; replacing them"
                    );
                    delta.changed.push(row.clone());
                }
            }
        }

        let incoming_keys = incoming.iter().map(|r| r.key).collect::<HashSet<_>>();
        delta.removed = active
            .keys()
            .filter(|key| !incoming_keys.contains(key))
            .copied()
            .collect();

        Reconciliation {
            change_set: ChangeSet::Delta(delta),
            duplicate_keys,
        }
    }
}

/// Keep one row per key (the last occurrence) in first-seen order.
fn collapse_duplicate_keys(batch: Vec<ListingRow>) -> (Vec<ListingRow>, usize) {
    let mut position: HashMap<CompositeKey, usize> = HashMap::with_capacity(batch.len());
    let mut rows: Vec<ListingRow> = Vec::with_capacity(batch.len());
    let mut duplicates = 0;
    for row in batch {
        match position.get(&row.key) {
            Some(&idx) => {
                warn!(key = %row.key, "duplicate key in batch; keeping last occurrence");
                rows[idx] = row;
                duplicates += 1;
            }
            None => {
                position.insert(row.key, rows.len());
                rows.push(row);
            }
        }
    }
    (rows, duplicates)
}

/// Why one reconciliation cycle failed. The table is untouched in every case.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("extracting listings: {0}")]
    Extract(#[from] AdapterError),
    #[error("normalizing batch: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("loading snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("applying changes: {0}")]
    Apply(#[from] ApplyError),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Bootstrap {
        inserted: u64,
    },
    Delta {
        new: usize,
        changed: usize,
        removed: usize,
        unchanged: usize,
        deactivated: u64,
        inserted: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub table: String,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_records: usize,
    pub normalized_rows: usize,
    pub duplicate_keys: usize,
    pub outcome: RunOutcome,
    pub archived_batch: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn ListingSource>,
    store: ListingStore,
    normalizer: Normalizer,
    reconciler: Reconciler,
    archive: Option<BatchArchive>,
    run_guard: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, source: Box<dyn ListingSource>, store: ListingStore) -> Self {
        Self {
            normalizer: Normalizer::new(config.key_policy),
            reconciler: Reconciler::new(config.compare_ignore.clone()),
            archive: config.archive_dir.clone().map(BatchArchive::new),
            config,
            source,
            store,
            run_guard: Mutex::new(()),
        }
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let table = config.table_name()?;
        let store = ListingStore::connect(&config.store_config(), table).await?;
        let source = config.build_source()?;
        Ok(Self::new(config, source, store))
    }

    pub fn store(&self) -> &ListingStore {
        &self.store
    }

    /// Run one full reconciliation cycle. Either the whole change set commits or nothing does.
    pub async fn run_once(&self) -> Result<SyncRunSummary, BatchError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id, table = self.store.table().as_str());
        self.run_cycle(run_id).instrument(span).await
    }

    async fn run_cycle(&self, run_id: Uuid) -> Result<SyncRunSummary, BatchError> {
        let started_at = Utc::now();

        let records = self.source.fetch_batch().await?;
        info!(source = self.source.source_id(), records = records.len(), "fetched batch");

        let archived_batch = self.archive_raw_batch(started_at, &records).await;

        let rows = self.normalizer.normalize(&records, started_at)?;
        let normalized_rows = rows.len();

        let snapshot = self.store.load_snapshot().await?;
        let Reconciliation {
            change_set,
            duplicate_keys,
        } = self.reconciler.reconcile(rows, snapshot);

        let report = self.store.apply(&change_set).await?;
        let outcome = run_outcome(&change_set, report);
        info!(?outcome, duplicate_keys, "reconciliation finished");

        Ok(SyncRunSummary {
            run_id,
            table: self.store.table().as_str().to_string(),
            source_id: self.source.source_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            fetched_records: records.len(),
            normalized_rows,
            duplicate_keys,
            outcome,
            archived_batch,
        })
    }

    /// Archiving is best-effort: a failure is logged and the cycle continues.
    async fn archive_raw_batch(
        &self,
        fetched_at: DateTime<Utc>,
        records: &[serde_json::Value],
    ) -> Option<String> {
        let archive = self.archive.as_ref()?;
        let bytes = match serde_json::to_vec(records) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "serializing raw batch for archive");
                return None;
            }
        };
        match archive
            .store_batch(fetched_at, self.store.table().as_str(), &bytes)
            .await
        {
            Ok(stored) => Some(stored.absolute_path.display().to_string()),
            Err(err) => {
                warn!(error = %err, "archiving raw batch");
                None
            }
        }
    }

    /// Run a cycle unless one is already in flight; `None` means the trigger was skipped.
    pub async fn run_guarded(&self) -> Option<Result<SyncRunSummary, BatchError>> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            warn!("previous reconciliation still running; skipping trigger");
            return None;
        };
        Some(self.run_once().await)
    }

    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(&cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                log_run(pipeline.run_guarded().await);
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

/// Report a guarded run the way the scheduler does: failures are logged, never propagated.
pub fn log_run(result: Option<Result<SyncRunSummary, BatchError>>) {
    match result {
        None => {}
        Some(Ok(summary)) => info!(
            run_id = %summary.run_id,
            table = %summary.table,
            outcome = ?summary.outcome,
            "reconciliation committed"
        ),
        Some(Err(err)) => error!(error = %err, "reconciliation failed; store left unchanged"),
    }
}

fn run_outcome(change_set: &ChangeSet, report: ApplyReport) -> RunOutcome {
    match change_set {
        ChangeSet::Bootstrap { .. } => RunOutcome::Bootstrap {
            inserted: report.inserted,
        },
        ChangeSet::Delta(delta) => RunOutcome::Delta {
            new: delta.new.len(),
            changed: delta.changed.len(),
            removed: delta.removed.len(),
            unchanged: delta.unchanged,
            deactivated: report.deactivated,
            inserted: report.inserted,
        },
    }
}
