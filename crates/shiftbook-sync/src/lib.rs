//! Ingestion pipeline: full-replace imports, per-employee edits and remote sync.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shiftbook_adapters::{
    read_upload, read_upload_path, OpenSheetJsonSource, PublishedCsvSource, RowSource,
    SourceError, UploadError,
};
use shiftbook_core::{
    apply_row, seed_data, EmployeeTable, RawRow, ScheduleStore, SheetConfig, Shift,
};
use shiftbook_storage::{
    BackoffPolicy, FileStore, HttpClientConfig, HttpFetcher, KeyValueStore, PersistenceAdapter,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shiftbook-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub sheet_id: Option<String>,
    pub worksheet: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: Option<u64>,
    pub http_retries: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            data_dir: std::env::var("SHIFTBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            sheet_id: non_empty("SHIFTBOOK_SHEET_ID"),
            worksheet: non_empty("SHIFTBOOK_WORKSHEET"),
            user_agent: std::env::var("SHIFTBOOK_USER_AGENT")
                .unwrap_or_else(|_| "shiftbook/0.1".to_string()),
            http_timeout_secs: std::env::var("SHIFTBOOK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            http_retries: std::env::var("SHIFTBOOK_HTTP_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout_secs.map(Duration::from_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_retries,
                ..BackoffPolicy::default()
            },
        }
    }

    /// Environment overrides layered on top of the stored sheet settings.
    pub fn resolve_sheet(&self, stored: SheetConfig) -> SheetConfig {
        SheetConfig::new(
            self.sheet_id.clone().unwrap_or(stored.sheet_id),
            self.worksheet.clone().unwrap_or(stored.worksheet),
        )
    }

    pub fn open_pipeline(&self) -> IngestionPipeline<FileStore> {
        IngestionPipeline::open(FileStore::new(&self.data_dir))
    }
}

/// The employee table and schedule store a session works against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleContext {
    employees: EmployeeTable,
    schedules: ScheduleStore,
}

impl ScheduleContext {
    pub fn new(employees: EmployeeTable, schedules: ScheduleStore) -> Self {
        Self {
            employees,
            schedules,
        }
    }

    pub fn employees(&self) -> &EmployeeTable {
        &self.employees
    }

    pub fn schedules(&self) -> &ScheduleStore {
        &self.schedules
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    pub row_index: usize,
    pub missing: Vec<&'static str>,
}

/// Outcome of one full-replace ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub rows_seen: usize,
    pub shifts_added: usize,
    pub employees_created: usize,
    pub schedules: usize,
    pub skipped: Vec<SkippedRow>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("unknown employee {0:?}")]
    UnknownEmployee(String),
    #[error("shift field {0} is required")]
    MissingField(&'static str),
}

#[derive(Debug)]
pub struct IngestionPipeline<S> {
    persistence: PersistenceAdapter<S>,
    context: ScheduleContext,
}

impl<S: KeyValueStore> IngestionPipeline<S> {
    /// Load stored state. When no employees exist the seed employees are
    /// installed and the seed schedules are merged into whatever loaded.
    pub fn open(store: S) -> Self {
        let persistence = PersistenceAdapter::new(store);
        let loaded = persistence.load();
        let mut context = ScheduleContext::new(loaded.employees, loaded.schedules);

        if context.employees.is_empty() {
            let (employees, schedules) = seed_data();
            context.employees = employees;
            for record in schedules.list_all() {
                context
                    .schedules
                    .insert_record(record.employee_id.clone(), record.clone());
            }
            persistence.save(&context.employees, &context.schedules);
            info!(
                schedules = context.schedules.len(),
                "installed seed schedule data"
            );
        }

        Self {
            persistence,
            context,
        }
    }

    pub fn context(&self) -> &ScheduleContext {
        &self.context
    }

    pub fn employees(&self) -> &EmployeeTable {
        &self.context.employees
    }

    pub fn schedules(&self) -> &ScheduleStore {
        &self.context.schedules
    }

    pub fn persistence(&self) -> &PersistenceAdapter<S> {
        &self.persistence
    }

    pub fn save(&self) -> bool {
        self.persistence
            .save(&self.context.employees, &self.context.schedules)
    }

    pub fn sheet_config(&self) -> SheetConfig {
        self.persistence.load_sheet_config()
    }

    pub fn configure_sheet(&self, config: &SheetConfig) -> anyhow::Result<()> {
        self.persistence.save_sheet_config(config)
    }

    /// Clear the schedule store and rebuild it from `rows` in order. Rows
    /// missing a field are skipped; employees are only ever added.
    pub fn ingest_full(&mut self, rows: &[RawRow]) -> IngestReport {
        let ScheduleContext {
            employees,
            schedules,
        } = &mut self.context;
        schedules.clear();

        let mut report = IngestReport {
            rows_seen: rows.len(),
            ..IngestReport::default()
        };
        for (row_index, row) in rows.iter().enumerate() {
            match apply_row(row, employees, schedules) {
                Ok(applied) => {
                    report.shifts_added += 1;
                    report.employees_created += usize::from(applied.employee_created);
                }
                Err(skip) => {
                    debug!(row_index, missing = ?skip.missing, "skipping incomplete row");
                    report.skipped.push(SkippedRow {
                        row_index,
                        missing: skip.missing,
                    });
                }
            }
        }
        report.schedules = schedules.len();

        self.save();
        info!(
            rows = report.rows_seen,
            shifts = report.shifts_added,
            skipped = report.skipped.len(),
            schedules = report.schedules,
            "schedule store rebuilt"
        );
        report
    }

    /// Editing context for one employee known to either the employee table
    /// or the schedule store.
    pub fn editor(&mut self, employee_id: &str) -> Result<ShiftEditor<'_, S>, EditError> {
        if !self.context.employees.contains(employee_id)
            && self.context.schedules.get(employee_id).is_none()
        {
            return Err(EditError::UnknownEmployee(employee_id.to_string()));
        }
        Ok(ShiftEditor {
            pipeline: self,
            employee_id: employee_id.to_string(),
        })
    }
}

/// Index-based edits to a single employee's shift list. Every change is saved.
#[derive(Debug)]
pub struct ShiftEditor<'a, S> {
    pipeline: &'a mut IngestionPipeline<S>,
    employee_id: String,
}

impl<S: KeyValueStore> ShiftEditor<'_, S> {
    pub fn employee_id(&self) -> &str {
        &self.employee_id
    }

    pub fn shifts(&self) -> &[Shift] {
        self.pipeline
            .context
            .schedules
            .get(&self.employee_id)
            .map(|record| record.shifts.as_slice())
            .unwrap_or_default()
    }

    /// Append a shift, creating the schedule record under the employee's
    /// name if this is their first one.
    pub fn add_shift(&mut self, shift: Shift) -> Result<(), EditError> {
        let shift = validated(shift)?;
        let context = &mut self.pipeline.context;
        let name = context
            .employees
            .get(&self.employee_id)
            .map(|employee| employee.name.clone())
            .unwrap_or_else(|| self.employee_id.clone());
        context
            .schedules
            .upsert_employee(&self.employee_id, &name)
            .shifts
            .push(shift);
        self.pipeline.save();
        Ok(())
    }

    /// Returns `false`, changing nothing, when `index` is out of range.
    pub fn replace_shift(&mut self, index: usize, shift: Shift) -> Result<bool, EditError> {
        let shift = validated(shift)?;
        let replaced = self
            .pipeline
            .context
            .schedules
            .replace_shift(&self.employee_id, index, shift);
        if replaced {
            self.pipeline.save();
        }
        Ok(replaced)
    }

    pub fn delete_shift(&mut self, index: usize) -> Option<Shift> {
        let removed = self
            .pipeline
            .context
            .schedules
            .delete_shift(&self.employee_id, index);
        if removed.is_some() {
            self.pipeline.save();
        }
        removed
    }
}

fn validated(shift: Shift) -> Result<Shift, EditError> {
    let shift = Shift::new(
        shift.day.trim(),
        shift.site.trim(),
        shift.start_time.trim(),
        shift.end_time.trim(),
    );
    match shift.first_missing_field() {
        Some(field) => Err(EditError::MissingField(field)),
        None => Ok(shift),
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote sheet is not configured: sheet id and worksheet name are required")]
    MissingSheetConfig,
    #[error("no row sources configured")]
    NoSources,
    #[error("all row sources failed: {}", describe_failures(.failures))]
    AllSourcesFailed {
        failures: Vec<(&'static str, SourceError)>,
    },
}

fn describe_failures(failures: &[(&'static str, SourceError)]) -> String {
    failures
        .iter()
        .map(|(source_id, err)| format!("{source_id}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone)]
pub struct FetchedRows {
    pub source_id: &'static str,
    pub rows: Vec<RawRow>,
}

/// Row sources tried strictly in order; the first success wins.
pub struct SourceChain {
    sources: Vec<Box<dyn RowSource>>,
}

impl SourceChain {
    pub fn new(sources: Vec<Box<dyn RowSource>>) -> Self {
        Self { sources }
    }

    /// Row-array JSON first, published CSV as the fallback.
    pub fn for_sheet(config: &SheetConfig) -> Self {
        Self::new(vec![
            Box::new(OpenSheetJsonSource::new(config)),
            Box::new(PublishedCsvSource::new(config)),
        ])
    }

    pub fn source_ids(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.source_id()).collect()
    }

    pub async fn fetch_first(&self, http: &HttpFetcher) -> Result<FetchedRows, SyncError> {
        if self.sources.is_empty() {
            return Err(SyncError::NoSources);
        }

        let mut failures = Vec::new();
        for source in &self.sources {
            let source_id = source.source_id();
            match source.fetch_rows(http).await {
                Ok(rows) => {
                    debug!(source_id, rows = rows.len(), "row source succeeded");
                    return Ok(FetchedRows { source_id, rows });
                }
                Err(err) => {
                    warn!(source_id, error = %err, "row source failed, trying next");
                    failures.push((source_id, err));
                }
            }
        }
        Err(SyncError::AllSourcesFailed { failures })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub rows_fetched: usize,
    pub report: IngestReport,
}

/// Fetch through `chain` and full-replace the store. A failed fetch leaves
/// the store untouched.
pub async fn sync_with_chain<S: KeyValueStore>(
    pipeline: &mut IngestionPipeline<S>,
    http: &HttpFetcher,
    chain: &SourceChain,
) -> Result<SyncRunSummary, SyncError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let fetched = chain.fetch_first(http).await?;
    let report = pipeline.ingest_full(&fetched.rows);
    let summary = SyncRunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        source_id: fetched.source_id.to_string(),
        rows_fetched: fetched.rows.len(),
        report,
    };
    info!(
        %run_id,
        source_id = %summary.source_id,
        schedules = summary.report.schedules,
        "sync complete"
    );
    Ok(summary)
}

pub async fn sync_from_sheet<S: KeyValueStore>(
    pipeline: &mut IngestionPipeline<S>,
    http: &HttpFetcher,
    sheet: &SheetConfig,
) -> Result<SyncRunSummary, SyncError> {
    if !sheet.is_complete() {
        return Err(SyncError::MissingSheetConfig);
    }
    sync_with_chain(pipeline, http, &SourceChain::for_sheet(sheet)).await
}

/// Validate and read an upload, then full-replace the store with its rows.
/// Rejected files never reach the pipeline.
pub fn import_upload<S: KeyValueStore>(
    pipeline: &mut IngestionPipeline<S>,
    file_name: &str,
    mime: Option<&str>,
    bytes: &[u8],
) -> Result<IngestReport, UploadError> {
    let rows = read_upload(file_name, mime, bytes)?;
    Ok(pipeline.ingest_full(&rows))
}

pub fn import_upload_file<S: KeyValueStore>(
    pipeline: &mut IngestionPipeline<S>,
    path: &Path,
    mime: Option<&str>,
) -> anyhow::Result<IngestReport> {
    let rows = read_upload_path(path, mime)?;
    Ok(pipeline.ingest_full(&rows))
}

pub type SharedPipeline<S> = Arc<Mutex<IngestionPipeline<S>>>;

pub fn share<S>(pipeline: IngestionPipeline<S>) -> SharedPipeline<S> {
    Arc::new(Mutex::new(pipeline))
}

/// Holds the pipeline lock across fetch, rebuild and save, so concurrent
/// syncs run one after another.
pub async fn sync_shared<S: KeyValueStore>(
    shared: &SharedPipeline<S>,
    http: &HttpFetcher,
    chain: &SourceChain,
) -> Result<SyncRunSummary, SyncError> {
    let mut pipeline = shared.lock().await;
    sync_with_chain(&mut *pipeline, http, chain).await
}
