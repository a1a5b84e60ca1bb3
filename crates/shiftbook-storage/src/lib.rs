//! Durable key-value persistence + HTTP fetch utilities for shiftbook.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context};
use reqwest::header::CACHE_CONTROL;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use shiftbook_core::{EmployeeTable, ScheduleStore, SheetConfig, DEFAULT_WORKSHEET};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shiftbook-storage";

/// Fixed storage keys.
pub mod keys {
    pub const EMPLOYEES: &str = "employees.json";
    pub const SCHEDULES: &str = "schedules.json";
    pub const SHEET_ID: &str = "sheet_id";
    pub const SHEET_WORKSHEET: &str = "sheet_worksheet";
}

/// String values under string keys. Writes replace a key's value atomically.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    /// Removing an absent key is not an error.
    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// One file per key under a root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Write through a temp file in the same directory, then rename over the key.
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating store directory {}", self.root.display()))?;

        let dest = self.path_for(key);
        let temp_path = self.root.join(format!(".{}.{}.tmp", key, Uuid::new_v4()));

        let write_result = (|| -> anyhow::Result<()> {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .with_context(|| format!("opening temp file {}", temp_path.display()))?;
            file.write_all(value.as_bytes())
                .with_context(|| format!("writing temp file {}", temp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }

        fs::rename(&temp_path, &dest).or_else(|err| {
            let _ = fs::remove_file(&temp_path);
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    dest.display()
                )
            })
        })
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}

/// Process-local store, used for ephemeral sessions and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

/// Employee table and schedule store as read back from storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedState {
    pub employees: EmployeeTable,
    pub schedules: ScheduleStore,
}

/// Reads and writes the employee table and schedule store under fixed keys.
#[derive(Debug)]
pub struct PersistenceAdapter<S> {
    store: S,
}

impl<S: KeyValueStore> PersistenceAdapter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist both halves. Failures are logged, never returned. If the
    /// schedules write fails the employees key is put back, so storage holds
    /// either both new halves or both previous ones. Returns whether both landed.
    pub fn save(&self, employees: &EmployeeTable, schedules: &ScheduleStore) -> bool {
        let encoded = serde_json::to_string(employees)
            .and_then(|emp| serde_json::to_string(schedules).map(|sch| (emp, sch)));
        let (employees_json, schedules_json) = match encoded {
            Ok(pair) => pair,
            Err(err) => {
                error!(%err, "failed serializing schedule state, nothing saved");
                return false;
            }
        };

        let previous_employees = match self.store.get(keys::EMPLOYEES) {
            Ok(previous) => previous,
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed reading stored employees, nothing saved");
                return false;
            }
        };

        if let Err(err) = self.store.set(keys::EMPLOYEES, &employees_json) {
            error!(key = keys::EMPLOYEES, error = %format!("{err:#}"), "failed saving to storage");
            return false;
        }
        if let Err(err) = self.store.set(keys::SCHEDULES, &schedules_json) {
            error!(key = keys::SCHEDULES, error = %format!("{err:#}"), "failed saving to storage");
            self.restore(keys::EMPLOYEES, previous_employees.as_deref());
            return false;
        }

        debug!(
            employees = employees.len(),
            schedules = schedules.len(),
            "saved schedule state"
        );
        true
    }

    fn restore(&self, key: &str, previous: Option<&str>) {
        let restored = match previous {
            Some(value) => self.store.set(key, value),
            None => self.store.remove(key),
        };
        if let Err(err) = restored {
            error!(key, error = %format!("{err:#}"), "failed restoring previous state");
        }
    }

    /// Load both halves independently; a missing or corrupt half comes back empty.
    pub fn load(&self) -> LoadedState {
        LoadedState {
            employees: self.load_half(keys::EMPLOYEES),
            schedules: self.load_half(keys::SCHEDULES),
        }
    }

    fn load_half<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        let text = match self.store.get(key) {
            Ok(Some(text)) => text,
            Ok(None) => return T::default(),
            Err(err) => {
                warn!(key, error = %format!("{err:#}"), "failed reading stored state, starting empty");
                return T::default();
            }
        };
        serde_json::from_str(&text).unwrap_or_else(|err| {
            warn!(key, %err, "corrupt stored state, starting empty");
            T::default()
        })
    }

    pub fn save_sheet_config(&self, config: &SheetConfig) -> anyhow::Result<()> {
        self.store
            .set(keys::SHEET_ID, &config.sheet_id)
            .context("saving sheet id")?;
        self.store
            .set(keys::SHEET_WORKSHEET, &config.worksheet)
            .context("saving worksheet name")?;
        info!(sheet_id = %config.sheet_id, worksheet = %config.worksheet, "saved sheet settings");
        Ok(())
    }

    /// Stored sheet settings; an unset worksheet falls back to `Schedule`.
    pub fn load_sheet_config(&self) -> SheetConfig {
        let read = |key: &str| match self.store.get(key) {
            Ok(value) => value.unwrap_or_default(),
            Err(err) => {
                warn!(key, error = %format!("{err:#}"), "failed reading sheet settings");
                String::new()
            }
        };
        let sheet_id = read(keys::SHEET_ID);
        let worksheet = read(keys::SHEET_WORKSHEET);
        let worksheet = if worksheet.trim().is_empty() {
            DEFAULT_WORKSHEET.to_string()
        } else {
            worksheet
        };
        SheetConfig::new(sheet_id, worksheet)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retries within a single request. The default makes exactly one attempt.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// `None` leaves timing entirely to the transport.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url`, bypassing caches. Non-success statuses are errors.
    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        async {
            let mut attempt = 0usize;
            loop {
                let resp_result = self
                    .client
                    .get(url)
                    .header(CACHE_CONTROL, "no-cache")
                    .send()
                    .await;

                match resp_result {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiftbook_core::{seed_data, Shift};
    use tempfile::tempdir;

    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            Err(anyhow!("storage quota exceeded"))
        }

        fn remove(&self, _key: &str) -> anyhow::Result<()> {
            Err(anyhow!("storage is read-only"))
        }
    }

    struct FailingKeyStore {
        inner: MemoryStore,
        failing_key: &'static str,
    }

    impl KeyValueStore for FailingKeyStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            if key == self.failing_key {
                return Err(anyhow!("storage quota exceeded"));
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn failed_schedules_write_puts_employees_back() {
        let inner = MemoryStore::new();
        inner.set(keys::EMPLOYEES, "[]").unwrap();
        let adapter = PersistenceAdapter::new(FailingKeyStore {
            inner,
            failing_key: keys::SCHEDULES,
        });
        let (employees, schedules) = seed_data();

        assert!(!adapter.save(&employees, &schedules));
        assert_eq!(adapter.store().get(keys::EMPLOYEES).unwrap().as_deref(), Some("[]"));
        assert_eq!(adapter.store().get(keys::SCHEDULES).unwrap(), None);
    }

    #[test]
    fn failed_first_save_leaves_no_employees_key_behind() {
        let adapter = PersistenceAdapter::new(FailingKeyStore {
            inner: MemoryStore::new(),
            failing_key: keys::SCHEDULES,
        });
        let (employees, schedules) = seed_data();

        assert!(!adapter.save(&employees, &schedules));
        assert_eq!(adapter.store().get(keys::EMPLOYEES).unwrap(), None);
        assert!(adapter.load().employees.is_empty());
    }

    #[test]
    fn file_store_remove_tolerates_missing_keys() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        store.set("k", "v").unwrap();
        store.remove("k").unwrap();
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn file_store_overwrites_atomically_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("data"));

        assert_eq!(store.get("missing").unwrap(), None);
        store.set("k", "first").unwrap();
        store.set("k", "second").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("second"));

        let leftovers: Vec<_> = fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn save_then_load_reproduces_state() {
        let dir = tempdir().expect("tempdir");
        let adapter = PersistenceAdapter::new(FileStore::new(dir.path()));
        let (employees, mut schedules) = seed_data();
        schedules
            .upsert_employee("zack", "Zack")
            .shifts
            .push(Shift::new("Sunday", "Site 9", "11:00 PM", "7:00 AM"));

        assert!(adapter.save(&employees, &schedules));
        let loaded = adapter.load();
        assert_eq!(loaded.employees, employees);
        assert_eq!(loaded.schedules, schedules);
    }

    #[test]
    fn corrupt_schedules_do_not_block_employees() {
        let adapter = PersistenceAdapter::new(MemoryStore::new());
        let (employees, schedules) = seed_data();
        adapter.save(&employees, &schedules);
        adapter.store().set(keys::SCHEDULES, "{not json").unwrap();

        let loaded = adapter.load();
        assert_eq!(loaded.employees.len(), 3);
        assert!(loaded.schedules.is_empty());
    }

    #[test]
    fn corrupt_employees_do_not_block_schedules() {
        let adapter = PersistenceAdapter::new(MemoryStore::new());
        let (employees, schedules) = seed_data();
        adapter.save(&employees, &schedules);
        adapter.store().set(keys::EMPLOYEES, "[{\"id\": 5}]").unwrap();

        let loaded = adapter.load();
        assert!(loaded.employees.is_empty());
        assert_eq!(loaded.schedules.len(), 2);
    }

    #[test]
    fn failed_save_is_swallowed_and_keeps_prior_state() {
        let inner = MemoryStore::new();
        inner.set(keys::EMPLOYEES, "[]").unwrap();
        let adapter = PersistenceAdapter::new(ReadOnlyStore { inner });
        let (employees, schedules) = seed_data();

        assert!(!adapter.save(&employees, &schedules));
        assert_eq!(adapter.store().get(keys::EMPLOYEES).unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn sheet_config_defaults_worksheet_name() {
        let adapter = PersistenceAdapter::new(MemoryStore::new());
        let config = adapter.load_sheet_config();
        assert_eq!(config.sheet_id, "");
        assert_eq!(config.worksheet, "Schedule");

        adapter
            .save_sheet_config(&SheetConfig::new(" abc123 ", "Week 12"))
            .unwrap();
        assert_eq!(
            adapter.load_sheet_config(),
            SheetConfig::new("abc123", "Week 12")
        );
    }

    #[test]
    fn only_server_and_rate_limit_statuses_retry() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(BackoffPolicy::default().max_retries, 0);
    }
}
