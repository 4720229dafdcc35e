//! Sheet sources/sinks, CSV codec, HTTP fetch, and the two-file commit journal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rbook_core::Sheet;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rbook-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Parses CSV text with a header row. Ragged rows are padded to header width.
pub fn parse_csv(bytes: &[u8]) -> anyhow::Result<Sheet> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .context("reading csv header row")?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading csv row {}", idx + 1))?;
        rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }
    Ok(Sheet::new(headers, rows))
}

pub fn render_csv(sheet: &Sheet) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(Vec::new());
    writer
        .write_record(&sheet.headers)
        .context("writing csv header row")?;
    for row in &sheet.rows {
        writer.write_record(row).context("writing csv row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv writer: {}", err.error()))
}

/// Writes `bytes` to `path` via a temp file in the same directory and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let temp_path = stage_temp_file(path, bytes).await?;
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

async fn stage_temp_file(target: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    Ok(temp_path)
}

#[async_trait]
pub trait SheetSource: Send + Sync {
    fn describe(&self) -> String;

    /// Returns a full snapshot of the sheet.
    async fn read(&self) -> anyhow::Result<Sheet>;
}

#[derive(Debug, Clone)]
pub struct CsvFileSource {
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SheetSource for CsvFileSource {
    fn describe(&self) -> String {
        format!("csv file {}", self.path.display())
    }

    async fn read(&self) -> anyhow::Result<Sheet> {
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        parse_csv(&bytes).with_context(|| format!("parsing {}", self.path.display()))
    }
}

/// Reads a sheet from a CSV export link (for example a spreadsheet's
/// `export?format=csv` URL).
#[derive(Debug)]
pub struct HttpCsvSource {
    fetcher: HttpFetcher,
    url: String,
}

impl HttpCsvSource {
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SheetSource for HttpCsvSource {
    fn describe(&self) -> String {
        format!("csv export {}", self.url)
    }

    async fn read(&self) -> anyhow::Result<Sheet> {
        let response = self.fetcher.fetch_bytes(&self.url).await?;
        parse_csv(&response.body).with_context(|| format!("parsing csv from {}", response.final_url))
    }
}

/// Full-table clear-and-rewrite sink for a local CSV file.
#[derive(Debug, Clone)]
pub struct CsvFileSink {
    path: PathBuf,
}

impl CsvFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, sheet: &Sheet) -> anyhow::Result<()> {
        let bytes = render_csv(sheet)?;
        write_atomic(&self.path, &bytes).await
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("commit journal {path} holds an unfinished commit for run {run_id}; run recovery first")]
    JournalPending { path: String, run_id: Uuid },
    #[error("staged file {path} does not match its journaled sha256 {expected}")]
    HashMismatch { path: String, expected: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalState {
    Staged,
    Committed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub target: PathBuf,
    pub temp: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub run_id: Uuid,
    pub state: JournalState,
    pub staged_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub files: Vec<StagedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Clean,
    RolledForward { run_id: Uuid, files: usize },
}

/// Commits several full-table writes as one unit.
///
/// Every output is staged to a temp file first and the set is recorded in a
/// JSON journal before any target is replaced. An interrupted commit is
/// finished by [`CommitJournal::recover`], which only ever rolls forward.
#[derive(Debug, Clone)]
pub struct CommitJournal {
    path: PathBuf,
}

impl CommitJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<Option<JournalEntry>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking journal {}", self.path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading journal {}", self.path.display()))?;
        let entry = serde_json::from_str(&text)
            .with_context(|| format!("parsing journal {}", self.path.display()))?;
        Ok(Some(entry))
    }

    /// The journaled commit still waiting to be applied, if any.
    pub async fn pending(&self) -> anyhow::Result<Option<JournalEntry>> {
        Ok(self
            .load()
            .await?
            .filter(|entry| entry.state == JournalState::Staged))
    }

    pub async fn ensure_clean(&self) -> anyhow::Result<()> {
        if let Some(entry) = self.pending().await? {
            return Err(StorageError::JournalPending {
                path: self.path.display().to_string(),
                run_id: entry.run_id,
            }
            .into());
        }
        Ok(())
    }

    pub async fn commit(
        &self,
        run_id: Uuid,
        writes: &[(PathBuf, Vec<u8>)],
    ) -> anyhow::Result<JournalEntry> {
        let span = info_span!("commit", %run_id, files = writes.len());
        self.stage_and_apply(run_id, writes).instrument(span).await
    }

    async fn stage_and_apply(
        &self,
        run_id: Uuid,
        writes: &[(PathBuf, Vec<u8>)],
    ) -> anyhow::Result<JournalEntry> {
        let entry = self.stage(run_id, writes).await?;
        self.apply(entry).await
    }

    /// Writes every output to a temp file and journals the set as `staged`.
    pub async fn stage(
        &self,
        run_id: Uuid,
        writes: &[(PathBuf, Vec<u8>)],
    ) -> anyhow::Result<JournalEntry> {
        self.ensure_clean().await?;

        let mut files = Vec::with_capacity(writes.len());
        for (target, bytes) in writes {
            let temp = stage_temp_file(target, bytes).await?;
            files.push(StagedFile {
                target: target.clone(),
                temp,
                sha256: sha256_hex(bytes),
                bytes: bytes.len() as u64,
            });
        }

        let entry = JournalEntry {
            run_id,
            state: JournalState::Staged,
            staged_at: Utc::now(),
            committed_at: None,
            files,
        };
        self.write_entry(&entry).await?;
        info!(journal = %self.path.display(), "staged commit");
        Ok(entry)
    }

    /// Moves staged files into place and marks the journal committed.
    /// Safe to repeat: files already moved are verified instead.
    pub async fn apply(&self, mut entry: JournalEntry) -> anyhow::Result<JournalEntry> {
        for file in &entry.files {
            if fs::try_exists(&file.temp)
                .await
                .with_context(|| format!("checking staged file {}", file.temp.display()))?
            {
                verify_hash(&file.temp, &file.sha256).await?;
                fs::rename(&file.temp, &file.target).await.with_context(|| {
                    format!(
                        "renaming staged {} -> {}",
                        file.temp.display(),
                        file.target.display()
                    )
                })?;
            } else {
                verify_hash(&file.target, &file.sha256).await?;
            }
        }

        entry.state = JournalState::Committed;
        entry.committed_at = Some(Utc::now());
        self.write_entry(&entry).await?;
        info!(run_id = %entry.run_id, "commit applied");
        Ok(entry)
    }

    pub async fn recover(&self) -> anyhow::Result<RecoveryOutcome> {
        let Some(entry) = self.pending().await? else {
            return Ok(RecoveryOutcome::Clean);
        };
        warn!(run_id = %entry.run_id, "rolling forward unfinished commit");
        let run_id = entry.run_id;
        let files = entry.files.len();
        self.apply(entry).await?;
        Ok(RecoveryOutcome::RolledForward { run_id, files })
    }

    async fn write_entry(&self, entry: &JournalEntry) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(entry).context("serializing commit journal")?;
        write_atomic(&self.path, &bytes)
            .await
            .with_context(|| format!("writing journal {}", self.path.display()))
    }
}

async fn verify_hash(path: &Path, expected: &str) -> anyhow::Result<()> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if sha256_hex(&bytes) != expected {
        return Err(StorageError::HashMismatch {
            path: path.display().to_string(),
            expected: expected.to_string(),
        }
        .into());
    }
    Ok(())
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
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
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retrying sheet export fetch");
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
                        warn!(error = %err, attempt, "retrying sheet export fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
