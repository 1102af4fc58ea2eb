//! Flat-file table storage + HTTP fetch utilities for eotrack.

use std::collections::HashSet;
use std::hash::Hash;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use eotrack_core::{AnalysisRecord, Identifier, OrderRecord, PostRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "eotrack-storage";

/// A row of one of the persisted tables.
pub trait TableRow: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Key: Eq + Hash;

    /// Column header written as the first line of the file.
    const HEADER: &'static [&'static str];

    fn dedup_key(&self) -> Self::Key;
}

impl TableRow for OrderRecord {
    type Key = Identifier;
    const HEADER: &'static [&'static str] = &["ID", "Title", "Date", "Link"];

    fn dedup_key(&self) -> Self::Key {
        self.id.clone()
    }
}

impl TableRow for AnalysisRecord {
    type Key = Identifier;
    const HEADER: &'static [&'static str] = &["ID", "Analysis"];

    fn dedup_key(&self) -> Self::Key {
        self.id.clone()
    }
}

impl TableRow for PostRecord {
    type Key = (Identifier, String);
    const HEADER: &'static [&'static str] = &["ID", "X_Post"];

    fn dedup_key(&self) -> Self::Key {
        (self.id.clone(), self.post.clone())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("malformed table {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("encoding table rows: {0}")]
    Encode(#[from] csv::Error),
    #[error("flushing table buffer: {0}")]
    Flush(std::io::Error),
}

/// Row counts around a single merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeReport {
    pub existing: usize,
    pub supplied: usize,
    /// Rows dropped because a later row carried the same key.
    pub replaced: usize,
    pub total: usize,
}

/// Appends `new_rows` after `existing` and drops duplicate keys, keeping the last occurrence.
pub fn merge_rows<R: TableRow>(existing: Vec<R>, new_rows: Vec<R>) -> Vec<R> {
    let mut seen = HashSet::new();
    let mut merged: Vec<R> = existing
        .into_iter()
        .chain(new_rows)
        .rev()
        .filter(|row| seen.insert(row.dedup_key()))
        .collect();
    merged.reverse();
    merged
}

pub fn encode_rows<R: TableRow>(rows: &[R]) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(R::HEADER)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.into_inner().map_err(|err| {
        StoreError::Flush(std::io::Error::new(err.error().kind(), err.error().to_string()))
    })
}

pub fn decode_rows<R: TableRow>(path: &Path, bytes: &[u8]) -> Result<Vec<R>, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    reader
        .deserialize()
        .collect::<Result<Vec<R>, csv::Error>>()
        .map_err(|source| StoreError::Malformed {
            path: path.display().to_string(),
            source,
        })
}

/// One CSV-backed table, read and rewritten whole.
#[derive(Debug, Clone)]
pub struct CsvTable<R> {
    path: PathBuf,
    _rows: PhantomData<fn() -> R>,
}

impl<R: TableRow> CsvTable<R> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _rows: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads every row; a missing file is an empty table.
    pub async fn load(&self) -> anyhow::Result<Vec<R>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking table path {}", self.path.display()))?
        {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading table {}", self.path.display()))?;
        Ok(decode_rows(&self.path, &bytes)?)
    }

    pub async fn merge_and_persist(&self, new_rows: Vec<R>) -> anyhow::Result<MergeReport> {
        let existing = self.load().await?;
        let existing_len = existing.len();
        let supplied = new_rows.len();

        let merged = merge_rows(existing, new_rows);
        self.replace_contents(&merged).await?;

        let report = MergeReport {
            existing: existing_len,
            supplied,
            replaced: existing_len + supplied - merged.len(),
            total: merged.len(),
        };
        debug!(table = %self.path.display(), ?report, "table merged");
        Ok(report)
    }

    /// Rewrites the file through a temp file and rename so readers never see a partial table.
    async fn replace_contents(&self, rows: &[R]) -> anyhow::Result<()> {
        let bytes = encode_rows(rows)?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating table directory {}", parent.display()))?;

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| anyhow!("table path {} has no file name", self.path.display()))?
            .to_string_lossy();
        let temp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

        let written = match write_temp_file(&temp_path, &bytes).await {
            Ok(()) => fs::rename(&temp_path, &self.path).await.with_context(|| {
                format!(
                    "atomically renaming temp table {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            }),
            Err(err) => Err(err),
        };
        if written.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        written
    }
}

async fn write_temp_file(temp_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp table file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp table file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp table file {}", temp_path.display()))?;
    Ok(())
}

/// Persistence seam used by the sync driver.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load_orders(&self) -> anyhow::Result<Vec<OrderRecord>>;
    async fn persist_orders(&self, rows: Vec<OrderRecord>) -> anyhow::Result<MergeReport>;
    async fn persist_analyses(&self, rows: Vec<AnalysisRecord>) -> anyhow::Result<MergeReport>;
    async fn persist_posts(&self, rows: Vec<PostRecord>) -> anyhow::Result<MergeReport>;
}

#[derive(Debug, Clone)]
pub struct CsvRecordStore {
    orders: CsvTable<OrderRecord>,
    analyses: CsvTable<AnalysisRecord>,
    posts: CsvTable<PostRecord>,
}

impl CsvRecordStore {
    pub fn new(
        orders_path: impl Into<PathBuf>,
        analyses_path: impl Into<PathBuf>,
        posts_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            orders: CsvTable::new(orders_path),
            analyses: CsvTable::new(analyses_path),
            posts: CsvTable::new(posts_path),
        }
    }

    pub fn orders(&self) -> &CsvTable<OrderRecord> {
        &self.orders
    }

    pub fn analyses(&self) -> &CsvTable<AnalysisRecord> {
        &self.analyses
    }

    pub fn posts(&self) -> &CsvTable<PostRecord> {
        &self.posts
    }
}

#[async_trait]
impl RecordStore for CsvRecordStore {
    async fn load_orders(&self) -> anyhow::Result<Vec<OrderRecord>> {
        self.orders.load().await
    }

    async fn persist_orders(&self, rows: Vec<OrderRecord>) -> anyhow::Result<MergeReport> {
        self.orders.merge_and_persist(rows).await
    }

    async fn persist_analyses(&self, rows: Vec<AnalysisRecord>) -> anyhow::Result<MergeReport> {
        self.analyses.merge_and_persist(rows).await
    }

    async fn persist_posts(&self, rows: Vec<PostRecord>) -> anyhow::Result<MergeReport> {
        self.posts.merge_and_persist(rows).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Single-attempt GET client; callers decide what a failure means for the run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
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
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(url = %final_url, bytes = body.len(), "fetched");
            Ok(FetchedResponse { body })
        }
        .instrument(span)
        .await
    }
}
