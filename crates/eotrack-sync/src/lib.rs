//! Incremental ingestion run: reconcile the listing against stored orders, enrich the
//! new ones, and merge everything into the tables.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use eotrack_adapters::{ContentSource, ListingSource, WhiteHouseAdapter, DEFAULT_LISTING_LIMIT};
use eotrack_core::{
    find_collisions, parse_bullet_posts, reconcile, AnalysisRecord, CandidateRecord, Identifier,
    OrderRecord, PostRecord,
};
use eotrack_enrich::{
    generation_client, Generator, OpenAiGenerator, PromptSet, DEFAULT_MODEL, DEFAULT_TIMEOUT,
};
use eotrack_storage::{CsvRecordStore, HttpClientConfig, HttpFetcher, RecordStore};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "eotrack-sync";

pub const DEFAULT_LISTING_URL: &str = "https://www.whitehouse.gov/briefing-room/presidential-actions/";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub listing_url: String,
    pub output_dir: PathBuf,
    pub orders_file: String,
    pub analysis_file: String,
    pub posts_file: String,
    pub prompts_dir: PathBuf,
    pub listing_limit: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub openai_model: String,
    pub openai_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; absent or unparseable values use defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            listing_url: lookup("EOTRACK_LISTING_URL")
                .unwrap_or_else(|| DEFAULT_LISTING_URL.to_string()),
            output_dir: lookup("EOTRACK_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("output")),
            orders_file: lookup("EOTRACK_ORDERS_FILE")
                .unwrap_or_else(|| "executive_orders.csv".to_string()),
            analysis_file: lookup("EOTRACK_ANALYSIS_FILE")
                .unwrap_or_else(|| "analysis.csv".to_string()),
            posts_file: lookup("EOTRACK_POSTS_FILE").unwrap_or_else(|| "x_posts.csv".to_string()),
            prompts_dir: lookup("EOTRACK_PROMPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("prompts")),
            listing_limit: lookup("EOTRACK_LISTING_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_LISTING_LIMIT),
            user_agent: lookup("EOTRACK_USER_AGENT")
                .unwrap_or_else(|| "eotrack/0.1".to_string()),
            http_timeout_secs: lookup("EOTRACK_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            openai_model: lookup("EOTRACK_OPENAI_MODEL")
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            openai_timeout_secs: lookup("EOTRACK_OPENAI_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TIMEOUT.as_secs()),
        }
    }

    pub fn orders_path(&self) -> PathBuf {
        self.output_dir.join(&self.orders_file)
    }

    pub fn analysis_path(&self) -> PathBuf {
        self.output_dir.join(&self.analysis_file)
    }

    pub fn posts_path(&self) -> PathBuf {
        self.output_dir.join(&self.posts_file)
    }

    pub fn record_store(&self) -> CsvRecordStore {
        CsvRecordStore::new(self.orders_path(), self.analysis_path(), self.posts_path())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enrichment_enabled: bool,
    pub candidates: usize,
    pub collisions: usize,
    pub new_orders: usize,
    pub content_skipped: usize,
    pub enrichment_failures: usize,
    pub analyses: usize,
    pub posts: usize,
}

struct Enricher {
    generator: Box<dyn Generator>,
    prompts: PromptSet,
}

#[derive(Default)]
struct EnrichmentBatch {
    analyses: Vec<AnalysisRecord>,
    posts: Vec<PostRecord>,
    content_skipped: usize,
    failures: usize,
}

pub struct IngestPipeline {
    listing_url: String,
    listing: Box<dyn ListingSource>,
    content: Box<dyn ContentSource>,
    store: Box<dyn RecordStore>,
    enricher: Option<Enricher>,
}

impl IngestPipeline {
    pub fn new(
        listing_url: impl Into<String>,
        listing: Box<dyn ListingSource>,
        content: Box<dyn ContentSource>,
        store: Box<dyn RecordStore>,
    ) -> Self {
        Self {
            listing_url: listing_url.into(),
            listing,
            content,
            store,
            enricher: None,
        }
    }

    pub fn with_enrichment(mut self, generator: Box<dyn Generator>, prompts: PromptSet) -> Self {
        self.enricher = Some(Enricher { generator, prompts });
        self
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source = self.listing.source_id());
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();

        let existing = self.store.load_orders().await?;
        let existing_ids: HashSet<Identifier> = existing.iter().map(|row| row.id.clone()).collect();
        info!(existing = existing_ids.len(), "loaded stored orders");

        let candidates = match self.listing.fetch_listing(&self.listing_url).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "listing fetch failed; continuing with no candidates");
                Vec::new()
            }
        };
        let candidate_count = candidates.len();

        let collisions = find_collisions(&candidates, &existing);
        for collision in &collisions {
            warn!(
                id = %collision.id,
                known_title = %collision.known_title,
                known_link = %collision.known_link,
                candidate_title = %collision.candidate_title,
                candidate_link = %collision.candidate_link,
                "identifier collision between distinct records"
            );
        }

        let new_items = reconcile(candidates, &existing_ids);
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            enrichment_enabled: self.enricher.is_some(),
            candidates: candidate_count,
            collisions: collisions.len(),
            new_orders: new_items.len(),
            content_skipped: 0,
            enrichment_failures: 0,
            analyses: 0,
            posts: 0,
        };

        if new_items.is_empty() {
            info!(candidates = candidate_count, "no new orders found");
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let batch = match &self.enricher {
            Some(enricher) => self.enrich_all(enricher, &new_items).await,
            None => EnrichmentBatch::default(),
        };

        let orders: Vec<OrderRecord> = new_items.iter().map(OrderRecord::from).collect();
        let report = self.store.persist_orders(orders).await?;
        info!(saved = new_items.len(), total = report.total, "saved new orders");

        summary.content_skipped = batch.content_skipped;
        summary.enrichment_failures = batch.failures;
        summary.analyses = batch.analyses.len();
        summary.posts = batch.posts.len();

        if !batch.analyses.is_empty() {
            let report = self.store.persist_analyses(batch.analyses).await?;
            info!(saved = summary.analyses, total = report.total, "saved analysis records");
        }
        if !batch.posts.is_empty() {
            let report = self.store.persist_posts(batch.posts).await?;
            info!(saved = summary.posts, total = report.total, "saved post records");
        }

        for item in &new_items {
            info!(id = %item.id(), title = %item.title, "new order");
        }

        summary.finished_at = Utc::now();
        Ok(summary)
    }

    async fn enrich_all(&self, enricher: &Enricher, items: &[CandidateRecord]) -> EnrichmentBatch {
        let mut batch = EnrichmentBatch::default();
        for item in items {
            let id = item.id();
            let span = info_span!("enrich_item", %id);
            self.enrich_one(enricher, item, id, &mut batch)
                .instrument(span)
                .await;
        }
        batch
    }

    async fn enrich_one(
        &self,
        enricher: &Enricher,
        item: &CandidateRecord,
        id: Identifier,
        batch: &mut EnrichmentBatch,
    ) {
        info!(title = %item.title, "fetching order content");
        let body = match self.content.fetch_body(&item.link).await {
            Ok(body) if !body.trim().is_empty() => body,
            Ok(_) => {
                info!(title = %item.title, "empty content; skipping enrichment");
                batch.content_skipped += 1;
                return;
            }
            Err(err) => {
                info!(title = %item.title, error = %err, "no content; skipping enrichment");
                batch.content_skipped += 1;
                return;
            }
        };

        let generator = enricher.generator.as_ref();
        match generator.generate(&body, &enricher.prompts.analysis).await {
            Ok(analysis) => {
                info!(generator = generator.name(), "analysis generated");
                batch.analyses.push(AnalysisRecord {
                    id: id.clone(),
                    analysis,
                });
            }
            Err(err) => {
                warn!(generator = generator.name(), error = %err, "analysis generation failed");
                batch.failures += 1;
            }
        }

        match generator.generate(&body, &enricher.prompts.posts).await {
            Ok(reply) => {
                let posts = parse_bullet_posts(&reply);
                info!(generator = generator.name(), posts = posts.len(), "posts generated");
                batch.posts.extend(posts.into_iter().map(|post| PostRecord {
                    id: id.clone(),
                    post,
                }));
            }
            Err(err) => {
                warn!(generator = generator.name(), error = %err, "posts generation failed");
                batch.failures += 1;
            }
        }
    }
}

/// Builds the generator on its own client, so page-fetch timeouts never cut off a
/// completion. `None` when no API key is configured.
pub fn build_generator(config: &SyncConfig, api_key: Option<String>) -> Result<Option<OpenAiGenerator>> {
    let client = generation_client(Duration::from_secs(config.openai_timeout_secs))?;
    Ok(OpenAiGenerator::from_key(client, api_key, config.openai_model.clone()))
}

/// Wires the White House adapter, CSV tables and, when an API key is present, the
/// OpenAI generator.
pub async fn build_pipeline(config: &SyncConfig) -> Result<IngestPipeline> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let adapter = WhiteHouseAdapter::new(http, config.listing_limit);
    let pipeline = IngestPipeline::new(
        config.listing_url.clone(),
        Box::new(adapter.clone()),
        Box::new(adapter),
        Box::new(config.record_store()),
    );

    match build_generator(config, std::env::var("OPENAI_API_KEY").ok())? {
        Some(generator) => {
            let prompts = PromptSet::load(&config.prompts_dir).await?;
            Ok(pipeline.with_enrichment(Box::new(generator), prompts))
        }
        None => Ok(pipeline),
    }
}

pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncRunSummary> {
    build_pipeline(config).await?.run_once().await
}

#[derive(Debug, Clone, Serialize)]
pub struct TableOverview {
    pub orders: usize,
    pub analyses: usize,
    pub posts: usize,
    /// Last rows of the orders table, oldest first.
    pub latest_orders: Vec<OrderRecord>,
}

pub async fn table_overview(config: &SyncConfig, latest: usize) -> Result<TableOverview> {
    let store = config.record_store();
    let orders = store.orders().load().await?;
    let analyses = store.analyses().load().await?;
    let posts = store.posts().load().await?;

    let skip = orders.len().saturating_sub(latest);
    Ok(TableOverview {
        orders: orders.len(),
        analyses: analyses.len(),
        posts: posts.len(),
        latest_orders: orders.into_iter().skip(skip).collect(),
    })
}
