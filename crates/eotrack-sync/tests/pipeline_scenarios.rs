use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eotrack_adapters::{AdapterError, ContentSource, ListingSource};
use eotrack_core::{AnalysisRecord, CandidateRecord, OrderRecord, PostRecord};
use eotrack_enrich::{EnrichmentError, Generator, PromptProfile, PromptSet};
use eotrack_storage::{CsvRecordStore, CsvTable, RecordStore};
use eotrack_sync::IngestPipeline;
use tempfile::{tempdir, TempDir};

const LISTING_URL: &str = "https://example.gov/presidential-actions/";

struct FakeListing {
    candidates: Option<Vec<CandidateRecord>>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ListingSource for FakeListing {
    fn source_id(&self) -> &'static str {
        "fake-listing"
    }

    async fn fetch_listing(&self, url: &str) -> Result<Vec<CandidateRecord>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.candidates
            .clone()
            .ok_or_else(|| AdapterError::SourceUnavailable {
                url: url.to_string(),
                reason: "http status 503".to_string(),
            })
    }
}

struct FakeContent {
    bodies: HashMap<String, String>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ContentSource for FakeContent {
    async fn fetch_body(&self, link: &str) -> Result<String, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies
            .get(link)
            .cloned()
            .ok_or_else(|| AdapterError::ContentUnavailable {
                url: link.to_string(),
                reason: "http status 404".to_string(),
            })
    }
}

#[derive(Clone)]
struct FakeGenerator {
    fail_analysis: bool,
    posts_reply: String,
    calls: Arc<Mutex<Vec<(&'static str, String)>>>,
}

#[async_trait]
impl Generator for FakeGenerator {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn generate(&self, text: &str, profile: &PromptProfile) -> Result<String, EnrichmentError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((profile.name, text.to_string()));
        match profile.name {
            "analysis" if self.fail_analysis => Err(EnrichmentError::Status {
                status: 500,
                body: "upstream error".to_string(),
            }),
            "analysis" => Ok(format!("## Analysis\n\n{}", first_line(text))),
            _ => Ok(self.posts_reply.clone()),
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

fn candidate(slug: &str) -> CandidateRecord {
    CandidateRecord::new(
        format!("Order {slug}"),
        format!("https://example.gov/presidential-actions/{slug}/"),
        "March 3, 2025",
    )
}

fn prompts() -> PromptSet {
    PromptSet {
        analysis: PromptProfile::analysis("Analyze."),
        posts: PromptProfile::posts("Post."),
    }
}

struct Harness {
    dir: TempDir,
    listing_calls: Arc<AtomicUsize>,
    content_calls: Arc<AtomicUsize>,
    generator: FakeGenerator,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempdir().expect("tempdir"),
            listing_calls: Arc::default(),
            content_calls: Arc::default(),
            generator: FakeGenerator {
                fail_analysis: false,
                posts_reply: "Here are the posts:\n- First post\n- Second post\nThanks".to_string(),
                calls: Arc::default(),
            },
        }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }

    fn store(&self) -> CsvRecordStore {
        CsvRecordStore::new(
            self.path("executive_orders.csv"),
            self.path("analysis.csv"),
            self.path("x_posts.csv"),
        )
    }

    fn pipeline(
        &self,
        candidates: Option<Vec<CandidateRecord>>,
        bodies: &[(&CandidateRecord, &str)],
        enrich: bool,
    ) -> IngestPipeline {
        let listing = FakeListing {
            candidates,
            calls: self.listing_calls.clone(),
        };
        let content = FakeContent {
            bodies: bodies
                .iter()
                .map(|(c, body)| (c.link.clone(), body.to_string()))
                .collect(),
            calls: self.content_calls.clone(),
        };
        let pipeline = IngestPipeline::new(
            LISTING_URL,
            Box::new(listing),
            Box::new(content),
            Box::new(self.store()),
        );
        if enrich {
            pipeline.with_enrichment(Box::new(self.generator.clone()), prompts())
        } else {
            pipeline
        }
    }

    fn generator_calls(&self) -> usize {
        self.generator.calls.lock().expect("calls lock").len()
    }

    async fn orders(&self) -> Vec<OrderRecord> {
        CsvTable::<OrderRecord>::new(self.path("executive_orders.csv"))
            .load()
            .await
            .expect("load orders")
    }

    async fn analyses(&self) -> Vec<AnalysisRecord> {
        CsvTable::<AnalysisRecord>::new(self.path("analysis.csv"))
            .load()
            .await
            .expect("load analyses")
    }

    async fn posts(&self) -> Vec<PostRecord> {
        CsvTable::<PostRecord>::new(self.path("x_posts.csv"))
            .load()
            .await
            .expect("load posts")
    }
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).expect("read table")
}

#[tokio::test]
async fn only_unseen_candidates_are_persisted_in_scrape_order() {
    let h = Harness::new();
    let (a, b, c) = (candidate("a"), candidate("b"), candidate("c"));
    h.store()
        .persist_orders(vec![OrderRecord::from(&b)])
        .await
        .unwrap();

    let summary = h
        .pipeline(Some(vec![a.clone(), b.clone(), c.clone()]), &[], false)
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.new_orders, 2);
    assert_eq!(
        h.orders().await,
        vec![OrderRecord::from(&b), OrderRecord::from(&a), OrderRecord::from(&c)]
    );
}

#[tokio::test]
async fn missing_content_still_persists_the_order_without_enrichment() {
    let h = Harness::new();
    let (with_body, without_body) = (candidate("with-body"), candidate("without-body"));

    let summary = h
        .pipeline(
            Some(vec![with_body.clone(), without_body.clone()]),
            &[(&with_body, "Section 1. Purpose.\nSection 2. Policy.")],
            true,
        )
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.new_orders, 2);
    assert_eq!(summary.content_skipped, 1);
    assert_eq!(h.orders().await.len(), 2);

    let skipped = without_body.id();
    assert!(h.analyses().await.iter().all(|r| r.id != skipped));
    assert!(h.posts().await.iter().all(|r| r.id != skipped));
    assert_eq!(
        h.analyses().await,
        vec![AnalysisRecord {
            id: with_body.id(),
            analysis: "## Analysis\n\nSection 1. Purpose.".to_string(),
        }]
    );
    assert_eq!(
        h.posts().await,
        vec![
            PostRecord {
                id: with_body.id(),
                post: "First post".to_string()
            },
            PostRecord {
                id: with_body.id(),
                post: "Second post".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn whitespace_only_content_counts_as_empty() {
    let h = Harness::new();
    let blank = candidate("blank");

    let summary = h
        .pipeline(Some(vec![blank.clone()]), &[(&blank, "  \n ")], true)
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.content_skipped, 1);
    assert_eq!(h.generator_calls(), 0);
    assert_eq!(h.orders().await, vec![OrderRecord::from(&blank)]);
    assert!(!h.path("analysis.csv").exists());
}

#[tokio::test]
async fn analysis_failure_does_not_block_posts_or_orders() {
    let mut h = Harness::new();
    h.generator.fail_analysis = true;
    let item = candidate("flaky");

    let summary = h
        .pipeline(Some(vec![item.clone()]), &[(&item, "Body text")], true)
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.enrichment_failures, 1);
    assert_eq!(summary.analyses, 0);
    assert_eq!(summary.posts, 2);
    assert_eq!(h.orders().await.len(), 1);
    assert!(!h.path("analysis.csv").exists());
    assert_eq!(h.posts().await.len(), 2);
}

#[tokio::test]
async fn reply_without_bullets_writes_no_post_rows() {
    let mut h = Harness::new();
    h.generator.posts_reply = "I cannot produce posts for this document.".to_string();
    let item = candidate("prose");

    let summary = h
        .pipeline(Some(vec![item.clone()]), &[(&item, "Body text")], true)
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.posts, 0);
    assert_eq!(summary.enrichment_failures, 0);
    assert_eq!(h.analyses().await.len(), 1);
    assert!(!h.path("x_posts.csv").exists());
}

#[tokio::test]
async fn second_run_against_unchanged_source_adds_nothing() {
    let h = Harness::new();
    let items = vec![candidate("one"), candidate("two")];
    let bodies: Vec<_> = items.iter().map(|c| (c, "Body text")).collect();

    let first = h
        .pipeline(Some(items.clone()), &bodies, true)
        .run_once()
        .await
        .unwrap();
    let calls_after_first = h.generator_calls();
    let snapshot: Vec<_> = ["executive_orders.csv", "analysis.csv", "x_posts.csv"]
        .iter()
        .map(|name| read(&h.path(name)))
        .collect();

    let second = h
        .pipeline(Some(items.clone()), &bodies, true)
        .run_once()
        .await
        .unwrap();

    assert_eq!(first.new_orders, 2);
    assert_eq!(second.new_orders, 0);
    assert_eq!(second.analyses + second.posts, 0);
    assert_eq!(h.generator_calls(), calls_after_first);
    let after: Vec<_> = ["executive_orders.csv", "analysis.csv", "x_posts.csv"]
        .iter()
        .map(|name| read(&h.path(name)))
        .collect();
    assert_eq!(snapshot, after);
}

#[tokio::test]
async fn unavailable_listing_writes_nothing() {
    let h = Harness::new();

    let summary = h.pipeline(None, &[], true).run_once().await.unwrap();

    assert_eq!(h.listing_calls.load(Ordering::SeqCst), 1);
    assert_eq!(summary.candidates, 0);
    assert_eq!(summary.new_orders, 0);
    assert_eq!(h.content_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.generator_calls(), 0);
    assert_eq!(std::fs::read_dir(h.dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn disabled_enrichment_persists_orders_only() {
    let h = Harness::new();
    let item = candidate("plain");

    let summary = h
        .pipeline(Some(vec![item.clone()]), &[(&item, "Body text")], false)
        .run_once()
        .await
        .unwrap();

    assert!(!summary.enrichment_enabled);
    assert_eq!(h.content_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.orders().await, vec![OrderRecord::from(&item)]);
    assert!(!h.path("analysis.csv").exists());
    assert!(!h.path("x_posts.csv").exists());
}

#[tokio::test]
async fn duplicate_candidates_in_one_batch_keep_the_later_row() {
    let h = Harness::new();
    let first = candidate("dup");
    let mut later = first.clone();
    later.date_text = "March 4, 2025".to_string();

    let summary = h
        .pipeline(Some(vec![first, later.clone()]), &[], false)
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.new_orders, 2);
    assert_eq!(h.orders().await, vec![OrderRecord::from(&later)]);
}
