//! Listing/detail source contracts + the White House presidential-actions adapter.

use async_trait::async_trait;
use eotrack_core::CandidateRecord;
use eotrack_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "eotrack-adapters";

pub const LISTING_ITEM_SELECTOR: &str = "li.wp-block-post";
pub const TITLE_SELECTOR: &str = "h2.wp-block-post-title";
pub const LINK_SELECTOR: &str = "a";
pub const DATE_SELECTOR: &str = "time";
pub const CONTENT_SELECTOR: &str = "div.entry-content";

pub const MISSING_TITLE: &str = "No title found";
pub const MISSING_LINK: &str = "No link found";
pub const MISSING_DATE: &str = "No date available";

pub const DEFAULT_LISTING_LIMIT: usize = 5;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("listing {url} unavailable: {reason}")]
    SourceUnavailable { url: String, reason: String },
    #[error("content at {url} unavailable: {reason}")]
    ContentUnavailable { url: String, reason: String },
    #[error("content container `{selector}` not found at {url}")]
    MissingContainer { url: String, selector: &'static str },
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: &'static str, reason: String },
}

/// Produces candidate records from a listing page.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_listing(&self, url: &str) -> Result<Vec<CandidateRecord>, AdapterError>;
}

/// Produces the plain-text body behind a detail link.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch_body(&self, link: &str) -> Result<String, AdapterError>;
}

fn selector(raw: &'static str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Selector {
        selector: raw,
        reason: e.to_string(),
    })
}

/// Concatenates the element's text nodes, each trimmed, without separators.
fn stripped_text(element: ElementRef<'_>) -> String {
    element.text().map(str::trim).collect()
}

fn first_stripped_text(element: ElementRef<'_>, sel: &Selector) -> Option<String> {
    element.select(sel).next().map(stripped_text)
}

pub fn parse_listing_html(html: &str, limit: usize) -> Result<Vec<CandidateRecord>, AdapterError> {
    let document = Html::parse_document(html);
    let item_sel = selector(LISTING_ITEM_SELECTOR)?;
    let title_sel = selector(TITLE_SELECTOR)?;
    let link_sel = selector(LINK_SELECTOR)?;
    let date_sel = selector(DATE_SELECTOR)?;

    let items: Vec<_> = document.select(&item_sel).collect();
    info!(found = items.len(), limit, "listing items found");

    let candidates = items
        .into_iter()
        .take(limit)
        .map(|item| {
            let title_el = item.select(&title_sel).next();
            let title = title_el
                .map(stripped_text)
                .unwrap_or_else(|| MISSING_TITLE.to_string());
            let link = title_el
                .and_then(|t| t.select(&link_sel).next())
                .and_then(|a| a.value().attr("href"))
                .map(ToString::to_string)
                .unwrap_or_else(|| MISSING_LINK.to_string());
            let date_text =
                first_stripped_text(item, &date_sel).unwrap_or_else(|| MISSING_DATE.to_string());
            let candidate = CandidateRecord::new(title, link, date_text);
            debug!(
                id = %candidate.id(),
                title = %candidate.title,
                date = %candidate.date_text,
                link = %candidate.link,
                "extracted listing item"
            );
            candidate
        })
        .collect();

    Ok(candidates)
}

/// Text of the content container, one trimmed text node per line; `None` when the
/// container is absent.
pub fn parse_detail_html(html: &str) -> Result<Option<String>, AdapterError> {
    let document = Html::parse_document(html);
    let content_sel = selector(CONTENT_SELECTOR)?;
    Ok(document.select(&content_sel).next().map(|container| {
        container
            .text()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }))
}

#[derive(Debug, Clone)]
pub struct WhiteHouseAdapter {
    http: HttpFetcher,
    listing_limit: usize,
}

impl WhiteHouseAdapter {
    pub fn new(http: HttpFetcher, listing_limit: usize) -> Self {
        Self {
            http,
            listing_limit,
        }
    }
}

#[async_trait]
impl ListingSource for WhiteHouseAdapter {
    fn source_id(&self) -> &'static str {
        "whitehouse-presidential-actions"
    }

    async fn fetch_listing(&self, url: &str) -> Result<Vec<CandidateRecord>, AdapterError> {
        let page = self
            .http
            .fetch_bytes(url)
            .await
            .map_err(|e| AdapterError::SourceUnavailable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        parse_listing_html(&page.text(), self.listing_limit)
    }
}

#[async_trait]
impl ContentSource for WhiteHouseAdapter {
    async fn fetch_body(&self, link: &str) -> Result<String, AdapterError> {
        let page = self
            .http
            .fetch_bytes(link)
            .await
            .map_err(|e| AdapterError::ContentUnavailable {
                url: link.to_string(),
                reason: e.to_string(),
            })?;
        parse_detail_html(&page.text())?.ok_or_else(|| AdapterError::MissingContainer {
            url: link.to_string(),
            selector: CONTENT_SELECTOR,
        })
    }
}
