//! Core domain model, identity, and reconciliation for eotrack.

use std::collections::{HashMap, HashSet};
use std::fmt;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "eotrack-core";

/// Number of hex characters kept from the title+link digest.
pub const IDENTIFIER_LEN: usize = 10;

/// Marker that opens a post line in generated bullet lists.
pub const BULLET_MARKER: &str = "- ";

/// Stable short key derived from a record's title and link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// MD5 of `title` followed by `link`, hex encoded and cut to [`IDENTIFIER_LEN`].
pub fn generate_id(title: &str, link: &str) -> Identifier {
    let mut hasher = Md5::new();
    hasher.update(title.as_bytes());
    hasher.update(link.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(IDENTIFIER_LEN);
    Identifier(digest)
}

/// Freshly scraped listing entry. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub title: String,
    pub link: String,
    pub date_text: String,
}

impl CandidateRecord {
    pub fn new(
        title: impl Into<String>,
        link: impl Into<String>,
        date_text: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            date_text: date_text.into(),
        }
    }

    pub fn id(&self) -> Identifier {
        generate_id(&self.title, &self.link)
    }
}

/// Canonical persisted order row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    #[serde(rename = "ID")]
    pub id: Identifier,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Link")]
    pub link: String,
}

impl From<&CandidateRecord> for OrderRecord {
    fn from(candidate: &CandidateRecord) -> Self {
        Self {
            id: candidate.id(),
            title: candidate.title.clone(),
            date: candidate.date_text.clone(),
            link: candidate.link.clone(),
        }
    }
}

/// Long-form markdown analysis, at most one per identifier after merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    #[serde(rename = "ID")]
    pub id: Identifier,
    #[serde(rename = "Analysis")]
    pub analysis: String,
}

/// One generated social post; an identifier may own several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    #[serde(rename = "ID")]
    pub id: Identifier,
    #[serde(rename = "X_Post")]
    pub post: String,
}

/// Keeps the candidates whose identifier has not been persisted yet, in scrape order.
///
/// Candidates sharing an identifier within the batch are all kept; the table merge
/// decides which one survives.
pub fn reconcile(
    candidates: Vec<CandidateRecord>,
    existing_ids: &HashSet<Identifier>,
) -> Vec<CandidateRecord> {
    candidates
        .into_iter()
        .filter(|candidate| !existing_ids.contains(&candidate.id()))
        .collect()
}

/// Two different title/link pairs that hash to the same identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierCollision {
    pub id: Identifier,
    pub known_title: String,
    pub known_link: String,
    pub candidate_title: String,
    pub candidate_link: String,
}

/// Reports candidates whose identifier is already taken by a different title/link pair,
/// either in `existing` or earlier in the same batch.
pub fn find_collisions(
    candidates: &[CandidateRecord],
    existing: &[OrderRecord],
) -> Vec<IdentifierCollision> {
    let mut known: HashMap<Identifier, (&str, &str)> = existing
        .iter()
        .map(|row| (row.id.clone(), (row.title.as_str(), row.link.as_str())))
        .collect();

    let mut collisions = Vec::new();
    for candidate in candidates {
        let id = candidate.id();
        match known.get(&id) {
            Some((title, link)) if *title != candidate.title || *link != candidate.link => {
                collisions.push(IdentifierCollision {
                    id,
                    known_title: title.to_string(),
                    known_link: link.to_string(),
                    candidate_title: candidate.title.clone(),
                    candidate_link: candidate.link.clone(),
                });
            }
            Some(_) => {}
            None => {
                known.insert(id, (candidate.title.as_str(), candidate.link.as_str()));
            }
        }
    }
    collisions
}

/// Extracts posts from a markdown bullet list; anything that is not a `- ` bullet is dropped.
pub fn parse_bullet_posts(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix(BULLET_MARKER))
        .map(|post| post.trim().to_string())
        .collect()
}
