//! Page snapshots and the progressive scrape pipeline.

pub mod pipeline;

use serde::{Deserialize, Serialize};

pub use pipeline::{ScrapeOptions, scrape};

/// Readability's best current parse of the live DOM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub href: String,
    #[serde(default)]
    pub title: String,
    /// Article container HTML; empty when the parse found nothing usable
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub text_content: String,
    /// Full document HTML
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub published_time: Option<String>,
}

impl Snapshot {
    /// True when readability produced an article body
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// One progressive result from a page load. A load yields an ordered,
/// non-empty sequence of these; the last one is the post-settle final.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub url: String,
    pub snapshot: Snapshot,
    pub screenshot: Option<Vec<u8>>,
}
