//! `browse` tool: read a URL into Markdown.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::browser::BrowserPool;
use crate::error::{ReaderError, Result};
use crate::formatter::{FormatPolicy, Formatter, RespondWith};
use crate::snapshot::{ScrapeOptions, scrape};

use super::Tool;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BrowseArgs {
    /// The http(s) URL to read
    pub url: String,
}

/// Reads a page through the snapshot pipeline and returns its Markdown
pub struct BrowseTool {
    pool: Arc<BrowserPool>,
    formatter: Arc<Formatter>,
}

impl BrowseTool {
    pub fn new(pool: Arc<BrowserPool>, formatter: Arc<Formatter>) -> Self {
        Self { pool, formatter }
    }
}

#[async_trait]
impl Tool for BrowseTool {
    fn name(&self) -> &'static str {
        "browse"
    }

    fn description(&self) -> &'static str {
        "Fetch a web page and return its readable content as Markdown."
    }

    fn parameters(&self) -> Value {
        serde_json::to_value(schema_for!(BrowseArgs)).unwrap_or_else(|_| Value::Null)
    }

    async fn invoke(&self, args: Value) -> Result<String> {
        let args: BrowseArgs = serde_json::from_value(args)
            .map_err(|e| ReaderError::InvalidArgument(format!("browse arguments: {e}")))?;
        let url = Url::parse(&args.url)
            .map_err(|e| ReaderError::InvalidArgument(format!("browse url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ReaderError::InvalidArgument(format!(
                "browse url scheme must be http or https, got {}",
                url.scheme()
            )));
        }

        debug!(%url, "browse tool reading page");
        let mut stream = scrape(Arc::clone(&self.pool), url, ScrapeOptions::default());
        let mut last = None;
        while let Some(item) = stream.next().await {
            last = Some(item?);
        }
        let page =
            last.ok_or_else(|| ReaderError::UpstreamBrowserFailure("empty scrape".into()))?;

        let formatted = self
            .formatter
            .format_with_fallback(RespondWith::Default, &page, &FormatPolicy::default())
            .await?;
        Ok(formatted.content.unwrap_or_default())
    }
}
