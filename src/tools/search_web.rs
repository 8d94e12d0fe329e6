//! `searchWeb` tool: DuckDuckGo search through the shared browser.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::browser::{BrowserPool, PageContextOptions};
use crate::error::{ReaderError, Result};

use super::Tool;

/// Non-JS DuckDuckGo endpoint; results render server-side
const SEARCH_URL: &str = "https://html.duckduckgo.com/html/";

/// Maximum results returned per query
const MAX_RESULTS: usize = 10;

/// Extracts `{url, title, description}` triples from the results page
const RESULTS_SCRIPT: &str = r#"
(() => {
    const out = [];
    for (const el of document.querySelectorAll('.result')) {
        const link = el.querySelector('.result__a');
        const snippet = el.querySelector('.result__snippet');
        if (!link || !link.href) continue;
        out.push({
            url: link.href,
            title: (link.textContent || '').trim(),
            description: snippet ? (snippet.textContent || '').trim() : '',
        });
    }
    return out;
})()
"#;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchWebArgs {
    /// The query text to search for
    pub text: String,
}

/// One web search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub description: String,
}

/// Runs a search in an isolated browser context
pub struct SearchWebTool {
    pool: Arc<BrowserPool>,
}

impl SearchWebTool {
    pub fn new(pool: Arc<BrowserPool>) -> Self {
        Self { pool }
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let mut search_url = Url::parse(SEARCH_URL)
            .map_err(|e| ReaderError::Internal(format!("search base url: {e}")))?;
        search_url.query_pairs_mut().append_pair("q", query);

        info!(%search_url, "searching web");
        let ctx = self
            .pool
            .acquire(&search_url, &PageContextOptions::default())
            .await?;
        let page = ctx.page();

        tokio::time::timeout(Duration::from_secs(20), async {
            page.goto(search_url.as_str())
                .await
                .map_err(|e| ReaderError::UpstreamBrowserFailure(format!("search goto: {e}")))?;
            page.wait_for_navigation()
                .await
                .map_err(|e| ReaderError::UpstreamBrowserFailure(format!("search settle: {e}")))?;
            Ok::<(), ReaderError>(())
        })
        .await
        .map_err(|_| ReaderError::UpstreamBrowserFailure("search timed out".into()))??;

        let result = page
            .evaluate(RESULTS_SCRIPT)
            .await
            .map_err(|e| ReaderError::UpstreamBrowserFailure(format!("search extract: {e}")))?;
        let value: Value = result
            .into_value()
            .map_err(|e| ReaderError::UpstreamBrowserFailure(format!("search value: {e}")))?;
        let mut hits: Vec<SearchHit> = serde_json::from_value(value)
            .map_err(|e| ReaderError::UpstreamBrowserFailure(format!("search shape: {e}")))?;
        hits.truncate(MAX_RESULTS);
        debug!(count = hits.len(), "search complete");
        Ok(hits)
    }
}

#[async_trait]
impl Tool for SearchWebTool {
    fn name(&self) -> &'static str {
        "searchWeb"
    }

    fn description(&self) -> &'static str {
        "Search the web and return result URLs with titles and descriptions."
    }

    fn parameters(&self) -> Value {
        serde_json::to_value(schema_for!(SearchWebArgs)).unwrap_or_else(|_| Value::Null)
    }

    async fn invoke(&self, args: Value) -> Result<String> {
        let args: SearchWebArgs = serde_json::from_value(args)
            .map_err(|e| ReaderError::InvalidArgument(format!("searchWeb arguments: {e}")))?;
        if args.text.trim().is_empty() {
            return Err(ReaderError::InvalidArgument(
                "searchWeb text must not be empty".into(),
            ));
        }
        let hits = self.search(&args.text).await?;
        serde_json::to_string(&hits)
            .map_err(|e| ReaderError::Internal(format!("serializing search hits: {e}")))
    }
}
