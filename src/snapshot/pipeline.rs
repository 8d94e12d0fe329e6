//! Drives one page load and streams progressive snapshots to the caller.
//!
//! The stream is pull-based: the channel holds a single item, so the
//! producer suspends until the consumer takes it. Yielded snapshots are
//! deduplicated against the previous one; the final item is always the
//! post-settle re-parse, even when identical to the last progressive one.

use std::sync::Arc;

use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, CaptureScreenshotParams};
use chromiumoxide::cdp::js_protocol::runtime::EventBindingCalled;
use futures::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use url::Url;

use crate::browser::inject::{FINAL_PARSE_SCRIPT, SNAPSHOT_BINDING};
use crate::browser::{BrowserPool, PageContextOptions};
use crate::config::NAVIGATION_TIMEOUT;
use crate::error::{ReaderError, Result};

use super::{PageResult, Snapshot};

/// Per-request scrape settings
#[derive(Debug, Clone, Default)]
pub struct ScrapeOptions {
    pub context: PageContextOptions,
    /// Capture a screenshot alongside each yielded snapshot
    pub with_screenshots: bool,
}

/// Scrape a URL into a lazy, finite, ordered sequence of [`PageResult`]s.
///
/// The sequence is not restartable. At least one result is yielded per
/// successful navigation; errors arrive as stream items and end the
/// sequence.
pub fn scrape(
    pool: Arc<BrowserPool>,
    url: Url,
    opts: ScrapeOptions,
) -> impl Stream<Item = Result<PageResult>> + Send + 'static {
    let (tx, rx) = mpsc::channel::<Result<PageResult>>(1);
    tokio::spawn(async move {
        if let Err(e) = drive(pool, url, opts, &tx).await {
            // Consumer may already be gone; a failed send is deliberate
            // silence, not a fault.
            let _ = tx.send(Err(e)).await;
        }
    });
    ReceiverStream::new(rx)
}

async fn drive(
    pool: Arc<BrowserPool>,
    url: Url,
    opts: ScrapeOptions,
    tx: &mpsc::Sender<Result<PageResult>>,
) -> Result<()> {
    let ctx = pool.acquire(&url, &opts.context).await?;
    let page = ctx.page().clone();

    let mut reports = page
        .event_listener::<EventBindingCalled>()
        .await
        .map_err(|e| ReaderError::UpstreamBrowserFailure(format!("binding listener: {e}")))?;

    // Navigation races against incoming snapshot reports below.
    let nav_page = page.clone();
    let nav_url = url.clone();
    let mut navigation = tokio::spawn(async move {
        tokio::time::timeout(NAVIGATION_TIMEOUT, async {
            nav_page
                .goto(nav_url.as_str())
                .await
                .map_err(|e| ReaderError::UpstreamBrowserFailure(format!("goto: {e}")))?;
            nav_page
                .wait_for_navigation()
                .await
                .map_err(|e| ReaderError::UpstreamBrowserFailure(format!("settle: {e}")))?;
            Ok::<(), ReaderError>(())
        })
        .await
        .map_err(|_| {
            ReaderError::UpstreamBrowserFailure(format!(
                "navigation timed out after {}s",
                NAVIGATION_TIMEOUT.as_secs()
            ))
        })?
    });

    let mut last: Option<Snapshot> = None;
    let mut listener_open = true;
    loop {
        tokio::select! {
            nav_result = &mut navigation => {
                match nav_result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(join_err) => {
                        return Err(ReaderError::Internal(format!("navigation task: {join_err}")));
                    }
                }
                // Post-settle re-parse is the authoritative final result.
                let snapshot = final_parse(&page).await?;
                let screenshot = maybe_screenshot(&page, opts.with_screenshots).await;
                let _ = tx
                    .send(Ok(PageResult {
                        url: url.to_string(),
                        snapshot,
                        screenshot,
                    }))
                    .await;
                debug!(url = %url, "scrape settled");
                break;
            }
            report = reports.next(), if listener_open => {
                let Some(event) = report else {
                    // Listener channel closed; only the navigation arm can
                    // finish the load now.
                    listener_open = false;
                    continue;
                };
                if event.name != SNAPSHOT_BINDING {
                    continue;
                }
                let snapshot: Snapshot = match serde_json::from_str(&event.payload) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(url = %url, "unparseable snapshot report: {e}");
                        continue;
                    }
                };
                if last.as_ref() == Some(&snapshot) {
                    continue;
                }
                last = Some(snapshot.clone());
                let screenshot = maybe_screenshot(&page, opts.with_screenshots).await;
                if tx
                    .send(Ok(PageResult {
                        url: url.to_string(),
                        snapshot,
                        screenshot,
                    }))
                    .await
                    .is_err()
                {
                    // Consumer disconnected mid-load.
                    debug!(url = %url, "scrape consumer went away");
                    break;
                }
            }
        }
    }

    // ctx drops here, disposing the context and aborting any leftover load.
    Ok(())
}

async fn final_parse(page: &Page) -> Result<Snapshot> {
    let result = page
        .evaluate(FINAL_PARSE_SCRIPT)
        .await
        .map_err(|e| ReaderError::UpstreamBrowserFailure(format!("final parse: {e}")))?;
    let value: serde_json::Value = result
        .into_value()
        .map_err(|e| ReaderError::UpstreamBrowserFailure(format!("final parse value: {e}")))?;
    serde_json::from_value(value)
        .map_err(|e| ReaderError::UpstreamBrowserFailure(format!("final parse shape: {e}")))
}

async fn maybe_screenshot(page: &Page, enabled: bool) -> Option<Vec<u8>> {
    if !enabled {
        return None;
    }
    let params = CaptureScreenshotParams {
        format: Some(CaptureScreenshotFormat::Png),
        ..Default::default()
    };
    match page.screenshot(params).await {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("screenshot capture failed: {e}");
            None
        }
    }
}
