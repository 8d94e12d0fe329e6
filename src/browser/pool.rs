//! Shared browser pool.
//!
//! One headless Chrome process serves the whole service; the pool bounds
//! how many isolated contexts exist at once and hands out one per request.
//! Contexts are single-use: validation on release would only ever find a
//! context another request has dirtied, so the discipline is
//! destroy-on-release.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chromiumoxide::browser::Browser;
use sysinfo::System;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ReaderError, Result};

use super::context::{PageContext, PageContextOptions};
use super::setup::{LaunchedBrowser, launch_browser};

/// Pool sizing and launch settings
#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    pub headless: bool,
    /// Concurrent isolated contexts allowed; `detect` sizes this from free
    /// memory at startup
    pub max_contexts: usize,
}

impl BrowserPoolConfig {
    /// `1 + ⌊free GiB⌋` contexts, measured once at startup. Never below 1.
    pub fn detect(headless: bool) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let free_gib = sys.available_memory() / (1024 * 1024 * 1024);
        Self {
            headless,
            max_contexts: Self::max_for_free_gib(free_gib),
        }
    }

    pub(crate) fn max_for_free_gib(free_gib: u64) -> usize {
        1 + free_gib as usize
    }
}

/// Owns the browser process and vends per-request contexts
pub struct BrowserPool {
    config: BrowserPoolConfig,
    permits: Arc<Semaphore>,
    shared: Mutex<Option<LaunchedBrowser>>,
}

impl BrowserPool {
    pub fn new(config: BrowserPoolConfig) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_contexts));
        Arc::new(Self {
            config,
            permits,
            shared: Mutex::new(None),
        })
    }

    /// Launch the browser eagerly. Failure here is fatal to the pool and
    /// propagates to the caller.
    pub async fn start(&self) -> Result<()> {
        info!(
            max_contexts = self.config.max_contexts,
            "Starting browser pool"
        );
        let launched = launch_browser(self.config.headless)
            .await
            .map_err(|e| ReaderError::UpstreamBrowserFailure(format!("{e:#}")))?;
        *self.shared.lock().await = Some(launched);
        Ok(())
    }

    /// Acquire a fresh isolated context for one request.
    ///
    /// Suspends until a permit is free. If the browser died since the last
    /// acquire, one relaunch is attempted; a relaunch failure on top of the
    /// disconnect surfaces as a browser failure.
    pub async fn acquire(&self, url: &Url, opts: &PageContextOptions) -> Result<PageContext> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ReaderError::Internal("browser pool closed".into()))?;

        let browser = self.ensure_browser().await?;

        match PageContext::create(browser, url, opts, permit).await {
            Ok(ctx) => Ok(ctx),
            // A context failure destroys that context only; the pool and
            // browser stay up for other requests.
            Err(e) => Err(ReaderError::UpstreamBrowserFailure(format!("{e:#}"))),
        }
    }

    /// Current number of contexts that could still be created
    pub fn available_contexts(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_contexts(&self) -> usize {
        self.config.max_contexts
    }

    async fn ensure_browser(&self) -> Result<Arc<Browser>> {
        let mut guard = self.shared.lock().await;

        if let Some(launched) = guard.as_ref() {
            if !launched.disconnected.load(Ordering::SeqCst) {
                // Health check before handing out.
                match launched.browser.version().await {
                    Ok(_) => return Ok(Arc::clone(&launched.browser)),
                    Err(e) => warn!("Browser failed health check on acquire: {e}"),
                }
            } else {
                warn!("Browser disconnected, pool crippled; relaunching");
            }
        } else {
            debug!("No browser yet, launching");
        }

        if let Some(old) = guard.take() {
            old.handler.abort();
        }

        match launch_browser(self.config.headless).await {
            Ok(launched) => {
                let browser = Arc::clone(&launched.browser);
                *guard = Some(launched);
                info!("Browser relaunched, pool ready");
                Ok(browser)
            }
            Err(e) => Err(ReaderError::UpstreamBrowserFailure(format!(
                "browser relaunch failed: {e:#}"
            ))),
        }
    }

    /// Tear down the browser process and its event loop.
    pub async fn shutdown(&self) {
        info!("Shutting down browser pool");
        if let Some(launched) = self.shared.lock().await.take() {
            launched.handler.abort();
            // Dropping the last Arc<Browser> kills the child process.
            drop(launched.browser);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_bound_is_one_plus_free_gib() {
        assert_eq!(BrowserPoolConfig::max_for_free_gib(0), 1);
        assert_eq!(BrowserPoolConfig::max_for_free_gib(3), 4);
        assert_eq!(BrowserPoolConfig::max_for_free_gib(15), 16);
    }

    #[tokio::test]
    async fn permits_bound_concurrent_contexts() {
        let pool = BrowserPool::new(BrowserPoolConfig {
            headless: true,
            max_contexts: 2,
        });
        let a = Arc::clone(&pool.permits).acquire_owned().await.unwrap();
        let _b = Arc::clone(&pool.permits).acquire_owned().await.unwrap();
        assert_eq!(pool.available_contexts(), 0);

        // A third caller suspends until one releases.
        let third = Arc::clone(&pool.permits).try_acquire_owned();
        assert!(third.is_err());
        drop(a);
        assert!(Arc::clone(&pool.permits).try_acquire_owned().is_ok());
    }
}
