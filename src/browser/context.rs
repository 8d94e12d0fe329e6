//! Per-request isolated browser context.
//!
//! Every request gets a fresh context so cookies and storage never bleed
//! between callers. The guard destroys the context on drop; contexts are
//! never reused.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use chromiumoxide::Page;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetCookiesParams, SetUserAgentOverrideParams};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::cdp::js_protocol::runtime::AddBindingParams;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};
use url::Url;

use crate::config::{READER_USER_AGENT, VIEWPORT_HEIGHT, VIEWPORT_WIDTH};

use super::inject::{EXTRACT_SCRIPT, REPORT_SCRIPT, SNAPSHOT_BINDING};

/// Per-request context settings carried in from request headers
#[derive(Debug, Clone, Default)]
pub struct PageContextOptions {
    /// Raw `Set-Cookie` header values forwarded into the context
    pub cookies: Vec<String>,
    /// Proxy server for this context (http/https/socks4/socks5)
    pub proxy: Option<String>,
}

/// An isolated browser context holding one configured page.
///
/// Holding the guard holds one pool permit; dropping it disposes the whole
/// context, which also aborts any in-flight navigation.
pub struct PageContext {
    page: Page,
    context_id: BrowserContextId,
    browser: Arc<Browser>,
    _permit: OwnedSemaphorePermit,
}

impl PageContext {
    /// Create a fresh context and page configured for one request.
    pub(super) async fn create(
        browser: Arc<Browser>,
        target_url: &Url,
        opts: &PageContextOptions,
        permit: OwnedSemaphorePermit,
    ) -> Result<Self> {
        let mut params = CreateBrowserContextParams::default();
        params.dispose_on_detach = Some(true);
        params.proxy_server = opts.proxy.clone();

        let response = browser
            .execute(params)
            .await
            .context("Failed to create browser context")?;
        let context_id = response.browser_context_id.clone();

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(anyhow::Error::msg)?;
        let page = browser
            .new_page(target)
            .await
            .context("Failed to create page in context")?;

        page.execute(SetUserAgentOverrideParams {
            user_agent: READER_USER_AGENT.to_string(),
            accept_language: Some("en-US,en;q=0.9".to_string()),
            platform: None,
            user_agent_metadata: None,
        })
        .await
        .context("Failed to set user agent")?;

        page.execute(
            SetDeviceMetricsOverrideParams::builder()
                .width(VIEWPORT_WIDTH)
                .height(VIEWPORT_HEIGHT)
                .device_scale_factor(1.0)
                .mobile(false)
                .build()
                .map_err(anyhow::Error::msg)?,
        )
        .await
        .context("Failed to set viewport")?;

        // Extraction + reporting run in every new document, so snapshots
        // flow even across same-context redirects.
        for source in [EXTRACT_SCRIPT, REPORT_SCRIPT] {
            page.execute(AddScriptToEvaluateOnNewDocumentParams {
                source: source.to_string(),
                include_command_line_api: None,
                world_name: None,
                run_immediately: None,
            })
            .await
            .context("Failed to inject page script")?;
        }

        page.execute(
            AddBindingParams::builder()
                .name(SNAPSHOT_BINDING)
                .build()
                .map_err(anyhow::Error::msg)?,
        )
        .await
        .context("Failed to register snapshot binding")?;

        if !opts.cookies.is_empty() {
            let cookies = parse_set_cookies(&opts.cookies, target_url)?;
            if !cookies.is_empty() {
                page.execute(SetCookiesParams { cookies })
                    .await
                    .context("Failed to set cookies")?;
            }
        }

        debug!(context = %context_id.inner(), "created browser context");
        Ok(Self {
            page,
            context_id,
            browser,
            _permit: permit,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageContext {
    fn drop(&mut self) {
        let browser = Arc::clone(&self.browser);
        let context_id = self.context_id.clone();
        tokio::spawn(async move {
            let params = match DisposeBrowserContextParams::builder()
                .browser_context_id(context_id.clone())
                .build()
            {
                Ok(p) => p,
                Err(e) => {
                    warn!("Failed to build context disposal params: {e}");
                    return;
                }
            };
            if let Err(e) = browser.execute(params).await {
                warn!(context = %context_id.inner(), "Failed to dispose browser context: {e}");
            } else {
                debug!(context = %context_id.inner(), "disposed browser context");
            }
        });
    }
}

/// Parse raw `Set-Cookie` values into CDP cookie params scoped to the
/// request URL. Malformed entries are skipped.
fn parse_set_cookies(raw: &[String], target_url: &Url) -> Result<Vec<CookieParam>> {
    let mut cookies = Vec::new();
    for header in raw {
        let Some(pair) = header.split(';').next() else {
            continue;
        };
        let Some((name, value)) = pair.split_once('=') else {
            warn!("Skipping malformed Set-Cookie value: {header}");
            continue;
        };
        let cookie = CookieParam::builder()
            .name(name.trim())
            .value(value.trim())
            .url(target_url.as_str())
            .build()
            .map_err(anyhow::Error::msg)?;
        cookies.push(cookie);
    }
    Ok(cookies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_cookie_values_parse_to_scoped_cookies() {
        let url = Url::parse("https://example.com/page").unwrap();
        let cookies = parse_set_cookies(
            &[
                "session=abc123; Path=/; HttpOnly".to_string(),
                "malformed-no-equals".to_string(),
                "theme=dark".to_string(),
            ],
            &url,
        )
        .unwrap();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "session");
        assert_eq!(cookies[0].value, "abc123");
        assert_eq!(cookies[1].name, "theme");
    }
}
