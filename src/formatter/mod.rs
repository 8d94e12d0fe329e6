//! Snapshot formatting.
//!
//! Converts a [`Snapshot`] into the caller's requested representation and
//! applies the per-request rendering policies (generated alt text, link and
//! image summaries).

pub mod expand;

use std::sync::Arc;

use htmd::HtmlToMarkdown;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ReaderError, Result};
use crate::snapshot::PageResult;
use crate::storage::ObjectStore;

/// Output representation selected by `X-Respond-With`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RespondWith {
    /// Extracted article as Markdown; no fallback when extraction is empty
    #[default]
    Default,
    /// Full-page Markdown regardless of readability success
    Markdown,
    Html,
    Text,
    Screenshot,
}

impl RespondWith {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "default" => Some(Self::Default),
            "markdown" => Some(Self::Markdown),
            "html" => Some(Self::Html),
            "text" => Some(Self::Text),
            "screenshot" => Some(Self::Screenshot),
            _ => None,
        }
    }
}

/// Rendering policies from request headers
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatPolicy {
    pub with_generated_alt: bool,
    pub with_images_summary: bool,
    pub with_links_summary: bool,
}

/// A formatted page ready for the response body
#[derive(Debug, Clone, Serialize)]
pub struct FormattedPage {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Markdown rendering, when the mode produces one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(skip)]
    mode: RespondWith,
}

impl FormattedPage {
    /// Body in the caller's chosen format
    pub fn render(&self) -> String {
        match self.mode {
            RespondWith::Default | RespondWith::Markdown => {
                let mut out = String::new();
                if let Some(title) = &self.title
                    && !title.is_empty()
                {
                    out.push_str(&format!("Title: {title}\n\n"));
                }
                out.push_str(&format!("URL Source: {}\n\n", self.url));
                out.push_str("Markdown Content:\n");
                out.push_str(self.content.as_deref().unwrap_or(""));
                out
            }
            RespondWith::Html => self.html.clone().unwrap_or_default(),
            RespondWith::Text => self.text.clone().unwrap_or_default(),
            RespondWith::Screenshot => self.screenshot_url.clone().unwrap_or_default(),
        }
    }
}

/// Converts snapshots into response bodies
pub struct Formatter {
    objects: Arc<dyn ObjectStore>,
}

impl Formatter {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    /// Format one page result in the requested mode.
    ///
    /// `Default` with an empty extraction returns `content: None`; the
    /// caller decides whether to retry as `Markdown`. No fallback happens
    /// here.
    pub async fn format_page(
        &self,
        mode: RespondWith,
        page: &PageResult,
        policy: &FormatPolicy,
    ) -> Result<FormattedPage> {
        let snapshot = &page.snapshot;
        let mut formatted = FormattedPage {
            url: page.url.clone(),
            title: non_empty(&snapshot.title),
            content: None,
            html: None,
            text: None,
            screenshot_url: None,
            mode,
        };

        match mode {
            RespondWith::Default => {
                if snapshot.has_content() {
                    formatted.content = Some(self.to_markdown(&snapshot.content, policy)?);
                }
            }
            RespondWith::Markdown => {
                if !snapshot.html.is_empty() {
                    formatted.content = Some(self.to_markdown(&snapshot.html, policy)?);
                }
            }
            RespondWith::Html => {
                formatted.html = Some(snapshot.html.clone());
            }
            RespondWith::Text => {
                formatted.text = Some(snapshot.text_content.clone());
            }
            RespondWith::Screenshot => {
                let bytes = page.screenshot.clone().ok_or_else(|| {
                    ReaderError::Internal("no screenshot captured for this page".into())
                })?;
                let name = format!("screenshots/{}.png", Uuid::new_v4());
                self.objects.put(&name, bytes, "image/png").await?;
                formatted.screenshot_url = Some(self.objects.public_url(&name));
            }
        }

        Ok(formatted)
    }

    /// Format with the default-then-markdown retry the read paths share.
    pub async fn format_with_fallback(
        &self,
        mode: RespondWith,
        page: &PageResult,
        policy: &FormatPolicy,
    ) -> Result<FormattedPage> {
        let formatted = self.format_page(mode, page, policy).await?;
        if mode == RespondWith::Default && formatted.content.is_none() {
            debug!(url = %page.url, "empty extraction, retrying as full-page markdown");
            return self.format_page(RespondWith::Markdown, page, policy).await;
        }
        Ok(formatted)
    }

    fn to_markdown(&self, html: &str, policy: &FormatPolicy) -> Result<String> {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(vec!["script", "style", "noscript"])
            .build();
        let mut markdown = converter
            .convert(html)
            .map_err(|e| ReaderError::Internal(format!("markdown conversion: {e}")))?;

        if policy.with_generated_alt {
            markdown = generate_alt_text(&markdown);
        }
        if policy.with_links_summary {
            if let Some(summary) = links_summary(&markdown) {
                markdown.push_str(&summary);
            }
        }
        if policy.with_images_summary {
            if let Some(summary) = images_summary(&markdown) {
                markdown.push_str(&summary);
            }
        }
        Ok(markdown)
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

static IMAGE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)\s]+)\)").expect("static image token pattern"));

static LINK_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").expect("static link token pattern"));

/// Give bare images a derived alt text so downstream models see something
fn generate_alt_text(markdown: &str) -> String {
    let mut counter = 0usize;
    IMAGE_TOKEN
        .replace_all(markdown, |caps: &regex::Captures<'_>| {
            let alt = &caps[1];
            let url = &caps[2];
            if alt.trim().is_empty() {
                counter += 1;
                let name = url.rsplit('/').next().unwrap_or(url);
                format!("![Image {counter}: {name}]({url})")
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

fn links_summary(markdown: &str) -> Option<String> {
    let mut lines = Vec::new();
    for caps in LINK_TOKEN.captures_iter(markdown) {
        // Image tokens share the link shape; skip the ones a '!' precedes.
        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        if start > 0 && markdown.as_bytes()[start - 1] == b'!' {
            continue;
        }
        lines.push(format!("- [{}]({})", &caps[1], &caps[2]));
    }
    if lines.is_empty() {
        return None;
    }
    Some(format!("\n\nLinks/Buttons:\n{}\n", lines.join("\n")))
}

fn images_summary(markdown: &str) -> Option<String> {
    let mut lines = Vec::new();
    for caps in IMAGE_TOKEN.captures_iter(markdown) {
        lines.push(format!("- ![{}]({})", &caps[1], &caps[2]));
    }
    if lines.is_empty() {
        return None;
    }
    Some(format!("\n\nImages:\n{}\n", lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use crate::storage::MemoryObjectStore;

    fn snapshot(content: &str, html: &str) -> Snapshot {
        Snapshot {
            href: "https://example.com/".into(),
            title: "Example Domain".into(),
            content: content.into(),
            text_content: "Example body text".into(),
            html: html.into(),
            published_time: None,
        }
    }

    fn page(content: &str, html: &str) -> PageResult {
        PageResult {
            url: "https://example.com/".into(),
            snapshot: snapshot(content, html),
            screenshot: None,
        }
    }

    fn formatter() -> Formatter {
        Formatter::new(Arc::new(MemoryObjectStore::new()))
    }

    #[tokio::test]
    async fn default_mode_does_not_fall_back_by_itself() {
        let f = formatter();
        let p = page("", "<html><body><p>hello</p></body></html>");
        let out = f
            .format_page(RespondWith::Default, &p, &FormatPolicy::default())
            .await
            .unwrap();
        assert!(out.content.is_none());
    }

    #[tokio::test]
    async fn markdown_mode_converts_full_page_iff_html_nonempty() {
        let f = formatter();
        let with_html = page("", "<html><body><p>hello</p></body></html>");
        let out = f
            .format_page(RespondWith::Markdown, &with_html, &FormatPolicy::default())
            .await
            .unwrap();
        assert!(out.content.as_deref().unwrap().contains("hello"));

        let empty = page("", "");
        let out = f
            .format_page(RespondWith::Markdown, &empty, &FormatPolicy::default())
            .await
            .unwrap();
        assert!(out.content.is_none());
    }

    #[tokio::test]
    async fn fallback_retries_empty_default_as_markdown() {
        let f = formatter();
        let p = page("", "<html><body><p>fallback body</p></body></html>");
        let out = f
            .format_with_fallback(RespondWith::Default, &p, &FormatPolicy::default())
            .await
            .unwrap();
        assert!(out.content.as_deref().unwrap().contains("fallback body"));
    }

    #[tokio::test]
    async fn text_and_html_modes_pass_through() {
        let f = formatter();
        let p = page("<p>a</p>", "<html><body>raw</body></html>");
        let html = f
            .format_page(RespondWith::Html, &p, &FormatPolicy::default())
            .await
            .unwrap();
        assert_eq!(html.render(), "<html><body>raw</body></html>");
        let text = f
            .format_page(RespondWith::Text, &p, &FormatPolicy::default())
            .await
            .unwrap();
        assert_eq!(text.render(), "Example body text");
    }

    #[tokio::test]
    async fn screenshot_mode_uploads_and_links() {
        let store = Arc::new(MemoryObjectStore::new());
        let f = Formatter::new(Arc::clone(&store) as Arc<dyn ObjectStore>);
        let mut p = page("<p>a</p>", "<html></html>");
        p.screenshot = Some(vec![0x89, 0x50, 0x4e, 0x47]);
        let out = f
            .format_page(RespondWith::Screenshot, &p, &FormatPolicy::default())
            .await
            .unwrap();
        let url = out.screenshot_url.unwrap();
        assert!(url.starts_with("memory://screenshots/"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn policies_add_summaries_and_alt_text() {
        let f = formatter();
        let p = page(
            "<p><a href=\"https://a.test\">A link</a> and <img src=\"https://b.test/pic.png\"></p>",
            "",
        );
        let policy = FormatPolicy {
            with_generated_alt: true,
            with_images_summary: true,
            with_links_summary: true,
        };
        let out = f
            .format_page(RespondWith::Default, &p, &policy)
            .await
            .unwrap();
        let content = out.content.unwrap();
        assert!(content.contains("Links/Buttons:"));
        assert!(content.contains("Images:"));
        assert!(content.contains("![Image 1: pic.png]"));
    }

    #[test]
    fn render_leads_with_title_and_source() {
        let formatted = FormattedPage {
            url: "https://example.com/".into(),
            title: Some("Example Domain".into()),
            content: Some("body".into()),
            html: None,
            text: None,
            screenshot_url: None,
            mode: RespondWith::Default,
        };
        let body = formatted.render();
        assert!(body.starts_with("Title: Example Domain\n\nURL Source: https://example.com/\n\n"));
        assert!(body.ends_with("Markdown Content:\nbody"));
    }
}
