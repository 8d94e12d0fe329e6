//! Scripts injected into every new document.
//!
//! `EXTRACT_SCRIPT` defines the in-page readability parse; `REPORT_SCRIPT`
//! wires it to document lifecycle events and forwards results through the
//! `reportSnapshot` binding the host registers on the page.

/// Name of the host binding the in-page reporter calls
pub const SNAPSHOT_BINDING: &str = "reportSnapshot";

/// Defines `window.__readerExtract()`: a readability-style parse of the
/// live DOM. Returns `{href, title, content, textContent, html,
/// publishedTime}` where `content` is the chosen article container's HTML
/// and empty strings mean the parse found nothing usable.
pub const EXTRACT_SCRIPT: &str = r#"
(() => {
    if (window.__readerExtract) return;

    const STRIP = 'script, style, noscript, iframe, form, nav, header, footer, aside, [role="navigation"], [role="banner"], [aria-hidden="true"]';
    const CANDIDATES = 'article, main, [role="main"], #content, #main, .post-content, .article-body, .entry-content';

    function pickContainer(doc) {
        for (const el of doc.querySelectorAll(CANDIDATES)) {
            if (el.textContent && el.textContent.trim().length > 140) return el;
        }
        // Largest direct text block under body as a last resort
        let best = null, bestLen = 0;
        for (const el of doc.body ? doc.body.querySelectorAll('div, section') : []) {
            const len = (el.textContent || '').trim().length;
            if (len > bestLen) { best = el; bestLen = len; }
        }
        return bestLen > 140 ? best : null;
    }

    window.__readerExtract = () => {
        try {
            const doc = document.cloneNode(true);
            for (const el of doc.querySelectorAll(STRIP)) el.remove();
            const container = pickContainer(doc);
            const meta = (name) => {
                const tag = document.querySelector(
                    `meta[property="${name}"], meta[name="${name}"]`);
                return tag ? tag.getAttribute('content') : null;
            };
            return {
                href: document.location.href,
                title: document.title || '',
                content: container ? container.innerHTML : '',
                textContent: container ? container.textContent : '',
                html: document.documentElement ? document.documentElement.outerHTML : '',
                publishedTime: meta('article:published_time') || meta('publishedDate'),
            };
        } catch (e) {
            return {
                href: document.location.href,
                title: document.title || '',
                content: '',
                textContent: '',
                html: document.documentElement ? document.documentElement.outerHTML : '',
                publishedTime: null,
            };
        }
    };
})()
"#;

/// Reports a parse on every `readystatechange` and `load` that yields text,
/// with a 500 ms debounced fallback when the parse is empty so a stubborn
/// page still produces at least one report.
pub const REPORT_SCRIPT: &str = r#"
(() => {
    if (window.__readerReporting) return;
    window.__readerReporting = true;

    let fallbackTimer = null;

    function report() {
        if (typeof window.reportSnapshot !== 'function' || !window.__readerExtract) return;
        const parsed = window.__readerExtract();
        if (parsed.textContent && parsed.textContent.trim().length > 0) {
            if (fallbackTimer) { clearTimeout(fallbackTimer); fallbackTimer = null; }
            window.reportSnapshot(JSON.stringify(parsed));
        } else {
            if (fallbackTimer) clearTimeout(fallbackTimer);
            fallbackTimer = setTimeout(() => {
                fallbackTimer = null;
                window.reportSnapshot(JSON.stringify(window.__readerExtract()));
            }, 500);
        }
    }

    document.addEventListener('readystatechange', report);
    window.addEventListener('load', report);
})()
"#;

/// One-shot synchronous parse used for the final post-settle snapshot
pub const FINAL_PARSE_SCRIPT: &str = r#"
(() => window.__readerExtract ? window.__readerExtract() : null)()
"#;
