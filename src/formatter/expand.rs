//! Markdown expansion into heterogeneous prompt parts.
//!
//! Multimodal prompts want inline image bytes next to their textual
//! references. This walks `![alt](url)` tokens in order and produces a
//! sequence of text, URLs, and raw bytes: `file://` URLs resolve against
//! the request's uploaded-file map, other schemes pass through as URLs,
//! and unparseable tokens stay as text. The image token itself is appended
//! again after the resolved form so the model sees both the asset and its
//! reference.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static IMAGE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)\s]+)\)").expect("static image token pattern"));

/// One element of an expanded prompt sequence
#[derive(Debug, Clone, PartialEq)]
pub enum PromptPart {
    Text(String),
    Link(Url),
    Bytes(Vec<u8>),
}

/// Expand image tokens against an in-request uploaded-file map.
///
/// Consecutive text parts are merged, so input without image tokens comes
/// back as a single text part equal to the input.
pub fn expand_markdown(input: &str, files: &HashMap<String, Vec<u8>>) -> Vec<PromptPart> {
    let mut parts: Vec<PromptPart> = Vec::new();
    let mut cursor = 0usize;

    for caps in IMAGE_TOKEN.captures_iter(input) {
        let token = caps.get(0).expect("group 0 always present");
        push_text(&mut parts, &input[cursor..token.start()]);
        cursor = token.end();

        let raw_url = &caps[2];
        match Url::parse(raw_url) {
            Ok(url) if url.scheme() == "file" => {
                match resolve_file(&url, files) {
                    Some(bytes) => {
                        parts.push(PromptPart::Bytes(bytes));
                        push_text(&mut parts, token.as_str());
                    }
                    // Unknown upload: nothing to attach, keep the token
                    None => push_text(&mut parts, token.as_str()),
                }
            }
            Ok(url) => {
                parts.push(PromptPart::Link(url));
                push_text(&mut parts, token.as_str());
            }
            Err(_) => push_text(&mut parts, token.as_str()),
        }
    }

    push_text(&mut parts, &input[cursor..]);
    parts
}

/// Look up an uploaded file, trying the raw key, the percent-decoded key,
/// and the percent-encoded key, in that order.
fn resolve_file(url: &Url, files: &HashMap<String, Vec<u8>>) -> Option<Vec<u8>> {
    // `file://name` puts the name in the host position; `file:///name`
    // puts it in the path. Accept both.
    let joined = format!("{}{}", url.host_str().unwrap_or(""), url.path());
    let key = joined.trim_start_matches('/');
    if let Some(bytes) = files.get(key) {
        return Some(bytes.clone());
    }
    let decoded = urlencoding::decode(key).ok()?;
    if let Some(bytes) = files.get(decoded.as_ref()) {
        return Some(bytes.clone());
    }
    let encoded = urlencoding::encode(key);
    files.get(encoded.as_ref()).cloned()
}

fn push_text(parts: &mut Vec<PromptPart>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(PromptPart::Text(existing)) = parts.last_mut() {
        existing.push_str(text);
    } else {
        parts.push(PromptPart::Text(text.to_string()));
    }
}

/// Concatenated text parts, used to check expansion round trips
pub fn text_only(parts: &[PromptPart]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            PromptPart::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}
