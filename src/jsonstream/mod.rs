//! Lossy streaming JSON accumulator.
//!
//! Model replies arrive as arbitrary text chunks that may contain a JSON
//! envelope somewhere inside them. This module accepts those chunks on the
//! write side and emits structural events on the read side: a marker when
//! the first top-level object opens (with the preamble text before it), a
//! marker when a second one opens, a best-effort snapshot of the first
//! object every time it grows, and exactly one final value at end-of-input
//! when anything was recognised.
//!
//! The parse is deliberately forgiving: literals match case-insensitively
//! (`True`, `TRUE`), raw control characters are allowed inside strings,
//! open strings/arrays/objects close implicitly at end-of-input, and once
//! the first top-level object completes any trailing text is dropped.
//! Errors never surface; a stream that produced nothing parseable simply
//! ends without a final value.

use serde_json::{Map, Number, Value};

/// Tuning knobs for the accumulator
#[derive(Debug, Clone)]
pub struct JsonStreamOptions {
    /// Accept raw control characters inside string values
    pub allow_control_chars: bool,
    /// Never surface parse errors; absence of a final value is the signal
    pub swallow_errors: bool,
}

impl Default for JsonStreamOptions {
    fn default() -> Self {
        Self {
            allow_control_chars: true,
            swallow_errors: true,
        }
    }
}

/// Events drained from the accumulator after each write
#[derive(Debug, Clone, PartialEq)]
pub enum JsonStreamEvent {
    /// First `{` of the stream; payload is the text before it
    FirstObject { preamble: String },
    /// First `{` of the second top-level object, if one ever opens
    SecondObject,
    /// Best-effort parse of the first object so far; strictly extends the
    /// previously emitted snapshot
    Snapshot(Value),
    /// Emitted exactly once by [`LenientJsonStream::finish`] when a
    /// top-level value was recognised
    Final(Value),
}

/// Write-side sink accumulating a growing text buffer
#[derive(Debug)]
pub struct LenientJsonStream {
    opts: JsonStreamOptions,
    buf: String,
    /// Byte offset of the first top-level `{`, once seen
    start: Option<usize>,
    /// Byte offset just past the first object once it closed
    complete_end: Option<usize>,
    second_seen: bool,
    last: Option<Value>,
    finished: bool,
}

impl LenientJsonStream {
    pub fn new(opts: JsonStreamOptions) -> Self {
        Self {
            opts,
            buf: String::new(),
            start: None,
            complete_end: None,
            second_seen: false,
            last: None,
            finished: false,
        }
    }

    /// Append a chunk and drain whatever events it produced
    pub fn push(&mut self, chunk: &str) -> Vec<JsonStreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.buf.push_str(chunk);
        let mut events = Vec::new();

        if self.start.is_none() {
            if let Some(idx) = self.buf.find('{') {
                self.start = Some(idx);
                events.push(JsonStreamEvent::FirstObject {
                    preamble: self.buf[..idx].to_string(),
                });
            } else {
                return events;
            }
        }
        let start = self.start.unwrap_or(0);

        if self.complete_end.is_none() {
            match parse_prefix(&self.buf[start..], &self.opts) {
                Parse::Complete { value, end } => {
                    self.complete_end = Some(start + end);
                    if self.last.as_ref() != Some(&value) {
                        self.last = Some(value.clone());
                        events.push(JsonStreamEvent::Snapshot(value));
                    }
                }
                Parse::Partial { value } => {
                    if self.last.as_ref() != Some(&value) {
                        self.last = Some(value.clone());
                        events.push(JsonStreamEvent::Snapshot(value));
                    }
                }
                Parse::Pending => {}
            }
        }

        // A second top-level object can only open after the first closed.
        if !self.second_seen && self.detect_second_object() {
            self.second_seen = true;
            events.push(JsonStreamEvent::SecondObject);
        }

        events
    }

    /// Look for a genuine second top-level object in the text after the
    /// first one closed.
    ///
    /// Trailing prose routinely contains stray braces (`the pair {a,b}`),
    /// so a candidate `{` only counts when it parses as an object: a
    /// closed candidate must be strictly valid JSON, an open one must
    /// already hold at least one member.
    fn detect_second_object(&self) -> bool {
        let Some(end) = self.complete_end else {
            return false;
        };
        let tail = &self.buf[end..];
        let mut search = 0usize;
        while let Some(rel) = tail[search..].find('{') {
            let idx = search + rel;
            match parse_prefix(&tail[idx..], &self.opts) {
                Parse::Complete { end: e, .. } => {
                    if serde_json::from_str::<Value>(&tail[idx..idx + e]).is_ok() {
                        return true;
                    }
                }
                Parse::Partial {
                    value: Value::Object(map),
                } if !map.is_empty() => return true,
                _ => {}
            }
            search = idx + 1;
        }
        false
    }

    /// Signal end-of-input; yields the final value if one was recognised
    pub fn finish(&mut self) -> Vec<JsonStreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        match self.last.take() {
            Some(value) => vec![JsonStreamEvent::Final(value)],
            None => Vec::new(),
        }
    }

    /// Latest accumulated value, if any
    pub fn current(&self) -> Option<&Value> {
        self.last.as_ref()
    }
}

/// One-shot lenient parse, used for tool-call argument strings.
///
/// Accepts a bare value or a value embedded after prose; truncated input
/// yields the best-effort prefix parse.
pub fn parse_lenient(input: &str) -> Option<Value> {
    let opts = JsonStreamOptions::default();
    let trimmed = input.trim_start();
    match parse_prefix(trimmed, &opts) {
        Parse::Complete { value, .. } | Parse::Partial { value } => Some(value),
        Parse::Pending => {
            let idx = input.find(['{', '['])?;
            match parse_prefix(&input[idx..], &opts) {
                Parse::Complete { value, .. } | Parse::Partial { value } => Some(value),
                Parse::Pending => None,
            }
        }
    }
}

// =============================================================================
// Prefix parser
// =============================================================================

/// Outcome of parsing one value at the head of the input
enum Parse {
    /// Value closed properly; `end` is the byte offset just past it
    Complete { value: Value, end: usize },
    /// Input ended mid-value; best-effort result with implicit closes
    Partial { value: Value },
    /// Nothing usable yet (e.g. a bare `-` or half a literal keyword)
    Pending,
}

struct Cursor<'a> {
    s: &'a str,
    pos: usize,
    allow_control_chars: bool,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str, opts: &JsonStreamOptions) -> Self {
        Self {
            s,
            pos: 0,
            allow_control_chars: opts.allow_control_chars,
        }
    }

    fn peek(&self) -> Option<char> {
        self.s[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eof(&self) -> bool {
        self.pos >= self.s.len()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn value(&mut self) -> Parse {
        self.skip_ws();
        match self.peek() {
            None => Parse::Pending,
            Some('{') => self.object(),
            Some('[') => self.array(),
            Some('"') => self.string().map_string(),
            Some(c) if c == '-' || c == '+' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.literal(),
            Some(_) => Parse::Pending,
        }
    }

    fn object(&mut self) -> Parse {
        self.bump(); // '{'
        let mut map = Map::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Parse::Partial {
                    value: Value::Object(map),
                },
                Some('}') => {
                    self.bump();
                    return Parse::Complete {
                        value: Value::Object(map),
                        end: self.pos,
                    };
                }
                Some(',') => {
                    self.bump();
                    continue;
                }
                Some('"') => {
                    let key = match self.string() {
                        Str::Complete(k) => k,
                        // Key still streaming in; nothing stable to keep
                        Str::Partial(_) => {
                            return Parse::Partial {
                                value: Value::Object(map),
                            };
                        }
                    };
                    self.skip_ws();
                    match self.peek() {
                        Some(':') => {
                            self.bump();
                        }
                        None => {
                            return Parse::Partial {
                                value: Value::Object(map),
                            };
                        }
                        // Garbage where the colon belongs; drop the member
                        Some(_) => continue,
                    }
                    match self.value() {
                        Parse::Complete { value, .. } => {
                            map.insert(key, value);
                        }
                        Parse::Partial { value } => {
                            map.insert(key, value);
                            return Parse::Partial {
                                value: Value::Object(map),
                            };
                        }
                        Parse::Pending => {
                            return Parse::Partial {
                                value: Value::Object(map),
                            };
                        }
                    }
                }
                // Unexpected character inside the object; skip it
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    fn array(&mut self) -> Parse {
        self.bump(); // '['
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Parse::Partial {
                    value: Value::Array(items),
                },
                Some(']') => {
                    self.bump();
                    return Parse::Complete {
                        value: Value::Array(items),
                        end: self.pos,
                    };
                }
                Some(',') => {
                    self.bump();
                    continue;
                }
                Some(_) => match self.value() {
                    Parse::Complete { value, .. } => items.push(value),
                    Parse::Partial { value } => {
                        items.push(value);
                        return Parse::Partial {
                            value: Value::Array(items),
                        };
                    }
                    Parse::Pending => {
                        return Parse::Partial {
                            value: Value::Array(items),
                        };
                    }
                },
            }
        }
    }

    fn string(&mut self) -> Str {
        self.bump(); // '"'
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Str::Partial(out),
                Some('"') => return Str::Complete(out),
                Some('\\') => match self.bump() {
                    // Dangling escape at end-of-input: drop it
                    None => return Str::Partial(out),
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some('/') => out.push('/'),
                    Some('b') => out.push('\u{0008}'),
                    Some('f') => out.push('\u{000C}'),
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some('u') => {
                        let mut hex = String::new();
                        for _ in 0..4 {
                            match self.peek() {
                                Some(c) if c.is_ascii_hexdigit() => {
                                    hex.push(c);
                                    self.bump();
                                }
                                _ => break,
                            }
                        }
                        if hex.len() == 4
                            && let Ok(n) = u32::from_str_radix(&hex, 16)
                            && let Some(c) = char::from_u32(n)
                        {
                            out.push(c);
                        } else if self.eof() {
                            // Truncated \uXXXX escape: drop it
                            return Str::Partial(out);
                        }
                    }
                    // Unknown escape: keep the escaped character as-is
                    Some(other) => out.push(other),
                },
                Some(c) if c.is_control() && !self.allow_control_chars => {
                    // Strict mode treats the raw control char as terminating
                    return Str::Complete(out);
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Parse {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                self.bump();
            } else {
                break;
            }
        }
        let token = &self.s[start..self.pos];
        let at_eof = self.eof();
        let value = if let Ok(n) = token.parse::<i64>() {
            Some(Value::Number(Number::from(n)))
        } else {
            token
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
        };
        match value {
            Some(v) if at_eof => Parse::Partial { value: v },
            Some(v) => Parse::Complete {
                value: v,
                end: self.pos,
            },
            // A bare "-" or "1e" may still become a number
            None => Parse::Pending,
        }
    }

    fn literal(&mut self) -> Parse {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphabetic() {
                self.bump();
            } else {
                break;
            }
        }
        let word = self.s[start..self.pos].to_ascii_lowercase();
        let at_eof = self.eof();
        let value = match word.as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            "null" => Some(Value::Null),
            _ => None,
        };
        match value {
            Some(v) if at_eof => Parse::Partial { value: v },
            Some(v) => Parse::Complete {
                value: v,
                end: self.pos,
            },
            None if at_eof && ["true", "false", "null"].iter().any(|k| k.starts_with(&word)) => {
                // Half a keyword; wait for the rest
                Parse::Pending
            }
            None => Parse::Pending,
        }
    }
}

enum Str {
    Complete(String),
    Partial(String),
}

impl Str {
    fn map_string(self) -> Parse {
        match self {
            Str::Complete(s) => Parse::Complete {
                value: Value::String(s),
                // end is patched by the caller via cursor position
                end: 0,
            },
            Str::Partial(s) => Parse::Partial {
                value: Value::String(s),
            },
        }
    }
}

fn parse_prefix(input: &str, opts: &JsonStreamOptions) -> Parse {
    let mut cursor = Cursor::new(input, opts);
    match cursor.value() {
        Parse::Complete { value, .. } => Parse::Complete {
            value,
            end: cursor.pos,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn drain(chunks: &[&str]) -> (Vec<JsonStreamEvent>, Vec<JsonStreamEvent>) {
        let mut stream = LenientJsonStream::new(JsonStreamOptions::default());
        let mut during = Vec::new();
        for chunk in chunks {
            during.extend(stream.push(chunk));
        }
        let at_end = stream.finish();
        (during, at_end)
    }

    #[test]
    fn first_object_marker_carries_preamble() {
        let (events, _) = drain(&["Sure, here you go:\n", "{\"a\":", "1}"]);
        assert_eq!(
            events[0],
            JsonStreamEvent::FirstObject {
                preamble: "Sure, here you go:\n".into()
            }
        );
    }

    #[test]
    fn snapshots_grow_monotonically() {
        let mut stream = LenientJsonStream::new(JsonStreamOptions::default());
        let mut snapshots = Vec::new();
        for chunk in ["{\"thoughts\":\"loo", "king\",\"tools\":[", "{\"name\":\"browse\"}]}"] {
            for event in stream.push(chunk) {
                if let JsonStreamEvent::Snapshot(v) = event {
                    snapshots.push(v);
                }
            }
        }
        assert_eq!(snapshots[0], json!({"thoughts": "loo"}));
        assert_eq!(snapshots[1], json!({"thoughts": "looking", "tools": []}));
        assert_eq!(
            snapshots[2],
            json!({"thoughts": "looking", "tools": [{"name": "browse"}]})
        );
    }

    #[test]
    fn abrupt_termination_closes_open_scopes() {
        let (_, finals) = drain(&["{\"intention\":\"USE_TOOLS\",\"tools\":[{\"name\":\"x\""]);
        assert_eq!(
            finals,
            vec![JsonStreamEvent::Final(json!({
                "intention": "USE_TOOLS",
                "tools": [{"name": "x"}]
            }))]
        );
    }

    #[test]
    fn literal_casing_variants_accepted() {
        let (_, finals) = drain(&["{\"a\": True, \"b\": FALSE, \"c\": Null}"]);
        assert_eq!(
            finals,
            vec![JsonStreamEvent::Final(json!({"a": true, "b": false, "c": null}))]
        );
    }

    #[test]
    fn trailing_text_after_object_is_dropped() {
        let (events, finals) = drain(&["{\"done\": true} and that's all I have."]);
        assert!(events.contains(&JsonStreamEvent::Snapshot(json!({"done": true}))));
        assert_eq!(finals, vec![JsonStreamEvent::Final(json!({"done": true}))]);
    }

    #[test]
    fn second_object_marker_fires_once() {
        let (events, _) = drain(&["{\"a\":1}", " some prose ", "{\"b\":2}", "{\"c\":3}"]);
        let count = events
            .iter()
            .filter(|e| **e == JsonStreamEvent::SecondObject)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn stray_brace_in_prose_is_not_a_second_object() {
        let (events, _) = drain(&[
            "{\"a\":1}",
            " note the pair {a,b} and the set {x, y, z} in the text ",
        ]);
        assert!(!events.contains(&JsonStreamEvent::SecondObject));
    }

    #[test]
    fn streaming_second_object_fires_once_a_member_lands() {
        let mut stream = LenientJsonStream::new(JsonStreamOptions::default());
        let mut events = stream.push("{\"a\":1} then ");
        // An object that has only opened could still be a stray brace.
        events.extend(stream.push("{\"intention\":"));
        assert!(!events.contains(&JsonStreamEvent::SecondObject));
        // A member value makes it a real object.
        let more = stream.push("\"US");
        assert!(more.contains(&JsonStreamEvent::SecondObject));
    }

    #[test]
    fn no_json_means_no_final() {
        let (events, finals) = drain(&["just plain prose, no structure here"]);
        assert!(events.is_empty());
        assert!(finals.is_empty());
    }

    #[test]
    fn partial_numbers_are_fixed_by_later_chunks() {
        let mut stream = LenientJsonStream::new(JsonStreamOptions::default());
        let mut snapshots = Vec::new();
        for chunk in ["{\"n\": 12", "3}"] {
            for event in stream.push(chunk) {
                if let JsonStreamEvent::Snapshot(v) = event {
                    snapshots.push(v);
                }
            }
        }
        assert_eq!(snapshots, vec![json!({"n": 12}), json!({"n": 123})]);
    }

    #[test]
    fn half_literal_is_held_back_until_complete() {
        let mut stream = LenientJsonStream::new(JsonStreamOptions::default());
        let first: Vec<_> = stream.push("{\"flag\": tru");
        assert!(
            !first
                .iter()
                .any(|e| matches!(e, JsonStreamEvent::Snapshot(v) if v.get("flag").is_some()))
        );
        let second = stream.push("e}");
        assert!(second.contains(&JsonStreamEvent::Snapshot(json!({"flag": true}))));
    }

    #[test]
    fn control_chars_inside_strings_pass_through() {
        let (_, finals) = drain(&["{\"text\": \"line one\nline two\"}"]);
        assert_eq!(
            finals,
            vec![JsonStreamEvent::Final(json!({"text": "line one\nline two"}))]
        );
    }

    #[test]
    fn parse_lenient_handles_prose_wrapped_objects() {
        let value = parse_lenient("here are the args: {\"url\": \"https://a.test\"}").unwrap();
        assert_eq!(value, json!({"url": "https://a.test"}));
        assert_eq!(parse_lenient("42").unwrap(), json!(42));
        assert!(parse_lenient("no structure").is_none());
    }

    /// Structural extension: every key present in an earlier snapshot stays
    /// present (with an equal-or-extended value) in every later one.
    fn extends(earlier: &Value, later: &Value) -> bool {
        match (earlier, later) {
            (Value::Object(a), Value::Object(b)) => a
                .iter()
                .all(|(k, va)| b.get(k).is_some_and(|vb| extends(va, vb))),
            (Value::Array(a), Value::Array(b)) => {
                a.len() <= b.len() && a.iter().zip(b).all(|(va, vb)| extends(va, vb))
            }
            (Value::String(a), Value::String(b)) => b.starts_with(a.as_str()),
            (Value::Number(_), Value::Number(_)) => true,
            // A scalar placeheld as one type never retracts to another shape
            (a, b) => a == b,
        }
    }

    proptest! {
        #[test]
        fn snapshots_only_extend(doc in prop::collection::hash_map("[a-z]{1,6}", "[a-zA-Z0-9 ]{0,12}", 1..6)) {
            let full = serde_json::to_string(&doc).unwrap();
            let mut stream = LenientJsonStream::new(JsonStreamOptions::default());
            let mut previous: Option<Value> = None;
            for chunk in full.as_bytes().chunks(3) {
                for event in stream.push(std::str::from_utf8(chunk).unwrap_or("")) {
                    if let JsonStreamEvent::Snapshot(v) = event {
                        if let Some(p) = &previous {
                            prop_assert!(extends(p, &v), "snapshot retracted: {p} -> {v}");
                        }
                        previous = Some(v);
                    }
                }
            }
        }
    }
}
