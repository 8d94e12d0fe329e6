//! reader — URL-to-text reader service.
//!
//! Fetches pages through headless Chrome, extracts readable article
//! snapshots, and serves them as Markdown/HTML/text/screenshot. On top of
//! that: an interrogator that streams a page plus a question through an
//! LLM with tool dispatch, and a nightly cruncher that archives stored
//! snapshots into daily JSONL files.

pub mod api;
pub mod browser;
pub mod config;
pub mod cruncher;
pub mod error;
pub mod formatter;
pub mod interrogator;
pub mod jsonstream;
pub mod llm;
pub mod snapshot;
pub mod storage;
pub mod tools;

pub use browser::{BrowserPool, BrowserPoolConfig, PageContext, PageContextOptions};
pub use config::{CrunchConfig, ReaderConfig};
pub use cruncher::{CrunchEvent, CrunchReport, Cruncher};
pub use error::{ReaderError, Result};
pub use formatter::{FormatPolicy, FormattedPage, Formatter, RespondWith};
pub use interrogator::{ChatEvent, ChatParams, InterrogatorLoop};
pub use jsonstream::{JsonStreamEvent, JsonStreamOptions, LenientJsonStream, parse_lenient};
pub use llm::{ChatMessage, ChatOptions, LanguageModel, OpenAiClient, Role, StreamDelta, ToolCall};
pub use snapshot::{PageResult, ScrapeOptions, Snapshot, scrape};
pub use storage::{
    CrawledRecord, FsObjectStore, MemoryObjectStore, MemoryRecordStore, ObjectStore, RecordStore,
};
pub use tools::{BrowseTool, SearchWebTool, Tool, ToolDescriptor, ToolRegistry};
