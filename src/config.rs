//! Service configuration.
//!
//! Everything tunable lives here so the binary wires one value through the
//! whole process. Defaults match production; env overrides exist for the
//! handful of knobs deployments actually change.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed desktop user agent presented by every browser context
pub const READER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.6834.160 Safari/537.36";

/// Viewport applied to every page
pub const VIEWPORT_WIDTH: i64 = 1920;
pub const VIEWPORT_HEIGHT: i64 = 1080;

/// Hard cap on one navigation, start to settle
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Debounce for the in-page empty-parse fallback report
pub const SNAPSHOT_DEBOUNCE_MS: u64 = 500;

/// Main configuration for the reader service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Address the HTTP server binds to
    pub bind_addr: String,

    /// Run the browser headless (disable for local debugging only)
    pub headless: bool,

    /// Root directory for the filesystem object store
    pub storage_dir: PathBuf,

    /// Base URL prefixed to object names when building public links
    pub public_base_url: String,

    /// OpenAI-compatible completions endpoint for the interrogator
    pub llm_base_url: String,

    /// API key for the completions endpoint, usually from `LLM_API_KEY`
    pub llm_api_key: Option<String>,

    /// Model used when a request does not name one
    pub default_model: String,

    /// Context window assumed when trimming history, in tokens
    pub context_window_tokens: usize,

    /// Nightly archival settings
    pub crunch: CrunchConfig,
}

/// Settings for the nightly archival batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrunchConfig {
    /// Object-name prefix for archive files
    pub prefix: String,

    /// Schema revision embedded in archive paths (`r<rev>`)
    pub rev: u32,

    /// How many days back the window starts. Revisions have shipped with
    /// both 6 and 31; this is configuration, not a correctness knob.
    pub t_minus_days: i64,

    /// Records per archive file
    pub batch_size: usize,

    /// Concurrent snapshot fetches while building one file
    pub max_inflight: usize,
}

impl Default for CrunchConfig {
    fn default() -> Self {
        Self {
            prefix: "crunched".into(),
            rev: 2,
            t_minus_days: 31,
            batch_size: 10_000,
            max_inflight: 100,
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            headless: true,
            storage_dir: PathBuf::from("./reader-storage"),
            public_base_url: "http://localhost:3000/objects".into(),
            llm_base_url: "https://api.openai.com/v1".into(),
            llm_api_key: None,
            default_model: "gpt-3.5-turbo".into(),
            context_window_tokens: 16_384,
            crunch: CrunchConfig::default(),
        }
    }
}

impl ReaderConfig {
    /// Defaults overlaid with environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("READER_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(dir) = std::env::var("READER_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Ok(base) = std::env::var("READER_PUBLIC_BASE_URL") {
            config.public_base_url = base;
        }
        if let Ok(base) = std::env::var("LLM_BASE_URL") {
            config.llm_base_url = base;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }
        if let Ok(model) = std::env::var("READER_DEFAULT_MODEL") {
            config.default_model = model;
        }
        config
    }
}
