// readerd: the reader service binary.
//
// Wires the browser pool, tool registry, interrogator, and cruncher into
// one process and serves the HTTP surface. The nightly crunch schedule
// runs in its own task.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use reader::api::{AppState, router};
use reader::cruncher::spawn_nightly;
use reader::llm::LanguageModel;
use reader::storage::{MemoryRecordStore, ObjectStore};
use reader::{
    BrowseTool, BrowserPool, BrowserPoolConfig, Cruncher, Formatter, FsObjectStore,
    InterrogatorLoop, OpenAiClient, ReaderConfig, SearchWebTool, ToolRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ReaderConfig::from_env();
    info!(bind = %config.bind_addr, "starting readerd");

    let pool = BrowserPool::new(BrowserPoolConfig::detect(config.headless));
    pool.start().await.context("browser pool startup failed")?;

    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(
        config.storage_dir.clone(),
        config.public_base_url.clone(),
    ));
    let formatter = Arc::new(Formatter::new(Arc::clone(&objects)));

    let llm: Arc<dyn LanguageModel> = Arc::new(OpenAiClient::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
    ));

    let registry = ToolRegistry::new()
        .register(Arc::new(BrowseTool::new(
            Arc::clone(&pool),
            Arc::clone(&formatter),
        )))
        .register(Arc::new(SearchWebTool::new(Arc::clone(&pool))));

    let interrogator = InterrogatorLoop::new(llm, registry, config.context_window_tokens);

    // The production record store is the crawl database; deployments plug
    // one in here. The default keeps the job runnable without it.
    let records = Arc::new(MemoryRecordStore::new(Vec::new()));
    let cruncher = Arc::new(Cruncher::new(
        records,
        Arc::clone(&objects),
        Arc::clone(&formatter),
        config.crunch.clone(),
    ));
    let _schedule = spawn_nightly(Arc::clone(&cruncher));

    let state = Arc::new(AppState {
        pool: Arc::clone(&pool),
        formatter,
        interrogator,
        cruncher,
        objects,
        config: config.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!("readerd listening on {}", config.bind_addr);
    axum::serve(listener, router(state))
        .await
        .context("server error")?;

    pool.shutdown().await;
    Ok(())
}
