mod chat;
mod compiler;
mod config;
mod document;
mod errors;
mod expr;
mod llm_client;
mod models;
mod readiness;
mod routes;
mod state;
mod tools;
mod version;
mod vfs;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::chat::ChatSession;
use crate::compiler::typst_cli::TypstCliLoader;
use crate::compiler::{AssetCache, AssetSpec, CompilerOptions, RendererOptions};
use crate::config::Config;
use crate::document::{Document, DocumentOptions, TemplateDescriptor, TracingSink};
use crate::expr::ExprLimits;
use crate::llm_client::LlmClient;
use crate::routes::build_router;
use crate::state::AppState;
use crate::tools::ToolSurface;
use crate::vfs::{DiskBackend, Vfs};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; malformed values fail startup
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Resume Studio v{}", env!("CARGO_PKG_VERSION"));

    // Open the document store
    let backend = DiskBackend::open(&config.data_dir, &config.store_name).await?;
    info!("Document store at {}", config.store_dir().display());

    // Compiler and renderer payloads
    let loader = Arc::new(TypstCliLoader::new(AssetCache::new(
        config.asset_cache_dir.clone(),
    )));
    let mut options = DocumentOptions::new(
        CompilerOptions {
            executable: config.typst_bin.clone(),
            asset: config
                .compiler_asset_url
                .as_ref()
                .map(|url| AssetSpec::new("typst", url)),
        },
        RendererOptions {
            font_asset: config
                .renderer_asset_url
                .as_ref()
                .map(|url| AssetSpec::new("fonts", url)),
        },
    );
    options.template =
        TemplateDescriptor::resume().with_defaults_url(config.template_defaults_url.clone());

    let document = Arc::new(Document::new(
        Vfs::new(backend),
        loader,
        Arc::new(TracingSink),
        options,
    ));
    document.init().await?;
    info!("Document initialized (phase: {:?})", document.phase());

    // Load the compiler in the background when everything is already cached
    let loading = document.clone();
    let timeout = config.cache_check_timeout;
    tokio::spawn(async move {
        match loading.auto_load_if_cached(timeout).await {
            Ok(true) => info!("Compiler loaded from cache"),
            Ok(false) => info!("Compiler assets not cached; waiting for an explicit load"),
            Err(e) => warn!("Automatic compiler load failed: {e}"),
        }
    });

    let tools = ToolSurface::new(
        document.clone(),
        ExprLimits {
            timeout: config.expr_timeout,
            ..ExprLimits::default()
        },
    );

    // Initialize the chat agent when an API key is configured
    let chat = match &config.anthropic_api_key {
        Some(key) => {
            let mut llm = LlmClient::new(key.clone())?;
            if let Some(base_url) = &config.anthropic_base_url {
                llm = llm.with_base_url(base_url.clone());
            }
            info!("LLM client initialized (model: {})", llm_client::MODEL);
            Some(Arc::new(ChatSession::new(
                Arc::new(llm),
                tools.clone(),
                document.clone(),
            )))
        }
        None => {
            warn!("ANTHROPIC_API_KEY is not set; chat is disabled");
            None
        }
    };

    // Build app state
    let state = AppState {
        document,
        tools,
        chat,
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins once the web client has a fixed host

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
