use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::{info, warn};

mod api;
mod config;
mod directives;
mod error;
mod orchestrator;
mod resilience;
mod service;
mod session;
mod tools;
mod upstream;
mod websocket;

use crate::config::load_config;
use crate::service::BrokerService;
use crate::tools::{GroundedSearchClient, ToolRegistry, register_builtin_tools};
use crate::upstream::GeminiLiveClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_logging();

    info!("Starting Opticia broker v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Configuration loaded"
    );
    if !config.upstream.has_credentials() {
        warn!("No upstream API key configured; sessions will fail to start");
    }

    let metrics = PrometheusBuilder::new().install_recorder()?;

    // Tool catalog
    let search = Arc::new(GroundedSearchClient::new(&config.upstream)?);
    let mut tools = ToolRegistry::new();
    register_builtin_tools(&mut tools, search)?;
    for name in &config.tools.disabled {
        if tools.set_enabled(name, false) {
            info!(tool = %name, "Tool disabled");
        } else {
            warn!(tool = %name, "Cannot disable unknown tool");
        }
    }

    let upstream = Arc::new(GeminiLiveClient::new(config.upstream.clone()));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let service = Arc::new(BrokerService::new(config, upstream, tools));

    let app = api::router(service, metrics);

    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("opticia_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
