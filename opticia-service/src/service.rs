//! Broker service container.
//!
//! Built once at bootstrap and handed to every request handler. Holds the
//! shared registries; nothing here is a process-wide singleton.

use std::sync::Arc;
use tracing::info;

use crate::config::ServiceConfig;
use crate::directives::TolerantParser;
use crate::orchestrator::SessionOrchestrator;
use crate::resilience::{FallbackTracker, NetworkMonitor};
use crate::session::SessionDeps;
use crate::tools::ToolRegistry;
use crate::upstream::LiveUpstream;
use crate::websocket::ConnectionManager;

/// Main service coordinator
pub struct BrokerService {
    pub config: Arc<ServiceConfig>,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub connections: ConnectionManager,
    pub tools: Arc<ToolRegistry>,
    pub fallback: FallbackTracker,
    pub network: NetworkMonitor,
}

impl BrokerService {
    pub fn new(
        config: ServiceConfig,
        upstream: Arc<dyn LiveUpstream>,
        tools: ToolRegistry,
    ) -> Self {
        let config = Arc::new(config);
        let tools = Arc::new(tools);
        let orchestrator = SessionOrchestrator::new(SessionDeps {
            upstream,
            tools: tools.clone(),
            parser: Arc::new(TolerantParser),
            config: config.clone(),
        });

        info!(
            tools = tools.len(),
            model = %config.upstream.model,
            credentials = config.upstream.has_credentials(),
            "Broker service initialized"
        );

        Self {
            network: NetworkMonitor::new(config.network.window_size),
            fallback: FallbackTracker::new(),
            connections: ConnectionManager::new(),
            orchestrator,
            tools,
            config,
        }
    }

    /// Drop everything held for a connection
    pub async fn release_connection(&self, conn_id: &str) {
        self.orchestrator.close_session(conn_id).await;
        self.fallback.cleanup(conn_id);
        self.network.cleanup(conn_id);
        self.connections.remove_connection(conn_id);
    }
}
