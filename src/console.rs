use std::sync::Arc;

use anyhow::Result;

use crate::cache::CatalogCache;
use crate::capabilities::CapabilityMonitor;
use crate::client::RouterClient;
use crate::config::ConsoleConfig;
use crate::execution::{EngineCatalog, ExecutionSession};
use crate::notices::NoticeBoard;
use crate::tool_calls::ToolCallMonitor;

/// Per-session context: one REST client, one notice board and one catalog
/// cache, handed to every live view.
#[derive(Debug, Clone)]
pub struct Console {
    client: RouterClient,
    notices: NoticeBoard,
    catalog: Arc<CatalogCache>,
}

impl Console {
    pub fn new(config: ConsoleConfig) -> Result<Self> {
        let notices = NoticeBoard::new(config.effective_notice_ttl());
        let client = RouterClient::new(config)?;
        Ok(Self {
            catalog: Arc::new(CatalogCache::new(client.clone())),
            client,
            notices,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ConsoleConfig::from_env()?)
    }

    pub fn client(&self) -> &RouterClient {
        &self.client
    }

    pub fn notices(&self) -> &NoticeBoard {
        &self.notices
    }

    pub fn catalog(&self) -> &CatalogCache {
        &self.catalog
    }

    pub fn watch_capabilities(&self) -> CapabilityMonitor {
        CapabilityMonitor::spawn(self.client.clone(), self.notices.clone())
    }

    pub fn watch_tool_calls(&self, connection_id: Option<&str>) -> ToolCallMonitor {
        ToolCallMonitor::spawn(self.client.clone(), self.notices.clone(), connection_id)
    }

    pub fn execution_session(&self) -> ExecutionSession {
        ExecutionSession::new(self.client.clone(), self.notices.clone())
    }

    pub async fn engine_catalog(&self) -> EngineCatalog {
        EngineCatalog::discover(&self.client, &self.notices).await
    }
}
