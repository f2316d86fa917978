use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::activity::{ActivityLog, MemoryActivityLog};
use crate::api::{run_api, ApiState};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::pool::{DesktopPool, DesktopStore, MemoryDesktopStore};
use crate::reaper::IdleReaper;
use crate::registry::WorkerRegistry;
use crate::session::{BindingTable, ExamCatalog, SessionAllocator, StaticExamCatalog};
use crate::token::TokenSealer;

/// One scheduler process: registry, pool, allocator, reaper and API.
///
/// Every collaborator is passed in or built here; nothing is global.
pub struct Node {
    pub config: NodeConfig,
    pub registry: Arc<WorkerRegistry>,
    pub pool: DesktopPool,
    pub allocator: SessionAllocator,
    pub sealer: TokenSealer,
    pub reaper: Arc<IdleReaper>,
}

impl Node {
    /// Build a node backed by in-memory stores.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let catalog = Arc::new(StaticExamCatalog::new(config.default_dispatch));
        Self::with_collaborators(
            config,
            Arc::new(MemoryDesktopStore::new()),
            Arc::new(MemoryActivityLog::new()),
            catalog,
        )
    }

    pub fn with_collaborators(
        config: NodeConfig,
        desktops: Arc<dyn DesktopStore>,
        activity: Arc<dyn ActivityLog>,
        catalog: Arc<dyn ExamCatalog>,
    ) -> Result<Self> {
        let sealer = TokenSealer::new(&config.token)?;
        let registry = Arc::new(WorkerRegistry::new(config.registry.clone()));
        let pool = DesktopPool::new(desktops);
        let bindings = Arc::new(BindingTable::new());

        let allocator = SessionAllocator::new(
            pool.clone(),
            registry.clone(),
            sealer.clone(),
            catalog,
            bindings.clone(),
        )
        .with_activity_log(activity.clone());

        let reaper = Arc::new(
            IdleReaper::new(pool.clone(), activity, config.reaper.clone()).with_bindings(bindings),
        );

        Ok(Self {
            config,
            registry,
            pool,
            allocator,
            sealer,
            reaper,
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            registry: self.registry.clone(),
            pool: self.pool.clone(),
            allocator: self.allocator.clone(),
            sealer: self.sealer.clone(),
        }
    }

    /// Run the reaper in the background and serve the API until `cancel`
    /// fires.
    pub async fn run(self, cancel: CancellationToken) {
        let reaper = self.reaper.clone();
        let reaper_cancel = cancel.clone();
        let reaper_task = tokio::spawn(async move {
            reaper.run(reaper_cancel).await;
        });

        run_api(self.config.listen_addr, self.api_state(), cancel.clone()).await;

        // The API can also stop on a bind failure; take the reaper down with it.
        cancel.cancel();
        if let Err(e) = reaper_task.await {
            tracing::warn!(error = %e, "Reaper task ended abnormally");
        }
    }
}
