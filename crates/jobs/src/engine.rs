//! Engine bootstrap: open the store, recover, start dispatching.

use std::sync::Arc;

use tracing::info;

use studio_core::JobResult;

use crate::config::JobEngineConfig;
use crate::registry::HandlerRegistry;
use crate::scheduler::{RecoveryReport, Scheduler, SchedulerHandle, SchedulerStats};
use crate::service::JobService;
use crate::store::{JobStore, SqliteJobStore};

/// A running job engine. Several can coexist in one process, each with its
/// own store and registry.
#[derive(Debug)]
pub struct JobEngine {
    service: JobService,
    handle: SchedulerHandle,
    recovery: RecoveryReport,
    sqlite: Option<Arc<SqliteJobStore>>,
}

impl JobEngine {
    /// Open the SQLite store from `config` and start the engine.
    pub async fn open(config: &JobEngineConfig, registry: Arc<HandlerRegistry>) -> JobResult<Self> {
        let store = Arc::new(SqliteJobStore::open(&config.database_path, config.busy_timeout).await?);
        info!(path = %config.database_path.display(), "opened job store");

        let mut engine = Self::start(store.clone(), registry, config).await?;
        engine.sqlite = Some(store);
        Ok(engine)
    }

    /// Start the engine over an existing store.
    pub async fn with_store(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        config: &JobEngineConfig,
    ) -> JobResult<Self> {
        Self::start(store, registry, config).await
    }

    async fn start(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        config: &JobEngineConfig,
    ) -> JobResult<Self> {
        let scheduler = Scheduler::new(store.clone(), registry.clone(), config.max_workers);
        let recovery = scheduler.recover().await?;
        let handle = scheduler.spawn();
        let service = JobService::new(store, registry.clone(), scheduler)
            .with_default_list_limit(config.default_list_limit);

        info!(
            max_workers = config.max_workers,
            kinds = ?registry.kinds(),
            "job engine started"
        );

        Ok(Self {
            service,
            handle,
            recovery,
            sqlite: None,
        })
    }

    pub fn service(&self) -> &JobService {
        &self.service
    }

    /// What startup recovery found.
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    pub fn stats(&self) -> SchedulerStats {
        self.handle.stats()
    }

    /// Stop dispatching, wait for running jobs, close the database.
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
        if let Some(sqlite) = self.sqlite {
            sqlite.close().await;
        }
        info!("job engine stopped");
    }
}
