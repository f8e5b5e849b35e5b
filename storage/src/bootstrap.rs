// Bootstrap utilities for process initialization and shutdown

use crate::config::Settings;
use crate::db::memory::MemoryBackend;
use crate::db::migrations::{builtin_migrations, Migration, MigrationTracker};
use crate::db::pool::{Pool, PoolOptions, PoolStatus};
use crate::db::session::SessionManager;
use anyhow::{bail, Context, Result};
use tracing::{info, instrument};

/// Handle to the initialized data layer
///
/// Built once at process start and passed by reference to whatever
/// constructs request handlers; drained once at process shutdown.
pub struct StoreHandle {
    pool: Pool<MemoryBackend>,
    sessions: SessionManager<MemoryBackend>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("pool", &self.pool.status())
            .finish_non_exhaustive()
    }
}

impl StoreHandle {
    /// Session factory for the service layer
    pub fn sessions(&self) -> &SessionManager<MemoryBackend> {
        &self.sessions
    }

    /// Pool state for liveness/readiness probes
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Drain the pool with the configured grace period
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

/// Initialize the pool and bring the schema up to date with the template's
/// built-in migration chain
pub async fn init_store(settings: &Settings) -> Result<StoreHandle> {
    init_store_with_migrations(settings, &builtin_migrations()).await
}

/// Initialize the pool and apply a caller-supplied migration chain
#[instrument(skip(settings, migrations))]
pub async fn init_store_with_migrations(
    settings: &Settings,
    migrations: &[Box<dyn Migration>],
) -> Result<StoreHandle> {
    settings
        .validate()
        .map_err(|reason| anyhow::anyhow!("Invalid configuration: {reason}"))?;

    if !settings.database.url.starts_with("memory://") {
        bail!("Unsupported store URL: {}", settings.database.url);
    }

    info!("Initializing data layer");
    let pool = Pool::new(MemoryBackend::new(), PoolOptions::from(&settings.database))
        .await
        .context("Failed to initialize connection pool")?;

    let ran = MigrationTracker::new(pool.clone())
        .apply_all(migrations)
        .await
        .context("Failed to apply migrations")?;
    info!(migrations_applied = ran, "Data layer initialized");

    Ok(StoreHandle {
        sessions: SessionManager::new(pool.clone()),
        pool,
    })
}
