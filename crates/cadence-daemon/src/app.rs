use std::path::Path;
use std::sync::Arc;

use cadence_bookings::{db::open_connection, BookingService, Stores};
use cadence_core::CadenceConfig;
use cadence_scheduler::SqliteTaskStore;
use tracing::{info, warn};

/// Shared state for the background tasks.
pub struct App {
    pub config: CadenceConfig,
    pub service: BookingService,
    pub tasks: Arc<SqliteTaskStore>,
}

impl App {
    /// Open every store on the configured database file, one connection each.
    pub fn open(config: CadenceConfig) -> anyhow::Result<Self> {
        let path = Path::new(&config.database.path);
        ensure_parent_dir(path);
        info!(path = %path.display(), "opening SQLite database");

        let stores = Stores::open(path)?;
        let tasks = Arc::new(SqliteTaskStore::new(open_connection(path)?)?);
        info!("database migrations complete");
        Ok(Self::from_parts(config, stores, tasks))
    }

    pub fn from_parts(config: CadenceConfig, stores: Stores, tasks: Arc<SqliteTaskStore>) -> Self {
        let service = BookingService::new(stores, tasks.clone(), &config);
        Self {
            config,
            service,
            tasks,
        }
    }
}

fn ensure_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(dir = %parent.display(), "failed to create database directory: {e}");
        }
    }
}
