use chrono::{NaiveDateTime, Utc};
use std::sync::{Arc, RwLock};

use crate::db::DbPool;
use crate::dep::{DepClient, DepRetryHandler};
use crate::errors::{FleetError, FleetResult};
use crate::jobs::JobRegistry;
use crate::settings::ServerSettings;
use crate::transport::CommandTransport;
use crate::verification::VerifyInstallHandler;

/// Shared by routes and background loops. Cloning shares the pool and handles.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
    pub settings: Arc<RwLock<ServerSettings>>,
    pub transport: Arc<dyn CommandTransport>,
    pub dep_client: Arc<dyn DepClient>,
    pub jobs: JobRegistry,
}

impl AppState {
    pub fn new(
        db_pool: DbPool,
        settings: ServerSettings,
        transport: Arc<dyn CommandTransport>,
        dep_client: Arc<dyn DepClient>,
    ) -> Self {
        let settings = Arc::new(RwLock::new(settings));
        let jobs = JobRegistry::new()
            .register(Arc::new(DepRetryHandler {
                client: dep_client.clone(),
                settings: settings.clone(),
            }))
            .register(Arc::new(VerifyInstallHandler {
                transport: transport.clone(),
            }));

        Self {
            db_pool,
            settings,
            transport,
            dep_client,
            jobs,
        }
    }

    /// Copy of the current settings, so no lock is held across database work.
    pub fn settings_snapshot(&self) -> FleetResult<ServerSettings> {
        self.settings
            .read()
            .map(|s| s.clone())
            .map_err(|_| FleetError::Internal("settings lock poisoned".into()))
    }
}

pub fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}
