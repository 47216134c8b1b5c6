use std::sync::Arc;

use rocket::{Build, Rocket};

mod audit_log;
mod auth;
mod checkin;
mod db;
mod dep;
mod device_actions;
mod errors;
mod hosts;
mod jobs;
mod models;
mod routes;
mod schema;
mod settings;
mod setup_experience;
mod state;
mod tasks;
mod teams;
mod transport;
mod verification;

#[cfg(test)]
mod test_support;

use dep::{DepClient, HttpDepClient, UnconfiguredDepClient};
use settings::ServerSettings;
use state::AppState;
use tasks::{ScheduleFairing, WorkerFairing};
use transport::QueuedTransport;

/// The full HTTP surface and background loops around one `AppState`.
pub fn build_rocket(state: AppState) -> Rocket<Build> {
    rocket::build()
        .manage(state)
        .mount("/", routes::api_routes())
        .mount("/", routes::mdm_routes())
        .mount("/", routes::agent_routes())
        .attach(ScheduleFairing)
        .attach(WorkerFairing)
}

fn init_state() -> anyhow::Result<AppState> {
    let database_url = db::pool::database_url();
    let pool = db::pool::init_pool(&database_url)?;
    log::info!("Database pool ready at {}", database_url);

    let settings = {
        let mut conn = pool.get()?;
        db::run_migrations(&mut conn)?;
        ServerSettings::load(&mut conn)
    };

    let dep_client: Arc<dyn DepClient> = match HttpDepClient::from_env() {
        Some(client) => Arc::new(client),
        None => {
            log::warn!("DEP_API_TOKEN not set, enrollment profile assignments will be recorded as failed");
            Arc::new(UnconfiguredDepClient)
        }
    };

    Ok(AppState::new(pool, settings, Arc::new(QueuedTransport), dep_client))
}

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    let _logger = db::logger::init_logger()?;
    log::info!("Starting fleetpilot server");

    let state = init_state()?;
    build_rocket(state).launch().await?;
    Ok(())
}
