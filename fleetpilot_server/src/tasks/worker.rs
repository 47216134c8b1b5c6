use rocket::fairing::{Fairing, Info, Kind};
use rocket::tokio;
use rocket::{Orbit, Rocket};

use crate::db;
use crate::state::{now, AppState};

/// Jobs claimed per tick.
pub const BATCH_SIZE: i64 = 50;

/// Drains the job queue.
pub struct WorkerFairing;

#[rocket::async_trait]
impl Fairing for WorkerFairing {
    fn info(&self) -> Info {
        Info {
            name: "Job Worker",
            kind: Kind::Liftoff,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let Some(state) = rocket.state::<AppState>().cloned() else {
            log::error!("Job worker not started: AppState not managed");
            return;
        };

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(super::interval(&state, |s| s.worker_interval_seconds, 10)).await;

                let max_retries = state.settings.read().map(|s| s.job_max_retries).unwrap_or(5);
                let registry = state.jobs.clone();
                let result = db::run_blocking(&state.db_pool, move |conn| {
                    registry.process_due(conn, now(), max_retries, BATCH_SIZE)
                })
                .await;

                match result {
                    Ok(0) => {}
                    Ok(n) => log::debug!("Job worker completed {} jobs", n),
                    Err(e) => log::error!("Job worker tick failed: {}", e),
                }
            }
        });
    }
}
