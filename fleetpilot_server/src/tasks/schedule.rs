use chrono::NaiveDateTime;
use diesel::SqliteConnection;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::tokio;
use rocket::{Orbit, Rocket};

use crate::db;
use crate::dep::{self, DepClient};
use crate::jobs;
use crate::settings::ServerSettings;
use crate::state::{now, AppState};
use crate::verification;

/// Periodic housekeeping: stale jobs, DEP cooldown retries, bulk DEP resync
/// and verification timeouts.
pub struct ScheduleFairing;

#[rocket::async_trait]
impl Fairing for ScheduleFairing {
    fn info(&self) -> Info {
        Info {
            name: "Fleet Schedule",
            kind: Kind::Liftoff,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let Some(state) = rocket.state::<AppState>().cloned() else {
            log::error!("Schedule not started: AppState not managed");
            return;
        };

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(super::interval(&state, |s| s.schedule_interval_seconds, 300)).await;

                let settings = match state.settings_snapshot() {
                    Ok(s) => s,
                    Err(e) => {
                        log::error!("Schedule tick skipped: {}", e);
                        continue;
                    }
                };
                let client = state.dep_client.clone();
                let result = db::run_blocking(&state.db_pool, move |conn| {
                    run_tick(conn, client.as_ref(), &settings, now());
                    Ok(())
                })
                .await;

                if let Err(e) = result {
                    log::error!("Schedule tick failed: {}", e);
                }
            }
        });
    }
}

/// One pass of every periodic step. A failing step is logged and does not
/// hold back the others.
pub fn run_tick(conn: &mut SqliteConnection, client: &dyn DepClient, settings: &ServerSettings, now: NaiveDateTime) {
    if let Err(e) = jobs::requeue_stale(conn, now, settings.stale_job_after()) {
        log::error!("Requeueing stale jobs failed: {}", e);
    }
    // sweep first so hosts handed to a retry job are screened by the resync
    if let Err(e) = dep::cooldown_sweep(conn, settings, now) {
        log::error!("Enrollment profile cooldown sweep failed: {}", e);
    }
    if let Err(e) = dep::resync_all(conn, client, settings, now) {
        log::error!("Enrollment profile resync failed: {}", e);
    }
    match verification::expire_stale(conn, None, settings, now) {
        Ok(0) => {}
        Ok(n) => log::info!("Expired {} software verifications", n),
        Err(e) => log::error!("Expiring software verifications failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{FleetError, FleetResult};
    use crate::models::{AssignProfileResponse, DepAssignment, EnrollmentMethod, JobState, Platform};
    use crate::schema::host_dep_assignments;
    use crate::test_support;
    use chrono::Duration;
    use diesel::prelude::*;
    use std::collections::HashMap;

    struct DownDep;

    impl DepClient for DownDep {
        fn assign_profile(&self, _profile_uuid: &str, _serials: &[String]) -> FleetResult<HashMap<String, AssignProfileResponse>> {
            Err(FleetError::UpstreamUnavailable("maintenance".into()))
        }
    }

    #[test]
    fn tick_requeues_and_hands_failures_to_a_retry_job() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let settings = ServerSettings::default();
        let team = test_support::insert_team(&mut conn, "eng", Some("profile-eng"));
        let host = test_support::insert_host(&mut conn, "S1", Platform::Macos, EnrollmentMethod::Automatic, Some(team.id));

        let stale = jobs::enqueue(&mut conn, "verify_install", &serde_json::json!({}), now, now).unwrap();
        jobs::claim_due(&mut conn, now, 10).unwrap();

        // first pass: the upstream is down, the host is recorded as failed
        run_tick(&mut conn, &DownDep, &settings, now);
        let row: DepAssignment = host_dep_assignments::table
            .find(host.id)
            .select(DepAssignment::as_select())
            .first(&mut conn)
            .unwrap();
        assert_eq!(row.response().unwrap(), Some(AssignProfileResponse::Failed));
        assert_eq!(row.retry_job_id, None);

        let later = now + Duration::hours(2);
        run_tick(&mut conn, &DownDep, &settings, later);

        assert_eq!(jobs::get(&mut conn, stale.id).unwrap().unwrap().state, JobState::Queued.as_str());
        let row: DepAssignment = host_dep_assignments::table
            .find(host.id)
            .select(DepAssignment::as_select())
            .first(&mut conn)
            .unwrap();
        let retry = jobs::get(&mut conn, row.retry_job_id.unwrap()).unwrap().unwrap();
        assert_eq!(retry.name, dep::DEP_RETRY_JOB);
    }
}
