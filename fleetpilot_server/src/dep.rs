//! Enrollment-profile assignment against the device enrollment program API.
//!
//! Each automatically enrolled host has a `host_dep_assignments` row. A
//! `failed` response starts a cooldown; once it has elapsed the schedule
//! loop hands the host to a `dep_assign_retry` job. While cooling down or
//! owned by a retry job the host is screened from every other trigger.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::errors::{FleetError, FleetResult};
use crate::jobs::{self, JobHandler};
use crate::models::{AssignProfileResponse, DepAssignment, EnrollmentMethod, Host, Job, JobState};
use crate::schema::{host_dep_assignments, hosts, teams};
use crate::settings::ServerSettings;

pub const DEP_RETRY_JOB: &str = "dep_assign_retry";
const DEFAULT_DEP_API_URL: &str = "https://mdmenrollment.apple.com";

/// External assignment API: one profile for a batch of serial numbers.
pub trait DepClient: Send + Sync {
    fn assign_profile(
        &self,
        profile_uuid: &str,
        serials: &[String],
    ) -> FleetResult<HashMap<String, AssignProfileResponse>>;
}

#[derive(Serialize)]
struct AssignRequest<'a> {
    profile_uuid: &'a str,
    devices: &'a [String],
}

#[derive(Deserialize)]
struct AssignResponse {
    #[serde(default)]
    devices: HashMap<String, String>,
}

fn parse_device_status(status: &str) -> AssignProfileResponse {
    match status {
        "SUCCESS" => AssignProfileResponse::Success,
        "NOT_ACCESSIBLE" => AssignProfileResponse::NotAccessible,
        _ => AssignProfileResponse::Failed,
    }
}

/// `reqwest` client for the enrollment program's profile endpoint. Calls
/// block, so it is only used from blocking tasks.
#[derive(Debug, Clone)]
pub struct HttpDepClient {
    base_url: String,
    token: String,
    timeout: Duration,
}

impl HttpDepClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Reads `DEP_API_URL` and `DEP_API_TOKEN`. None without a token.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("DEP_API_TOKEN").ok().filter(|t| !t.is_empty())?;
        let url = std::env::var("DEP_API_URL").unwrap_or_else(|_| DEFAULT_DEP_API_URL.to_string());
        Some(Self::new(url, token))
    }
}

impl DepClient for HttpDepClient {
    fn assign_profile(
        &self,
        profile_uuid: &str,
        serials: &[String],
    ) -> FleetResult<HashMap<String, AssignProfileResponse>> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| FleetError::UpstreamUnavailable(format!("http client: {}", e)))?;

        let url = format!("{}/profile/devices", self.base_url);
        let resp = client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&AssignRequest {
                profile_uuid,
                devices: serials,
            })
            .send()
            .map_err(|e| FleetError::UpstreamUnavailable(format!("POST {}: {}", url, e)))?;

        if !resp.status().is_success() {
            return Err(FleetError::UpstreamUnavailable(format!(
                "POST {} returned {}",
                url,
                resp.status()
            )));
        }

        let body: AssignResponse = resp
            .json()
            .map_err(|e| FleetError::UpstreamUnavailable(format!("bad response from {}: {}", url, e)))?;

        Ok(body
            .devices
            .iter()
            .map(|(serial, status)| (serial.clone(), parse_device_status(status)))
            .collect())
    }
}

/// Stand-in when no API token is configured; every assignment fails upstream.
pub struct UnconfiguredDepClient;

impl DepClient for UnconfiguredDepClient {
    fn assign_profile(&self, _: &str, _: &[String]) -> FleetResult<HashMap<String, AssignProfileResponse>> {
        Err(FleetError::UpstreamUnavailable("DEP_API_TOKEN is not set".into()))
    }
}

/// What caused a sync. Decides which hosts are screened out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Team transfer, profile edit or explicit request.
    Event,
    /// Periodic resync; also skips hosts the program cannot see.
    BulkResync,
    /// The retry job that owns the hosts' `retry_job_id`.
    Retry { job_id: i32 },
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct SyncReport {
    pub assigned: usize,
    pub failed: usize,
    pub not_accessible: usize,
    pub skipped: usize,
}

#[derive(Serialize, Deserialize, Debug)]
struct DepRetryArgs {
    host_ids: Vec<i32>,
}

pub fn ensure_assignment(conn: &mut SqliteConnection, host_id: i32, now: NaiveDateTime) -> FleetResult<DepAssignment> {
    diesel::insert_or_ignore_into(host_dep_assignments::table)
        .values(&DepAssignment {
            host_id,
            profile_uuid: None,
            assign_profile_response: None,
            response_updated_at: None,
            retry_job_id: None,
            added_at: now,
        })
        .execute(conn)?;

    let row = host_dep_assignments::table
        .find(host_id)
        .select(DepAssignment::as_select())
        .first(conn)?;
    Ok(row)
}

/// The host's team profile, or the server default for hosts without one.
pub fn desired_profile(
    conn: &mut SqliteConnection,
    host: &Host,
    settings: &ServerSettings,
) -> FleetResult<Option<String>> {
    let team_profile = match host.team_id {
        Some(team_id) => teams::table
            .find(team_id)
            .select(teams::dep_profile_uuid)
            .first::<Option<String>>(conn)
            .optional()?
            .flatten(),
        None => None,
    };
    Ok(team_profile.or_else(|| settings.default_dep_profile_uuid.clone()))
}

/// Cooling down after a failure, or owned by another retry job.
fn is_screened(assignment: &DepAssignment, trigger: SyncTrigger, settings: &ServerSettings, now: NaiveDateTime) -> FleetResult<bool> {
    match (assignment.retry_job_id, trigger) {
        (Some(owner), SyncTrigger::Retry { job_id }) if owner == job_id => return Ok(false),
        (Some(_), _) => return Ok(true),
        (None, _) => {}
    }
    let cooling = assignment.response()? == Some(AssignProfileResponse::Failed)
        && assignment
            .response_updated_at
            .is_some_and(|at| now - at < settings.dep_cooldown());
    Ok(cooling)
}

fn record_response(
    conn: &mut SqliteConnection,
    host_id: i32,
    profile_uuid: &str,
    response: AssignProfileResponse,
    now: NaiveDateTime,
) -> FleetResult<()> {
    let target = host_dep_assignments::table.filter(host_dep_assignments::host_id.eq(host_id));
    match response {
        AssignProfileResponse::Success => {
            diesel::update(target)
                .set((
                    host_dep_assignments::profile_uuid.eq(Some(profile_uuid)),
                    host_dep_assignments::assign_profile_response.eq(Some(response.as_str())),
                    host_dep_assignments::response_updated_at.eq(Some(now)),
                    host_dep_assignments::retry_job_id.eq(None::<i32>),
                ))
                .execute(conn)?;
        }
        // a pending retry job keeps ownership of the host
        AssignProfileResponse::Failed => {
            diesel::update(target)
                .set((
                    host_dep_assignments::assign_profile_response.eq(Some(response.as_str())),
                    host_dep_assignments::response_updated_at.eq(Some(now)),
                ))
                .execute(conn)?;
        }
        AssignProfileResponse::NotAccessible => {
            diesel::update(target)
                .set((
                    host_dep_assignments::assign_profile_response.eq(Some(response.as_str())),
                    host_dep_assignments::response_updated_at.eq(Some(now)),
                    host_dep_assignments::retry_job_id.eq(None::<i32>),
                ))
                .execute(conn)?;
        }
    }
    Ok(())
}

/// Bring the given hosts' assigned profile in line with their current team.
/// Upstream errors are recorded as `failed` responses, not returned.
pub fn sync_assignments(
    conn: &mut SqliteConnection,
    client: &dyn DepClient,
    settings: &ServerSettings,
    host_ids: &[i32],
    trigger: SyncTrigger,
    now: NaiveDateTime,
) -> FleetResult<SyncReport> {
    let mut report = SyncReport::default();
    let mut batches: BTreeMap<String, Vec<(i32, String)>> = BTreeMap::new();

    for &host_id in host_ids {
        let host = hosts::table
            .find(host_id)
            .select(Host::as_select())
            .first(conn)
            .optional()?;
        let Some(host) = host else {
            report.skipped += 1;
            continue;
        };
        if host.enrollment_method()? != EnrollmentMethod::Automatic {
            report.skipped += 1;
            continue;
        }

        let assignment = ensure_assignment(conn, host.id, now)?;
        let Some(desired) = desired_profile(conn, &host, settings)? else {
            log::debug!("No enrollment profile configured for host {}", host.id);
            report.skipped += 1;
            continue;
        };
        let response = assignment.response()?;

        if assignment.profile_uuid.as_deref() == Some(desired.as_str())
            && response == Some(AssignProfileResponse::Success)
        {
            report.skipped += 1;
            continue;
        }
        if trigger == SyncTrigger::BulkResync && response == Some(AssignProfileResponse::NotAccessible) {
            report.skipped += 1;
            continue;
        }
        if is_screened(&assignment, trigger, settings, now)? {
            log::debug!("Host {} is cooling down, skipping profile assignment", host.id);
            report.skipped += 1;
            continue;
        }

        batches.entry(desired).or_default().push((host.id, host.serial_number));
    }

    for (profile_uuid, members) in batches {
        let serials: Vec<String> = members.iter().map(|(_, serial)| serial.clone()).collect();
        log::info!("Assigning enrollment profile {} to {} devices", profile_uuid, serials.len());

        let responses = match client.assign_profile(&profile_uuid, &serials) {
            Ok(responses) => responses,
            Err(e) => {
                log::warn!("Enrollment profile assignment for {} failed: {}", profile_uuid, e);
                HashMap::new()
            }
        };

        for (host_id, serial) in members {
            let response = responses
                .get(&serial)
                .copied()
                .unwrap_or(AssignProfileResponse::Failed);
            record_response(conn, host_id, &profile_uuid, response, now)?;
            match response {
                AssignProfileResponse::Success => report.assigned += 1,
                AssignProfileResponse::Failed => report.failed += 1,
                AssignProfileResponse::NotAccessible => report.not_accessible += 1,
            }
        }
    }
    Ok(report)
}

/// Single-host sync for explicit events. Screened like any other event.
pub fn sync_assignment(
    conn: &mut SqliteConnection,
    client: &dyn DepClient,
    settings: &ServerSettings,
    host_id: i32,
    now: NaiveDateTime,
) -> FleetResult<SyncReport> {
    sync_assignments(conn, client, settings, &[host_id], SyncTrigger::Event, now)
}

/// Hand failed hosts whose cooldown elapsed to one new retry job. Hosts
/// already owned by a live job are left alone.
pub fn cooldown_sweep(conn: &mut SqliteConnection, settings: &ServerSettings, now: NaiveDateTime) -> FleetResult<Option<Job>> {
    conn.transaction(|conn| {
        let candidates: Vec<DepAssignment> = host_dep_assignments::table
            .filter(host_dep_assignments::assign_profile_response.eq(AssignProfileResponse::Failed.as_str()))
            .filter(host_dep_assignments::response_updated_at.lt(now - settings.dep_cooldown()))
            .select(DepAssignment::as_select())
            .load(conn)?;

        let mut host_ids = Vec::new();
        for assignment in candidates {
            let owned = match assignment.retry_job_id {
                Some(job_id) => match jobs::get(conn, job_id)? {
                    Some(job) => job.state != JobState::Failure.as_str(),
                    None => false,
                },
                None => false,
            };
            if !owned {
                host_ids.push(assignment.host_id);
            }
        }

        if host_ids.is_empty() {
            return Ok(None);
        }

        let job = jobs::enqueue(conn, DEP_RETRY_JOB, &DepRetryArgs { host_ids: host_ids.clone() }, now, now)?;
        diesel::update(host_dep_assignments::table.filter(host_dep_assignments::host_id.eq_any(&host_ids)))
            .set(host_dep_assignments::retry_job_id.eq(Some(job.id)))
            .execute(conn)?;

        log::info!("Scheduled enrollment profile retry job {} for {} hosts", job.id, host_ids.len());
        Ok(Some(job))
    })
}

/// Periodic resync of every automatically enrolled host.
pub fn resync_all(
    conn: &mut SqliteConnection,
    client: &dyn DepClient,
    settings: &ServerSettings,
    now: NaiveDateTime,
) -> FleetResult<SyncReport> {
    let host_ids: Vec<i32> = hosts::table
        .filter(hosts::enrollment_method.eq(EnrollmentMethod::Automatic.as_str()))
        .select(hosts::id)
        .load(conn)?;
    let report = sync_assignments(conn, client, settings, &host_ids, SyncTrigger::BulkResync, now)?;
    if report.assigned + report.failed + report.not_accessible > 0 {
        log::info!("Enrollment profile resync: {:?}", report);
    }
    Ok(report)
}

/// Runs a retry: re-reads each host's current desired profile and releases
/// the hosts from the job whatever the outcome.
pub struct DepRetryHandler {
    pub client: Arc<dyn DepClient>,
    pub settings: Arc<RwLock<ServerSettings>>,
}

impl JobHandler for DepRetryHandler {
    fn name(&self) -> &'static str {
        DEP_RETRY_JOB
    }

    fn run(&self, conn: &mut SqliteConnection, job: &Job, now: NaiveDateTime) -> FleetResult<()> {
        let args: DepRetryArgs = serde_json::from_str(&job.args)?;
        let settings = self
            .settings
            .read()
            .map_err(|_| FleetError::Internal("settings lock poisoned".into()))?
            .clone();

        let report = sync_assignments(
            conn,
            self.client.as_ref(),
            &settings,
            &args.host_ids,
            SyncTrigger::Retry { job_id: job.id },
            now,
        )?;

        diesel::update(host_dep_assignments::table.filter(host_dep_assignments::retry_job_id.eq(job.id)))
            .set(host_dep_assignments::retry_job_id.eq(None::<i32>))
            .execute(conn)?;

        log::info!("Enrollment profile retry job {} finished: {:?}", job.id, report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobRegistry;
    use crate::models::Platform;
    use crate::test_support;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDep {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        responses: Mutex<HashMap<String, AssignProfileResponse>>,
        unavailable: bool,
    }

    impl FakeDep {
        fn respond(&self, serial: &str, response: AssignProfileResponse) {
            self.responses.lock().unwrap().insert(serial.to_string(), response);
        }

        fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DepClient for FakeDep {
        fn assign_profile(
            &self,
            profile_uuid: &str,
            serials: &[String],
        ) -> FleetResult<HashMap<String, AssignProfileResponse>> {
            self.calls.lock().unwrap().push((profile_uuid.to_string(), serials.to_vec()));
            if self.unavailable {
                return Err(FleetError::UpstreamUnavailable("503".into()));
            }
            let responses = self.responses.lock().unwrap();
            Ok(serials
                .iter()
                .filter_map(|s| responses.get(s).map(|r| (s.clone(), *r)))
                .collect())
        }
    }

    fn assignment(conn: &mut SqliteConnection, host_id: i32) -> DepAssignment {
        host_dep_assignments::table
            .find(host_id)
            .select(DepAssignment::as_select())
            .first(conn)
            .unwrap()
    }

    fn set_team(conn: &mut SqliteConnection, host_id: i32, team_id: i32) {
        diesel::update(hosts::table.find(host_id))
            .set(hosts::team_id.eq(Some(team_id)))
            .execute(conn)
            .unwrap();
    }

    #[test]
    fn successful_assignment_is_not_repeated() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let settings = ServerSettings::default();
        let team = test_support::insert_team(&mut conn, "eng", Some("profile-eng"));
        let host = test_support::insert_host(&mut conn, "S1", Platform::Macos, EnrollmentMethod::Automatic, Some(team.id));
        let dep = FakeDep::default();
        dep.respond("S1", AssignProfileResponse::Success);

        let report = sync_assignment(&mut conn, &dep, &settings, host.id, now).unwrap();
        assert_eq!(report.assigned, 1);
        let row = assignment(&mut conn, host.id);
        assert_eq!(row.profile_uuid.as_deref(), Some("profile-eng"));
        assert_eq!(row.response().unwrap(), Some(AssignProfileResponse::Success));

        sync_assignment(&mut conn, &dep, &settings, host.id, now).unwrap();
        assert_eq!(dep.calls().len(), 1);
    }

    #[test]
    fn failure_cools_down_then_retries_with_current_profile() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let settings = ServerSettings::default();
        let eng = test_support::insert_team(&mut conn, "eng", Some("profile-eng"));
        let ops = test_support::insert_team(&mut conn, "ops", Some("profile-ops"));
        let host = test_support::insert_host(&mut conn, "S1", Platform::Macos, EnrollmentMethod::Automatic, Some(eng.id));
        let dep = Arc::new(FakeDep::default());
        dep.respond("S1", AssignProfileResponse::Failed);

        sync_assignment(&mut conn, dep.as_ref(), &settings, host.id, now).unwrap();
        assert_eq!(assignment(&mut conn, host.id).response().unwrap(), Some(AssignProfileResponse::Failed));
        assert_eq!(dep.calls().len(), 1);

        // inside the cooldown window nothing reaches the API, even after a transfer
        let soon = now + ChronoDuration::minutes(10);
        set_team(&mut conn, host.id, ops.id);
        let report = sync_assignment(&mut conn, dep.as_ref(), &settings, host.id, soon).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(dep.calls().len(), 1);
        assert!(cooldown_sweep(&mut conn, &settings, soon).unwrap().is_none());

        let after = now + ChronoDuration::minutes(61);
        let job = cooldown_sweep(&mut conn, &settings, after).unwrap().unwrap();
        assert_eq!(assignment(&mut conn, host.id).retry_job_id, Some(job.id));
        assert!(cooldown_sweep(&mut conn, &settings, after).unwrap().is_none(), "one retry job per failure");

        // the retry owns the host: other triggers stay screened
        sync_assignments(&mut conn, dep.as_ref(), &settings, &[host.id], SyncTrigger::BulkResync, after).unwrap();
        assert_eq!(dep.calls().len(), 1);

        dep.respond("S1", AssignProfileResponse::Success);
        let registry = JobRegistry::new().register(Arc::new(DepRetryHandler {
            client: dep.clone(),
            settings: Arc::new(RwLock::new(settings.clone())),
        }));
        assert_eq!(registry.process_due(&mut conn, after, 5, 10).unwrap(), 1);

        let calls = dep.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, "profile-ops");
        let row = assignment(&mut conn, host.id);
        assert_eq!(row.retry_job_id, None);
        assert_eq!(row.profile_uuid.as_deref(), Some("profile-ops"));
    }

    #[test]
    fn failed_retry_releases_host_into_a_new_cooldown() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let settings = ServerSettings {
            default_dep_profile_uuid: Some("profile-default".into()),
            ..Default::default()
        };
        let host = test_support::insert_host(&mut conn, "S1", Platform::Ios, EnrollmentMethod::Automatic, None);
        let dep = Arc::new(FakeDep {
            unavailable: true,
            ..Default::default()
        });

        let report = sync_assignment(&mut conn, dep.as_ref(), &settings, host.id, now).unwrap();
        assert_eq!(report.failed, 1, "upstream errors become failed responses");

        let after = now + ChronoDuration::minutes(61);
        cooldown_sweep(&mut conn, &settings, after).unwrap().unwrap();
        let registry = JobRegistry::new().register(Arc::new(DepRetryHandler {
            client: dep.clone(),
            settings: Arc::new(RwLock::new(settings.clone())),
        }));
        registry.process_due(&mut conn, after, 5, 10).unwrap();

        let row = assignment(&mut conn, host.id);
        assert_eq!(row.retry_job_id, None);
        assert_eq!(row.response_updated_at, Some(after));
        assert!(cooldown_sweep(&mut conn, &settings, after + ChronoDuration::minutes(30)).unwrap().is_none());
        assert!(cooldown_sweep(&mut conn, &settings, after + ChronoDuration::minutes(61)).unwrap().is_some());
    }

    #[test]
    fn not_accessible_hosts_never_get_retry_jobs() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let settings = ServerSettings {
            default_dep_profile_uuid: Some("profile-default".into()),
            ..Default::default()
        };
        let host = test_support::insert_host(&mut conn, "S1", Platform::Macos, EnrollmentMethod::Automatic, None);
        let dep = FakeDep::default();
        dep.respond("S1", AssignProfileResponse::NotAccessible);

        sync_assignment(&mut conn, &dep, &settings, host.id, now).unwrap();
        let later = now + ChronoDuration::hours(3);
        assert!(cooldown_sweep(&mut conn, &settings, later).unwrap().is_none());

        resync_all(&mut conn, &dep, &settings, later).unwrap();
        assert_eq!(dep.calls().len(), 1, "bulk resync skips devices the program cannot see");

        sync_assignment(&mut conn, &dep, &settings, host.id, later).unwrap();
        assert_eq!(dep.calls().len(), 2);
    }

    #[test]
    fn retry_for_deleted_host_is_a_no_op() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let settings = ServerSettings::default();
        let dep = Arc::new(FakeDep::default());
        let job = jobs::enqueue(&mut conn, DEP_RETRY_JOB, &DepRetryArgs { host_ids: vec![404] }, now, now).unwrap();

        let registry = JobRegistry::new().register(Arc::new(DepRetryHandler {
            client: dep.clone(),
            settings: Arc::new(RwLock::new(settings)),
        }));
        assert_eq!(registry.process_due(&mut conn, now, 5, 10).unwrap(), 1);
        assert!(jobs::get(&mut conn, job.id).unwrap().is_none());
        assert!(dep.calls().is_empty());
    }

    #[test]
    fn hosts_sharing_a_profile_are_batched() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let settings = ServerSettings::default();
        let team = test_support::insert_team(&mut conn, "eng", Some("profile-eng"));
        let a = test_support::insert_host(&mut conn, "A", Platform::Macos, EnrollmentMethod::Automatic, Some(team.id));
        let b = test_support::insert_host(&mut conn, "B", Platform::Ios, EnrollmentMethod::Automatic, Some(team.id));
        let manual = test_support::insert_host(&mut conn, "C", Platform::Macos, EnrollmentMethod::Manual, Some(team.id));
        let dep = FakeDep::default();
        dep.respond("A", AssignProfileResponse::Success);

        let report = sync_assignments(&mut conn, &dep, &settings, &[a.id, b.id, manual.id], SyncTrigger::Event, now).unwrap();
        assert_eq!(dep.calls(), vec![("profile-eng".to_string(), vec!["A".to_string(), "B".to_string()])]);
        // B missing from the response counts as failed
        assert_eq!((report.assigned, report.failed, report.skipped), (1, 1, 1));
    }

    #[test]
    fn wire_statuses_map_to_responses() {
        assert_eq!(parse_device_status("SUCCESS"), AssignProfileResponse::Success);
        assert_eq!(parse_device_status("NOT_ACCESSIBLE"), AssignProfileResponse::NotAccessible);
        assert_eq!(parse_device_status("FAILED"), AssignProfileResponse::Failed);
        assert_eq!(parse_device_status("SOMETHING_NEW"), AssignProfileResponse::Failed);
    }
}
