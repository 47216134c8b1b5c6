use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{get, post, State};
use serde::Deserialize;

use crate::checkin;
use crate::db;
use crate::errors::FleetResult;
use crate::hosts;
use crate::models::{HostCommand, TransportKind};
use crate::setup_experience::{self, SetupExperienceStatus};
use crate::state::{now, AppState};
use crate::transport;

#[derive(Deserialize, Debug, Default)]
pub struct SetupStatusRequest {
    #[serde(default)]
    pub force_release: bool,
}

#[derive(Deserialize, Debug)]
pub struct ScriptResult {
    pub execution_id: String,
    pub exit_code: i32,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct SoftwareResult {
    pub install_uuid: String,
    pub exit_code: i32,
    #[serde(default)]
    pub output: Option<String>,
}

/// Agent check-in: scripts and package installs waiting for this host.
#[get("/api/agent/<uuid>/commands")]
pub async fn fetch_commands(state: &State<AppState>, uuid: String) -> FleetResult<Json<Vec<HostCommand>>> {
    db::run_blocking(&state.db_pool, move |conn| {
        let now = now();
        let host = hosts::get_by_uuid(conn, &uuid)?;
        hosts::touch_checkin(conn, host.id, now)?;
        transport::fetch_pending(conn, host.id, TransportKind::Pull, now)
    })
    .await
    .map(Json)
}

/// Polled by the agent during setup. The body is optional.
#[post("/api/agent/<uuid>/setup_experience/status", data = "<req>")]
pub async fn setup_experience_status(
    state: &State<AppState>,
    uuid: String,
    req: Option<Json<SetupStatusRequest>>,
) -> FleetResult<Json<SetupExperienceStatus>> {
    let settings = state.settings_snapshot()?;
    let transport = state.transport.clone();
    let force_release = req.map(|r| r.force_release).unwrap_or(false);

    db::run_blocking(&state.db_pool, move |conn| {
        let now = now();
        let host = hosts::get_by_uuid(conn, &uuid)?;
        hosts::touch_checkin(conn, host.id, now)?;
        setup_experience::poll_status(conn, transport.as_ref(), host.id, force_release, &settings, now)
    })
    .await
    .map(Json)
}

#[post("/api/agent/<uuid>/scripts/result", format = "json", data = "<result>")]
pub async fn script_result(state: &State<AppState>, uuid: String, result: Json<ScriptResult>) -> FleetResult<Status> {
    let result = result.into_inner();
    db::run_blocking(&state.db_pool, move |conn| {
        let host = hosts::get_by_uuid(conn, &uuid)?;
        checkin::handle_script_result(
            conn,
            &host,
            &result.execution_id,
            result.exit_code,
            result.output.as_deref(),
            now(),
        )
    })
    .await?;
    Ok(Status::NoContent)
}

#[post("/api/agent/<uuid>/software/result", format = "json", data = "<result>")]
pub async fn software_result(state: &State<AppState>, uuid: String, result: Json<SoftwareResult>) -> FleetResult<Status> {
    let result = result.into_inner();
    db::run_blocking(&state.db_pool, move |conn| {
        let host = hosts::get_by_uuid(conn, &uuid)?;
        checkin::handle_software_result(
            conn,
            &host,
            &result.install_uuid,
            result.exit_code,
            result.output.as_deref(),
            now(),
        )
    })
    .await?;
    Ok(Status::NoContent)
}
