use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{get, post, State};

use crate::checkin::{self, MdmReport};
use crate::db;
use crate::errors::FleetResult;
use crate::hosts;
use crate::models::{HostCommand, TransportKind};
use crate::state::{now, AppState};
use crate::transport;

/// Device check-in: hand over pending MDM commands, marking them delivered.
#[get("/api/mdm/<uuid>/commands")]
pub async fn fetch_commands(state: &State<AppState>, uuid: String) -> FleetResult<Json<Vec<HostCommand>>> {
    db::run_blocking(&state.db_pool, move |conn| {
        let now = now();
        let host = hosts::get_by_uuid(conn, &uuid)?;
        hosts::touch_checkin(conn, host.id, now)?;
        transport::fetch_pending(conn, host.id, TransportKind::Push, now)
    })
    .await
    .map(Json)
}

/// Device report: a command result, or an Idle / NotNow check-in.
#[post("/api/mdm/<uuid>/results", format = "json", data = "<report>")]
pub async fn post_results(state: &State<AppState>, uuid: String, report: Json<MdmReport>) -> FleetResult<Status> {
    let settings = state.settings_snapshot()?;
    let transport = state.transport.clone();
    let report = report.into_inner();

    db::run_blocking(&state.db_pool, move |conn| {
        let host = hosts::get_by_uuid(conn, &uuid)?;
        checkin::handle_mdm_report(conn, transport.as_ref(), &settings, &host, &report, now())
    })
    .await?;
    Ok(Status::NoContent)
}
