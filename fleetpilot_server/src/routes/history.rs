use rocket::serde::json::Json;
use rocket::{get, State};

use crate::audit_log::{self, AuditLog};
use crate::db;
use crate::errors::FleetResult;
use crate::hosts;
use crate::state::AppState;

/// Activity feed of one host, newest first.
#[get("/api/hosts/<id>/activities")]
pub async fn host_activities(state: &State<AppState>, id: i32) -> FleetResult<Json<Vec<AuditLog>>> {
    db::run_blocking(&state.db_pool, move |conn| {
        hosts::get(conn, id)?;
        audit_log::list_for_host(conn, id)
    })
    .await
    .map(Json)
}
