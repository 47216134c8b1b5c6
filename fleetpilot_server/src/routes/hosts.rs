use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{delete, get, post, State};
use serde::Deserialize;

use crate::auth::Actor;
use crate::db;
use crate::errors::FleetResult;
use crate::hosts::{self, EnrollRequest};
use crate::models::Host;
use crate::state::{now, AppState};

#[derive(Deserialize, Debug)]
pub struct TransferRequest {
    #[serde(default)]
    pub team_id: Option<i32>,
}

/// Enrollment callback, called once per (re-)enrollment.
#[post("/api/hosts/enroll", format = "json", data = "<req>")]
pub async fn enroll_host(state: &State<AppState>, req: Json<EnrollRequest>) -> FleetResult<Json<Host>> {
    let transport = state.transport.clone();
    let req = req.into_inner();
    db::run_blocking(&state.db_pool, move |conn| hosts::enroll(conn, transport.as_ref(), &req, now()))
        .await
        .map(Json)
}

#[get("/api/hosts/<id>")]
pub async fn get_host(state: &State<AppState>, id: i32) -> FleetResult<Json<Host>> {
    db::run_blocking(&state.db_pool, move |conn| hosts::get(conn, id))
        .await
        .map(Json)
}

#[delete("/api/hosts/<id>")]
pub async fn delete_host(state: &State<AppState>, actor: Actor, id: i32) -> FleetResult<Status> {
    db::run_blocking(&state.db_pool, move |conn| hosts::delete(conn, id, actor.name(), now())).await?;
    Ok(Status::NoContent)
}

#[post("/api/hosts/<id>/transfer", format = "json", data = "<req>")]
pub async fn transfer_host(
    state: &State<AppState>,
    actor: Actor,
    id: i32,
    req: Json<TransferRequest>,
) -> FleetResult<Json<Host>> {
    let settings = state.settings_snapshot()?;
    let client = state.dep_client.clone();
    let team_id = req.team_id;
    db::run_blocking(&state.db_pool, move |conn| {
        hosts::transfer(conn, client.as_ref(), &settings, id, team_id, actor.name(), now())
    })
    .await
    .map(Json)
}
