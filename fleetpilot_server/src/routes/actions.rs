use rocket::serde::json::Json;
use rocket::{get, post, State};

use crate::auth::Actor;
use crate::db;
use crate::device_actions::{self, DeviceActionStatus};
use crate::errors::FleetResult;
use crate::state::{now, AppState};

/// LOCK HOST
/// `view_pin` returns the generated unlock PIN in the response.
#[post("/api/hosts/<id>/lock?<view_pin>")]
pub async fn lock_host(
    state: &State<AppState>,
    actor: Actor,
    id: i32,
    view_pin: Option<bool>,
) -> FleetResult<Json<DeviceActionStatus>> {
    let transport = state.transport.clone();
    db::run_blocking(&state.db_pool, move |conn| {
        device_actions::request_lock(conn, transport.as_ref(), id, view_pin.unwrap_or(false), actor.name(), now())
    })
    .await
    .map(Json)
}

/// UNLOCK HOST
#[post("/api/hosts/<id>/unlock")]
pub async fn unlock_host(state: &State<AppState>, actor: Actor, id: i32) -> FleetResult<Json<DeviceActionStatus>> {
    let transport = state.transport.clone();
    db::run_blocking(&state.db_pool, move |conn| {
        device_actions::request_unlock(conn, transport.as_ref(), id, actor.name(), now())
    })
    .await
    .map(Json)
}

/// WIPE HOST
#[post("/api/hosts/<id>/wipe")]
pub async fn wipe_host(state: &State<AppState>, actor: Actor, id: i32) -> FleetResult<Json<DeviceActionStatus>> {
    let transport = state.transport.clone();
    db::run_blocking(&state.db_pool, move |conn| {
        device_actions::request_wipe(conn, transport.as_ref(), id, actor.name(), now())
    })
    .await
    .map(Json)
}

#[get("/api/hosts/<id>/device_status")]
pub async fn device_status(state: &State<AppState>, id: i32) -> FleetResult<Json<DeviceActionStatus>> {
    db::run_blocking(&state.db_pool, move |conn| device_actions::get_status(conn, id, now()))
        .await
        .map(Json)
}
