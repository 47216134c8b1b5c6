use rocket::serde::json::Json;
use rocket::{get, post, State};

use crate::auth::Actor;
use crate::db;
use crate::errors::FleetResult;
use crate::models::SetupResult;
use crate::setup_experience::{self, SetupExperienceStatus};
use crate::state::{now, AppState};

#[get("/api/hosts/<id>/setup_experience")]
pub async fn host_setup_experience(state: &State<AppState>, id: i32) -> FleetResult<Json<SetupExperienceStatus>> {
    db::run_blocking(&state.db_pool, move |conn| setup_experience::get_status(conn, id))
        .await
        .map(Json)
}

#[post("/api/hosts/<id>/setup_experience/<execution_id>/cancel")]
pub async fn cancel_setup_step(
    state: &State<AppState>,
    actor: Actor,
    id: i32,
    execution_id: String,
) -> FleetResult<Json<SetupResult>> {
    let transport = state.transport.clone();
    db::run_blocking(&state.db_pool, move |conn| {
        setup_experience::cancel_step(conn, transport.as_ref(), id, &execution_id, actor.name(), now())
    })
    .await
    .map(Json)
}
