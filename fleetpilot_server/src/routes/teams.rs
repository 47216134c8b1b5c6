use rocket::serde::json::Json;
use rocket::{post, put, State};
use serde::Deserialize;

use crate::auth::Actor;
use crate::db;
use crate::dep::SyncReport;
use crate::errors::FleetResult;
use crate::models::{NewSetupItem, NewTeam, SetupItem, Team};
use crate::state::{now, AppState};
use crate::teams;

#[derive(Deserialize, Debug)]
pub struct DepProfileRequest {
    #[serde(default)]
    pub profile_uuid: Option<String>,
}

#[post("/api/teams", format = "json", data = "<team>")]
pub async fn create_team(state: &State<AppState>, actor: Actor, team: Json<NewTeam>) -> FleetResult<Json<Team>> {
    let team = team.into_inner();
    db::run_blocking(&state.db_pool, move |conn| teams::create(conn, &team, actor.name(), now()))
        .await
        .map(Json)
}

/// Team 0 holds the items of hosts without a team.
#[post("/api/teams/<id>/setup_items", format = "json", data = "<item>")]
pub async fn add_setup_item(
    state: &State<AppState>,
    actor: Actor,
    id: i32,
    item: Json<NewSetupItem>,
) -> FleetResult<Json<SetupItem>> {
    let item = item.into_inner();
    db::run_blocking(&state.db_pool, move |conn| teams::add_setup_item(conn, id, &item, actor.name(), now()))
        .await
        .map(Json)
}

#[put("/api/teams/<id>/dep_profile", format = "json", data = "<req>")]
pub async fn set_dep_profile(
    state: &State<AppState>,
    actor: Actor,
    id: i32,
    req: Json<DepProfileRequest>,
) -> FleetResult<Json<SyncReport>> {
    let settings = state.settings_snapshot()?;
    let client = state.dep_client.clone();
    let profile = req.into_inner().profile_uuid.filter(|p| !p.is_empty());
    db::run_blocking(&state.db_pool, move |conn| {
        teams::set_dep_profile(conn, client.as_ref(), &settings, id, profile.as_deref(), actor.name(), now())
    })
    .await
    .map(Json)
}
