use rocket::serde::json::Json;
use rocket::{get, post, State};

use crate::audit_log;
use crate::auth::Actor;
use crate::db;
use crate::errors::{FleetError, FleetResult};
use crate::settings::{ServerSettings, SettingsUpdate};
use crate::state::{now, AppState};

/// VIEW SETTINGS
#[get("/api/settings")]
pub async fn view_settings(state: &State<AppState>) -> FleetResult<Json<ServerSettings>> {
    state.settings_snapshot().map(Json)
}

/// UPDATE SETTINGS
/// Persists the merged settings, then swaps the shared copy the loops read.
#[post("/api/settings", format = "json", data = "<update>")]
pub async fn update_settings(
    state: &State<AppState>,
    actor: Actor,
    update: Json<SettingsUpdate>,
) -> FleetResult<Json<ServerSettings>> {
    let update = update.into_inner();

    let saved = db::run_blocking(&state.db_pool, move |conn| {
        let mut settings = ServerSettings::try_load(conn)?;
        settings.apply(update);
        settings.save(conn)?;

        audit_log::log_activity(
            conn,
            actor.name(),
            "edited_settings",
            None,
            None,
            Some(&serde_json::to_value(&settings)?),
            now(),
        )?;
        Ok(settings)
    })
    .await?;

    let mut shared = state
        .settings
        .write()
        .map_err(|_| FleetError::Internal("settings lock poisoned".into()))?;
    *shared = saved.clone();
    log::info!("Server settings updated");

    Ok(Json(saved))
}
