use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::SqliteConnection;

use crate::audit_log;
use crate::dep::{self, DepClient, SyncReport, SyncTrigger};
use crate::errors::{FleetError, FleetResult};
use crate::models::{EnrollmentMethod, NewSetupItem, NewTeam, SetupItem, SetupStep, SoftwareSource, Team};
use crate::schema::{hosts, team_setup_items, teams};
use crate::settings::ServerSettings;

pub fn get(conn: &mut SqliteConnection, team_id: i32) -> FleetResult<Team> {
    teams::table
        .find(team_id)
        .select(Team::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| FleetError::not_found(format!("team {}", team_id)))
}

pub fn create(conn: &mut SqliteConnection, new_team: &NewTeam, actor: &str, now: NaiveDateTime) -> FleetResult<Team> {
    conn.transaction(|conn| {
        let taken: i64 = teams::table
            .filter(teams::name.eq(&new_team.name))
            .count()
            .get_result(conn)?;
        if taken > 0 {
            return Err(FleetError::Conflict(format!("team {} already exists", new_team.name)));
        }

        diesel::insert_into(teams::table).values(new_team).execute(conn)?;
        let team = teams::table
            .filter(teams::name.eq(&new_team.name))
            .select(Team::as_select())
            .first(conn)?;

        audit_log::log_activity(conn, actor, "created_team", None, Some(&team.name), None, now)?;
        Ok(team)
    })
}

/// Declare one setup-experience item for a team (0 for hosts without a team).
pub fn add_setup_item(
    conn: &mut SqliteConnection,
    team_id: i32,
    item: &NewSetupItem,
    actor: &str,
    now: NaiveDateTime,
) -> FleetResult<SetupItem> {
    if team_id != 0 {
        get(conn, team_id)?;
    }

    let kind: SetupStep = item
        .kind
        .parse()
        .map_err(|_| FleetError::invalid_state(format!("unknown setup item kind {:?}", item.kind)))?;
    if kind == SetupStep::Software {
        let source: SoftwareSource = item
            .source
            .as_deref()
            .unwrap_or("package")
            .parse()
            .map_err(|_| FleetError::invalid_state("software source must be vpp or package"))?;
        if source == SoftwareSource::Vpp && item.bundle_identifier.is_none() {
            return Err(FleetError::invalid_state("vpp software needs a bundle_identifier"));
        }
    }
    if item.licenses_available.is_some_and(|n| n < 0) {
        return Err(FleetError::invalid_state("licenses_available cannot be negative"));
    }

    conn.transaction(|conn| {
        let row = NewSetupItem {
            team_id,
            ..item.clone()
        };
        diesel::insert_into(team_setup_items::table).values(&row).execute(conn)?;
        let created = team_setup_items::table
            .filter(team_setup_items::team_id.eq(team_id))
            .order(team_setup_items::id.desc())
            .select(SetupItem::as_select())
            .first(conn)?;

        audit_log::log_activity(
            conn,
            actor,
            "added_setup_item",
            None,
            Some(&created.name),
            Some(&serde_json::json!({ "team_id": team_id, "kind": kind })),
            now,
        )?;
        Ok(created)
    })
}

/// Change the team's enrollment profile and re-assign its automatic hosts.
pub fn set_dep_profile(
    conn: &mut SqliteConnection,
    client: &dyn DepClient,
    settings: &ServerSettings,
    team_id: i32,
    profile_uuid: Option<&str>,
    actor: &str,
    now: NaiveDateTime,
) -> FleetResult<SyncReport> {
    let team = get(conn, team_id)?;
    diesel::update(teams::table.find(team.id))
        .set(teams::dep_profile_uuid.eq(profile_uuid))
        .execute(conn)?;
    audit_log::log_activity(
        conn,
        actor,
        "edited_enrollment_profile",
        None,
        Some(&team.name),
        Some(&serde_json::json!({ "profile_uuid": profile_uuid })),
        now,
    )?;

    let host_ids: Vec<i32> = hosts::table
        .filter(hosts::team_id.eq(team.id))
        .filter(hosts::enrollment_method.eq(EnrollmentMethod::Automatic.as_str()))
        .select(hosts::id)
        .load(conn)?;
    dep::sync_assignments(conn, client, settings, &host_ids, SyncTrigger::Event, now)
}
