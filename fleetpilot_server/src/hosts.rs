use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::Deserialize;

use crate::audit_log;
use crate::dep::{self, DepClient, SyncTrigger};
use crate::device_actions;
use crate::errors::{FleetError, FleetResult};
use crate::models::{EnrollmentMethod, Host, NewHost, Platform};
use crate::schema::{
    host_commands, host_dep_assignments, host_device_actions, host_software_installs, hosts,
    setup_experience_results, teams,
};
use crate::settings::ServerSettings;
use crate::setup_experience;
use crate::transport::CommandTransport;

/// Body of `POST /api/hosts/enroll`.
#[derive(Deserialize, Debug, Clone)]
pub struct EnrollRequest {
    pub uuid: String,
    pub serial_number: String,
    pub hostname: String,
    pub platform: Platform,
    pub enrollment_method: EnrollmentMethod,
    #[serde(default)]
    pub team_id: Option<i32>,
}

pub fn get(conn: &mut SqliteConnection, host_id: i32) -> FleetResult<Host> {
    hosts::table
        .find(host_id)
        .select(Host::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| FleetError::not_found(format!("host {}", host_id)))
}

pub fn get_by_uuid(conn: &mut SqliteConnection, uuid: &str) -> FleetResult<Host> {
    hosts::table
        .filter(hosts::uuid.eq(uuid))
        .select(Host::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| FleetError::not_found(format!("host {}", uuid)))
}

pub fn touch_checkin(conn: &mut SqliteConnection, host_id: i32, now: NaiveDateTime) -> FleetResult<()> {
    diesel::update(hosts::table.find(host_id))
        .set(hosts::last_checkin.eq(Some(now)))
        .execute(conn)?;
    Ok(())
}

fn ensure_team(conn: &mut SqliteConnection, team_id: Option<i32>) -> FleetResult<()> {
    if let Some(id) = team_id {
        let exists: i64 = teams::table.filter(teams::id.eq(id)).count().get_result(conn)?;
        if exists == 0 {
            return Err(FleetError::not_found(format!("team {}", id)));
        }
    }
    Ok(())
}

/// Enroll or re-enroll a device. A re-enrolling device returns to the
/// baseline lock state and gets a fresh setup pipeline.
pub fn enroll(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    req: &EnrollRequest,
    now: NaiveDateTime,
) -> FleetResult<Host> {
    conn.transaction(|conn| {
        ensure_team(conn, req.team_id)?;

        let existing = hosts::table
            .filter(hosts::uuid.eq(&req.uuid))
            .select(hosts::id)
            .first::<i32>(conn)
            .optional()?;

        match existing {
            Some(id) => {
                diesel::update(hosts::table.find(id))
                    .set((
                        hosts::serial_number.eq(&req.serial_number),
                        hosts::hostname.eq(&req.hostname),
                        hosts::platform.eq(req.platform.as_str()),
                        hosts::enrollment_method.eq(req.enrollment_method.as_str()),
                        hosts::team_id.eq(req.team_id),
                        hosts::mdm_enrolled.eq(true),
                        hosts::last_checkin.eq(Some(now)),
                        hosts::setup_released_at.eq(None::<NaiveDateTime>),
                    ))
                    .execute(conn)?;
            }
            None => {
                diesel::insert_into(hosts::table)
                    .values(&NewHost {
                        uuid: &req.uuid,
                        serial_number: &req.serial_number,
                        hostname: &req.hostname,
                        platform: req.platform.as_str(),
                        enrollment_method: req.enrollment_method.as_str(),
                        team_id: req.team_id,
                        mdm_enrolled: true,
                        last_checkin: Some(now),
                        created_at: now,
                    })
                    .execute(conn)?;
            }
        }

        let host = get_by_uuid(conn, &req.uuid)?;
        device_actions::reset_on_enrollment(conn, transport, host.id, now)?;

        if req.enrollment_method == EnrollmentMethod::Automatic {
            dep::ensure_assignment(conn, host.id, now)?;
            setup_experience::compute_pipeline(conn, transport, host.id, now)?;
        }

        audit_log::log_activity(
            conn,
            audit_log::SYSTEM_ACTOR,
            "enrolled_host",
            Some(host.id),
            Some(&host.serial_number),
            Some(&serde_json::json!({
                "platform": req.platform,
                "enrollment_method": req.enrollment_method,
                "reenrolled": existing.is_some(),
            })),
            now,
        )?;
        log::info!(
            "Host {} ({}, {}) enrolled {}",
            host.id,
            host.serial_number,
            host.platform,
            host.enrollment_method
        );
        Ok(host)
    })
}

/// Move a host to another team (or none). Automatically enrolled hosts get
/// their enrollment profile re-assigned unless a retry is already scheduled.
pub fn transfer(
    conn: &mut SqliteConnection,
    client: &dyn DepClient,
    settings: &ServerSettings,
    host_id: i32,
    team_id: Option<i32>,
    actor: &str,
    now: NaiveDateTime,
) -> FleetResult<Host> {
    let host = conn.transaction(|conn| {
        let host = get(conn, host_id)?;
        ensure_team(conn, team_id)?;

        diesel::update(hosts::table.find(host.id))
            .set(hosts::team_id.eq(team_id))
            .execute(conn)?;

        audit_log::log_activity(
            conn,
            actor,
            "transferred_host",
            Some(host.id),
            None,
            Some(&serde_json::json!({ "from_team": host.team_id, "to_team": team_id })),
            now,
        )?;
        get(conn, host.id)
    })?;

    if host.enrollment_method()? == EnrollmentMethod::Automatic {
        dep::sync_assignments(conn, client, settings, &[host.id], SyncTrigger::Event, now)?;
    }
    Ok(host)
}

/// Remove a host with everything derived from it.
pub fn delete(conn: &mut SqliteConnection, host_id: i32, actor: &str, now: NaiveDateTime) -> FleetResult<()> {
    conn.transaction(|conn| {
        let host = get(conn, host_id)?;

        diesel::delete(host_device_actions::table.filter(host_device_actions::host_id.eq(host.id)))
            .execute(conn)?;
        diesel::delete(host_commands::table.filter(host_commands::host_id.eq(host.id))).execute(conn)?;
        diesel::delete(host_software_installs::table.filter(host_software_installs::host_id.eq(host.id)))
            .execute(conn)?;
        diesel::delete(setup_experience_results::table.filter(setup_experience_results::host_id.eq(host.id)))
            .execute(conn)?;
        diesel::delete(host_dep_assignments::table.filter(host_dep_assignments::host_id.eq(host.id)))
            .execute(conn)?;
        diesel::delete(hosts::table.find(host.id)).execute(conn)?;

        audit_log::log_activity(
            conn,
            actor,
            "deleted_host",
            Some(host.id),
            Some(&host.serial_number),
            None,
            now,
        )?;
        log::info!("Host {} ({}) deleted by {}", host.id, host.serial_number, actor);
        Ok(())
    })
}
