use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use diesel::SqliteConnection;

use crate::db;
use crate::models::{EnrollmentMethod, Host, NewHost, NewSetupItem, Platform, SetupItem, Team};
use crate::schema::{hosts, team_setup_items, teams};

/// Fresh in-memory database with all migrations applied.
pub fn conn() -> SqliteConnection {
    let mut conn = SqliteConnection::establish(":memory:").expect("open in-memory sqlite");
    db::run_migrations(&mut conn).expect("run migrations");
    conn
}

pub fn now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 6, 1)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .expect("valid fixed timestamp")
}

pub fn insert_host(
    conn: &mut SqliteConnection,
    serial: &str,
    platform: Platform,
    method: EnrollmentMethod,
    team_id: Option<i32>,
) -> Host {
    let uuid = format!("uuid-{}", serial);
    diesel::insert_into(hosts::table)
        .values(&NewHost {
            uuid: &uuid,
            serial_number: serial,
            hostname: serial,
            platform: platform.as_str(),
            enrollment_method: method.as_str(),
            team_id,
            mdm_enrolled: true,
            last_checkin: Some(now()),
            created_at: now(),
        })
        .execute(conn)
        .expect("insert host");

    hosts::table
        .filter(hosts::uuid.eq(&uuid))
        .select(Host::as_select())
        .first(conn)
        .expect("load host")
}

pub fn insert_team(conn: &mut SqliteConnection, name: &str, profile: Option<&str>) -> Team {
    diesel::insert_into(teams::table)
        .values((
            teams::name.eq(name),
            teams::dep_profile_uuid.eq(profile),
        ))
        .execute(conn)
        .expect("insert team");

    teams::table
        .filter(teams::name.eq(name))
        .select(Team::as_select())
        .first(conn)
        .expect("load team")
}

pub fn item(team_id: i32, kind: &str, name: &str) -> NewSetupItem {
    NewSetupItem {
        team_id,
        kind: kind.to_string(),
        name: name.to_string(),
        payload: Some(format!("payload for {}", name)),
        source: None,
        bundle_identifier: None,
        version: None,
        licenses_available: None,
    }
}

pub fn vpp_item(team_id: i32, name: &str, bundle: &str, licenses: Option<i32>) -> NewSetupItem {
    NewSetupItem {
        source: Some("vpp".to_string()),
        bundle_identifier: Some(bundle.to_string()),
        version: Some("1.0".to_string()),
        licenses_available: licenses,
        ..item(team_id, "software", name)
    }
}

pub fn insert_item(conn: &mut SqliteConnection, item: NewSetupItem) -> SetupItem {
    diesel::insert_into(team_setup_items::table)
        .values(&item)
        .execute(conn)
        .expect("insert setup item");

    team_setup_items::table
        .order(team_setup_items::id.desc())
        .select(SetupItem::as_select())
        .first(conn)
        .expect("load setup item")
}
