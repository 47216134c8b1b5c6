use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};

use crate::errors::FleetResult;
use crate::schema::audit_log;

/// Actor recorded for transitions driven by devices, jobs and schedules.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Queryable, Selectable, Serialize, Deserialize, Debug, Clone)]
#[diesel(table_name = audit_log)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AuditLog {
    pub id: i32,
    pub actor: String,
    pub action_type: String,
    pub host_id: Option<i32>,
    pub target: Option<String>,
    pub details: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = audit_log)]
struct NewAudit<'a> {
    actor: &'a str,
    action_type: &'a str,
    host_id: Option<i32>,
    target: Option<&'a str>,
    details: Option<&'a str>,
    created_at: NaiveDateTime,
}

/// Append one activity. Every transition gets its own row; entries are never merged.
pub fn log_activity(
    conn: &mut SqliteConnection,
    actor: &str,
    action_type: &str,
    host_id: Option<i32>,
    target: Option<&str>,
    details: Option<&serde_json::Value>,
    now: NaiveDateTime,
) -> FleetResult<()> {
    let details = details.map(|d| d.to_string());

    diesel::insert_into(audit_log::table)
        .values(&NewAudit {
            actor,
            action_type,
            host_id,
            target,
            details: details.as_deref(),
            created_at: now,
        })
        .execute(conn)?;

    log::debug!(
        "activity {} by {} (host {:?}, target {:?})",
        action_type,
        actor,
        host_id,
        target
    );
    Ok(())
}

pub fn list_for_host(conn: &mut SqliteConnection, host: i32) -> FleetResult<Vec<AuditLog>> {
    let rows = audit_log::table
        .filter(audit_log::host_id.eq(host))
        .order((audit_log::created_at.desc(), audit_log::id.desc()))
        .select(AuditLog::as_select())
        .load(conn)?;
    Ok(rows)
}

pub fn count_for_host(
    conn: &mut SqliteConnection,
    host: i32,
    action_type: &str,
) -> FleetResult<i64> {
    let n = audit_log::table
        .filter(audit_log::host_id.eq(host))
        .filter(audit_log::action_type.eq(action_type))
        .count()
        .get_result(conn)?;
    Ok(n)
}
