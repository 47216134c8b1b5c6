//! Setup-experience sequencer.
//!
//! A host's onboarding is materialized as one `setup_experience_results`
//! row per declared item. Phases gate each other strictly: profiles, then
//! the bootstrap package, then software (concurrently), then the script.
//! Phase 1 goes out with [`compute_pipeline`]; everything after it is
//! dispatched from [`poll_status`], derived from the persisted rows.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::Serialize;

use crate::audit_log::{self, SYSTEM_ACTOR};
use crate::errors::{FleetError, FleetResult};
use crate::hosts;
use crate::models::{
    CommandKind, Host, InstallStatus, NewSetupResult, SetupItem, SetupResult, SetupStep,
    SoftwareSource, StepStatus,
};
use crate::schema::{hosts as hosts_table, setup_experience_results, team_setup_items};
use crate::settings::ServerSettings;
use crate::transport::{new_command_uuid, CommandTransport};
use crate::verification;

pub const AGENT_PROFILE_NAME: &str = "Fleet agent enrollment";
const AGENT_PROFILE_IDENTIFIER: &str = "com.fleetpilot.agent-enrollment";
const NO_LICENSE: &str = "no license available";

/// Phase a step belongs to. Lower phases gate higher ones.
fn phase(step: SetupStep) -> u8 {
    match step {
        SetupStep::Profile | SetupStep::AccountConfiguration => 1,
        SetupStep::BootstrapPackage => 2,
        SetupStep::Software => 3,
        SetupStep::Script => 4,
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct SetupExperienceStatus {
    pub host_id: i32,
    pub released: bool,
    pub released_at: Option<NaiveDateTime>,
    pub steps: Vec<SetupResult>,
}

pub fn list_steps(conn: &mut SqliteConnection, host_id: i32) -> FleetResult<Vec<SetupResult>> {
    let rows = setup_experience_results::table
        .filter(setup_experience_results::host_id.eq(host_id))
        .order(setup_experience_results::id.asc())
        .select(SetupResult::as_select())
        .load(conn)?;
    Ok(rows)
}

fn get_step(conn: &mut SqliteConnection, host_id: i32, execution_id: &str) -> FleetResult<SetupResult> {
    setup_experience_results::table
        .filter(setup_experience_results::host_id.eq(host_id))
        .filter(setup_experience_results::execution_id.eq(execution_id))
        .select(SetupResult::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| FleetError::not_found(format!("setup step {}", execution_id)))
}

fn insert_step(
    conn: &mut SqliteConnection,
    host_id: i32,
    step: SetupStep,
    name: &str,
    setup_item_id: Option<i32>,
    now: NaiveDateTime,
) -> FleetResult<()> {
    let execution_id = new_command_uuid();
    diesel::insert_into(setup_experience_results::table)
        .values(&NewSetupResult {
            host_id,
            step: step.as_str(),
            name,
            status: StepStatus::Pending.as_str(),
            execution_id: &execution_id,
            setup_item_id,
            updated_at: now,
        })
        .execute(conn)?;
    Ok(())
}

/// Materialize the host's pipeline from its team's declarations. Replaces
/// any previous pipeline, withdrawing its undelivered commands. Execution
/// ids are assigned here so steps can be canceled before they are
/// dispatched. Phase 1 (profiles) is delivered right away as part of
/// enrollment.
pub fn compute_pipeline(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    host_id: i32,
    now: NaiveDateTime,
) -> FleetResult<Vec<SetupResult>> {
    conn.transaction(|conn| {
        let host = hosts::get(conn, host_id)?;

        for row in list_steps(conn, host.id)? {
            transport.cancel(conn, &row.execution_id, now)?;
        }
        diesel::delete(setup_experience_results::table.filter(setup_experience_results::host_id.eq(host.id)))
            .execute(conn)?;

        let items: Vec<SetupItem> = team_setup_items::table
            .filter(team_setup_items::team_id.eq(host.team_key()))
            .order(team_setup_items::id.asc())
            .select(SetupItem::as_select())
            .load(conn)?;

        if host.platform()?.is_apple() {
            insert_step(conn, host.id, SetupStep::Profile, AGENT_PROFILE_NAME, None, now)?;
        }

        let mut scripts = 0;
        for item in &items {
            let step = item.kind()?;
            if step == SetupStep::Script {
                // a single script runs last; later declarations replace earlier ones
                scripts += 1;
                if scripts > 1 {
                    diesel::delete(
                        setup_experience_results::table
                            .filter(setup_experience_results::host_id.eq(host.id))
                            .filter(setup_experience_results::step.eq(SetupStep::Script.as_str())),
                    )
                    .execute(conn)?;
                }
            }
            insert_step(conn, host.id, step, &item.name, Some(item.id), now)?;
        }

        for row in list_steps(conn, host.id)? {
            if phase(row.step()?) == 1 {
                dispatch_step(conn, transport, &host, &row, now)?;
            }
        }

        log::info!("Computed setup pipeline for host {} ({} items)", host.id, items.len());
        list_steps(conn, host.id)
    })
}

fn mark_step(
    conn: &mut SqliteConnection,
    row_id: i32,
    from: &[StepStatus],
    to: StepStatus,
    now: NaiveDateTime,
) -> FleetResult<bool> {
    let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
    let n = diesel::update(
        setup_experience_results::table
            .filter(setup_experience_results::id.eq(row_id))
            .filter(setup_experience_results::status.eq_any(from)),
    )
    .set((
        setup_experience_results::status.eq(to.as_str()),
        setup_experience_results::updated_at.eq(now),
    ))
    .execute(conn)?;
    Ok(n == 1)
}

fn load_item(conn: &mut SqliteConnection, item_id: Option<i32>) -> FleetResult<Option<SetupItem>> {
    let Some(id) = item_id else {
        return Ok(None);
    };
    let item = team_setup_items::table
        .find(id)
        .select(SetupItem::as_select())
        .first(conn)
        .optional()?;
    Ok(item)
}

/// Take one license from a capacity-limited item. Unlimited items always succeed.
fn take_license(conn: &mut SqliteConnection, item: &SetupItem) -> FleetResult<bool> {
    if item.licenses_available.is_none() {
        return Ok(true);
    }
    let n = diesel::update(
        team_setup_items::table
            .filter(team_setup_items::id.eq(item.id))
            .filter(team_setup_items::licenses_available.gt(0)),
    )
    .set(team_setup_items::licenses_available.eq(team_setup_items::licenses_available - 1))
    .execute(conn)?;
    Ok(n == 1)
}

/// Send the operation behind a pending step and mark it running. Steps that
/// cannot be dispatched are failed in place.
fn dispatch_step(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    host: &Host,
    row: &SetupResult,
    now: NaiveDateTime,
) -> FleetResult<()> {
    if !mark_step(conn, row.id, &[StepStatus::Pending], StepStatus::Running, now)? {
        return Ok(());
    }

    let item = load_item(conn, row.setup_item_id)?;
    let payload_of = |item: &Option<SetupItem>| item.as_ref().and_then(|i| i.payload.clone());

    match row.step()? {
        SetupStep::Profile => {
            let payload = match &item {
                Some(item) => serde_json::json!({ "name": item.name, "profile": item.payload }),
                None => serde_json::json!({
                    "name": AGENT_PROFILE_NAME,
                    "identifier": AGENT_PROFILE_IDENTIFIER,
                    "host_uuid": host.uuid,
                }),
            };
            transport.send_command(conn, host.id, &row.execution_id, CommandKind::InstallProfile, &payload, now)?;
        }
        SetupStep::AccountConfiguration => {
            let payload = serde_json::json!({ "configuration": payload_of(&item) });
            transport.send_command(
                conn,
                host.id,
                &row.execution_id,
                CommandKind::AccountConfiguration,
                &payload,
                now,
            )?;
        }
        SetupStep::BootstrapPackage => {
            let payload = serde_json::json!({ "manifest_url": payload_of(&item) });
            transport.send_command(
                conn,
                host.id,
                &row.execution_id,
                CommandKind::InstallEnterpriseApplication,
                &payload,
                now,
            )?;
        }
        SetupStep::Script => {
            let body = payload_of(&item).unwrap_or_default();
            transport.send_script(conn, host.id, &row.execution_id, &body, now)?;
        }
        SetupStep::Software => {
            let Some(item) = item else {
                mark_step(conn, row.id, &[StepStatus::Running], StepStatus::Failure, now)?;
                log::warn!("Setup step {} lost its software item", row.execution_id);
                return Ok(());
            };
            dispatch_software(conn, transport, host, row, &item, now)?;
        }
    }
    log::info!("Dispatched setup step {} ({}) for host {}", row.execution_id, row.step, host.id);
    Ok(())
}

fn dispatch_software(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    host: &Host,
    row: &SetupResult,
    item: &SetupItem,
    now: NaiveDateTime,
) -> FleetResult<()> {
    let source = item.source()?;

    if source == SoftwareSource::Vpp && !take_license(conn, item)? {
        verification::create_install(
            conn,
            host.id,
            &row.execution_id,
            item,
            InstallStatus::Failure,
            Some(NO_LICENSE),
            now,
        )?;
        mark_step(conn, row.id, &[StepStatus::Running], StepStatus::Failure, now)?;
        audit_log::log_activity(
            conn,
            SYSTEM_ACTOR,
            "install_software_failed",
            Some(host.id),
            Some(&row.execution_id),
            Some(&serde_json::json!({ "software": item.name, "source": source, "detail": NO_LICENSE })),
            now,
        )?;
        log::warn!("No license left for {} on host {}", item.name, host.id);
        return Ok(());
    }

    verification::create_install(conn, host.id, &row.execution_id, item, InstallStatus::Pending, None, now)?;
    match source {
        SoftwareSource::Vpp => {
            let payload = serde_json::json!({
                "bundle_identifier": item.bundle_identifier,
                "version": item.version,
            });
            transport.send_command(conn, host.id, &row.execution_id, CommandKind::InstallApplication, &payload, now)
        }
        SoftwareSource::Package => {
            let payload = serde_json::json!({ "name": item.name, "installer": item.payload });
            transport.send_command(conn, host.id, &row.execution_id, CommandKind::SoftwareInstall, &payload, now)
        }
    }
}

/// Record the outcome of a step's underlying work. Results for steps that
/// are already terminal (canceled, duplicated) are ignored.
pub fn on_step_result(
    conn: &mut SqliteConnection,
    host_id: i32,
    execution_id: &str,
    status: StepStatus,
    now: NaiveDateTime,
) -> FleetResult<bool> {
    let row = setup_experience_results::table
        .filter(setup_experience_results::host_id.eq(host_id))
        .filter(setup_experience_results::execution_id.eq(execution_id))
        .select(SetupResult::as_select())
        .first(conn)
        .optional()?;

    let Some(row) = row else {
        return Ok(false);
    };
    let updated = mark_step(conn, row.id, &[StepStatus::Pending, StepStatus::Running], status, now)?;
    if updated {
        log::info!("Setup step {} ({}) on host {}: {}", execution_id, row.step, host_id, status);
    }
    Ok(updated)
}

/// Send the release signal unless it already went out.
fn release(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    host: &Host,
    forced: bool,
    now: NaiveDateTime,
) -> FleetResult<bool> {
    let n = diesel::update(
        hosts_table::table
            .filter(hosts_table::id.eq(host.id))
            .filter(hosts_table::setup_released_at.is_null()),
    )
    .set(hosts_table::setup_released_at.eq(Some(now)))
    .execute(conn)?;

    if n == 0 {
        return Ok(false);
    }

    if host.platform()?.is_apple() {
        transport.send_command(
            conn,
            host.id,
            &new_command_uuid(),
            CommandKind::DeviceConfigured,
            &serde_json::json!({}),
            now,
        )?;
    }
    audit_log::log_activity(
        conn,
        SYSTEM_ACTOR,
        "released_setup_experience",
        Some(host.id),
        None,
        Some(&serde_json::json!({ "forced": forced })),
        now,
    )?;
    log::info!("Released host {} from setup (forced: {})", host.id, forced);
    Ok(true)
}

/// Read-only view for administrators; dispatches nothing.
pub fn get_status(conn: &mut SqliteConnection, host_id: i32) -> FleetResult<SetupExperienceStatus> {
    let host = hosts::get(conn, host_id)?;
    Ok(SetupExperienceStatus {
        host_id: host.id,
        released: host.setup_released_at.is_some(),
        released_at: host.setup_released_at,
        steps: list_steps(conn, host.id)?,
    })
}

/// Agent poll. Advances phases whose prerequisites are met, dispatching the
/// next batch of work, and releases the device once everything is terminal
/// or the release is forced.
pub fn poll_status(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    host_id: i32,
    force_release: bool,
    settings: &ServerSettings,
    now: NaiveDateTime,
) -> FleetResult<SetupExperienceStatus> {
    verification::expire_stale(conn, Some(host_id), settings, now)?;

    conn.transaction(|conn| {
        let host = hosts::get(conn, host_id)?;

        for current in 1..=4u8 {
            let rows: Vec<SetupResult> = list_steps(conn, host.id)?
                .into_iter()
                .filter(|r| r.step().map(|s| phase(s) == current).unwrap_or(false))
                .collect();

            for row in rows.iter().filter(|r| r.status == StepStatus::Pending.as_str()) {
                dispatch_step(conn, transport, &host, row, now)?;
            }

            let mut blocked = false;
            for row in list_steps(conn, host.id)? {
                if phase(row.step()?) == current && !row.status()?.is_terminal() {
                    blocked = true;
                }
            }
            if blocked {
                break;
            }
        }

        let steps = list_steps(conn, host.id)?;
        let mut all_terminal = true;
        for row in &steps {
            all_terminal &= row.status()?.is_terminal();
        }

        if all_terminal || force_release {
            release(conn, transport, &host, force_release && !all_terminal, now)?;
        }

        let host = hosts::get(conn, host.id)?;
        Ok(SetupExperienceStatus {
            host_id: host.id,
            released: host.setup_released_at.is_some(),
            released_at: host.setup_released_at,
            steps,
        })
    })
}

/// Administrator cancels a software install or the script. Undelivered work
/// is withdrawn; delivered work cannot be recalled, its late result is ignored.
pub fn cancel_step(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    host_id: i32,
    execution_id: &str,
    actor: &str,
    now: NaiveDateTime,
) -> FleetResult<SetupResult> {
    conn.transaction(|conn| {
        let row = get_step(conn, host_id, execution_id)?;
        let step = row.step()?;
        if !matches!(step, SetupStep::Software | SetupStep::Script) {
            return Err(FleetError::invalid_state(format!("{} steps cannot be canceled", step)));
        }
        if row.status()?.is_terminal() {
            return Err(FleetError::Conflict(format!("setup step {} already finished", execution_id)));
        }

        let withdrawn = transport.cancel(conn, execution_id, now)?;
        mark_step(conn, row.id, &[StepStatus::Pending, StepStatus::Running], StepStatus::Failure, now)?;
        if step == SetupStep::Software {
            verification::complete_install(conn, execution_id, false, Some("canceled"), now)?;
        }

        audit_log::log_activity(
            conn,
            actor,
            "canceled_setup_experience_step",
            Some(host_id),
            Some(execution_id),
            Some(&serde_json::json!({ "step": step, "name": row.name, "withdrawn": withdrawn })),
            now,
        )?;
        log::info!("Setup step {} on host {} canceled by {}", execution_id, host_id, actor);
        get_step(conn, host_id, execution_id)
    })
}
