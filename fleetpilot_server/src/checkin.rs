//! Routes device reports (MDM command results, agent script and install
//! results, Idle check-ins) to the component that owns the transition.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::Deserialize;

use crate::audit_log::{self, SYSTEM_ACTOR};
use crate::device_actions;
use crate::errors::{FleetError, FleetResult};
use crate::hosts;
use crate::models::{CommandKind, CommandStatus, Host, StepStatus};
use crate::settings::ServerSettings;
use crate::setup_experience;
use crate::transport::{self, CommandTransport, RecordedResult};
use crate::verification::{self, InstalledApp};

/// Status field of an MDM check-in report.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdmStatus {
    Acknowledged,
    Error,
    NotNow,
    Idle,
}

/// Body of `POST /api/mdm/<uuid>/results`.
#[derive(Deserialize, Debug, Clone)]
pub struct MdmReport {
    pub status: MdmStatus,
    #[serde(default)]
    pub command_uuid: Option<String>,
    #[serde(default)]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub installed_apps: Option<Vec<InstalledApp>>,
}

fn record_for_host(
    conn: &mut SqliteConnection,
    host: &Host,
    command_uuid: &str,
    status: CommandStatus,
    result: Option<&str>,
    exit_code: Option<i32>,
    now: NaiveDateTime,
) -> FleetResult<Option<RecordedResult>> {
    match transport::get_command(conn, command_uuid)? {
        Some(cmd) if cmd.host_id != host.id => {
            return Err(FleetError::not_found(format!("command {} for host {}", command_uuid, host.uuid)));
        }
        None => return Err(FleetError::not_found(format!("command {}", command_uuid))),
        Some(_) => {}
    }

    let recorded = transport::record_result(conn, command_uuid, status, result, exit_code, now)?;
    Ok(recorded.filter(|r| r.first_report))
}

/// The device action waiting on `reference`, fed its outcome. Returns false
/// when the reference tracks no pending action.
fn feed_device_action(
    conn: &mut SqliteConnection,
    host: &Host,
    reference: &str,
    success: bool,
    detail: Option<&str>,
    now: NaiveDateTime,
) -> FleetResult<bool> {
    match device_actions::action_for_reference(conn, host.id, reference)? {
        Some(action) => device_actions::on_transport_result(conn, host.id, action, reference, success, detail, now),
        None => Ok(false),
    }
}

pub fn handle_mdm_report(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    settings: &ServerSettings,
    host: &Host,
    report: &MdmReport,
    now: NaiveDateTime,
) -> FleetResult<()> {
    hosts::touch_checkin(conn, host.id, now)?;

    match report.status {
        MdmStatus::Idle => {
            device_actions::on_idle_checkin(conn, host.id, now)?;
            Ok(())
        }
        MdmStatus::NotNow => {
            log::debug!("Host {} deferred its commands", host.id);
            Ok(())
        }
        MdmStatus::Acknowledged | MdmStatus::Error => {
            let Some(command_uuid) = report.command_uuid.as_deref() else {
                return Err(FleetError::invalid_state("command result without command_uuid"));
            };
            handle_command_result(
                conn,
                transport,
                settings,
                host,
                command_uuid,
                report.status == MdmStatus::Acknowledged,
                report.error_detail.as_deref(),
                report.installed_apps.as_deref(),
                now,
            )
        }
    }
}

/// One acknowledged or failed MDM command, dispatched by command kind. The
/// result is recorded in the same transaction as the transition it drives,
/// so a failed transition leaves the command open for the device to resend.
#[allow(clippy::too_many_arguments)]
pub fn handle_command_result(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    settings: &ServerSettings,
    host: &Host,
    command_uuid: &str,
    success: bool,
    detail: Option<&str>,
    installed_apps: Option<&[InstalledApp]>,
    now: NaiveDateTime,
) -> FleetResult<()> {
    let status = if success { CommandStatus::Acknowledged } else { CommandStatus::Error };

    conn.transaction(|conn| {
        let Some(recorded) = record_for_host(conn, host, command_uuid, status, detail, None, now)? else {
            return Ok(());
        };

        match recorded.command.kind()? {
            CommandKind::DeviceLock
            | CommandKind::EnableLostMode
            | CommandKind::DisableLostMode
            | CommandKind::EraseDevice
            | CommandKind::RemoteWipe => {
                feed_device_action(conn, host, command_uuid, success, detail, now)?;
            }
            CommandKind::InstallApplication => {
                verification::on_install_ack(conn, transport, command_uuid, success, detail, now)?;
            }
            CommandKind::InstalledApplicationList => {
                // a failed listing counts as "not there yet"
                let apps = if success { installed_apps.unwrap_or_default() } else { &[] };
                verification::on_verification_result(conn, command_uuid, apps, settings, now)?;
            }
            CommandKind::InstallProfile
            | CommandKind::AccountConfiguration
            | CommandKind::InstallEnterpriseApplication => {
                let step_status = if success { StepStatus::Success } else { StepStatus::Failure };
                setup_experience::on_step_result(conn, host.id, command_uuid, step_status, now)?;
            }
            CommandKind::DeviceConfigured => {
                log::info!("Host {} confirmed release from setup", host.id);
            }
            CommandKind::SoftwareInstall => {
                verification::complete_install(conn, command_uuid, success, detail, now)?;
            }
            CommandKind::RunScript => {
                finish_script(conn, host, command_uuid, success, None, detail, now)?;
            }
        }
        Ok(())
    })
}

fn finish_script(
    conn: &mut SqliteConnection,
    host: &Host,
    execution_id: &str,
    success: bool,
    exit_code: Option<i32>,
    output: Option<&str>,
    now: NaiveDateTime,
) -> FleetResult<()> {
    // lock/unlock/wipe scripts log their own transition activity
    if feed_device_action(conn, host, execution_id, success, output, now)? {
        return Ok(());
    }

    let step_status = if success { StepStatus::Success } else { StepStatus::Failure };
    if !setup_experience::on_step_result(conn, host.id, execution_id, step_status, now)? {
        log::info!("Ignoring result for script {} no longer awaited", execution_id);
        return Ok(());
    }

    audit_log::log_activity(
        conn,
        SYSTEM_ACTOR,
        if success { "ran_script" } else { "ran_script_failed" },
        Some(host.id),
        Some(execution_id),
        Some(&serde_json::json!({ "exit_code": exit_code })),
        now,
    )?;
    Ok(())
}

/// Agent posted the outcome of a script execution.
pub fn handle_script_result(
    conn: &mut SqliteConnection,
    host: &Host,
    execution_id: &str,
    exit_code: i32,
    output: Option<&str>,
    now: NaiveDateTime,
) -> FleetResult<()> {
    hosts::touch_checkin(conn, host.id, now)?;
    let success = exit_code == 0;
    let status = if success { CommandStatus::Acknowledged } else { CommandStatus::Error };

    conn.transaction(|conn| {
        if record_for_host(conn, host, execution_id, status, output, Some(exit_code), now)?.is_none() {
            log::info!("Ignoring result for script {} no longer awaited", execution_id);
            return Ok(());
        }
        finish_script(conn, host, execution_id, success, Some(exit_code), output, now)
    })
}

/// Agent posted the outcome of a package install.
pub fn handle_software_result(
    conn: &mut SqliteConnection,
    host: &Host,
    install_uuid: &str,
    exit_code: i32,
    output: Option<&str>,
    now: NaiveDateTime,
) -> FleetResult<()> {
    hosts::touch_checkin(conn, host.id, now)?;
    let success = exit_code == 0;
    let status = if success { CommandStatus::Acknowledged } else { CommandStatus::Error };

    conn.transaction(|conn| {
        if record_for_host(conn, host, install_uuid, status, output, Some(exit_code), now)?.is_none() {
            log::info!("Ignoring result for install {} no longer awaited", install_uuid);
            return Ok(());
        }
        verification::complete_install(conn, install_uuid, success, output, now)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceStatus, EnrollmentMethod, Platform, TransportKind};
    use crate::test_support;
    use crate::transport::{fetch_pending, QueuedTransport};

    #[test]
    fn lock_script_result_drives_the_state_machine() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "LNX1", Platform::Linux, EnrollmentMethod::Manual, None);

        device_actions::request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap();
        let script = fetch_pending(&mut conn, host.id, TransportKind::Pull, now).unwrap().remove(0);
        handle_script_result(&mut conn, &host, &script.command_uuid, 0, Some(""), now).unwrap();

        let status = device_actions::get_status(&mut conn, host.id, now).unwrap();
        assert_eq!(status.device_status, DeviceStatus::Locked);
        assert_eq!(audit_log::count_for_host(&mut conn, host.id, "host_locked").unwrap(), 1);
        assert_eq!(audit_log::count_for_host(&mut conn, host.id, "ran_script").unwrap(), 0);

        // duplicate delivery of the same result is harmless
        handle_script_result(&mut conn, &host, &script.command_uuid, 0, Some(""), now).unwrap();
        assert_eq!(audit_log::count_for_host(&mut conn, host.id, "host_locked").unwrap(), 1);
    }

    #[test]
    fn failed_transition_leaves_the_result_open_for_a_resend() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "LNX1", Platform::Linux, EnrollmentMethod::Manual, None);

        device_actions::request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap();
        let script = fetch_pending(&mut conn, host.id, TransportKind::Pull, now).unwrap().remove(0);

        diesel::sql_query(
            "CREATE TRIGGER block_action_updates BEFORE UPDATE ON host_device_actions \
             BEGIN SELECT RAISE(ABORT, 'transient'); END",
        )
        .execute(&mut conn)
        .unwrap();
        let err = handle_script_result(&mut conn, &host, &script.command_uuid, 0, Some(""), now).unwrap_err();
        assert_eq!(err.kind(), "internal");
        assert!(transport::is_outstanding(&mut conn, &script.command_uuid).unwrap());

        diesel::sql_query("DROP TRIGGER block_action_updates").execute(&mut conn).unwrap();
        handle_script_result(&mut conn, &host, &script.command_uuid, 0, Some(""), now).unwrap();

        let status = device_actions::get_status(&mut conn, host.id, now).unwrap();
        assert_eq!(status.device_status, DeviceStatus::Locked);
        assert_eq!(status.pending_action, None);
        assert!(device_actions::request_unlock(&mut conn, &QueuedTransport, host.id, "alice", now).is_ok());
    }

    #[test]
    fn late_result_for_canceled_setup_script_is_ignored() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let settings = ServerSettings::default();
        let host = test_support::insert_host(&mut conn, "LNX2", Platform::Linux, EnrollmentMethod::Automatic, None);
        test_support::insert_item(&mut conn, test_support::item(0, "script", "X"));

        setup_experience::compute_pipeline(&mut conn, &QueuedTransport, host.id, now).unwrap();
        setup_experience::poll_status(&mut conn, &QueuedTransport, host.id, false, &settings, now).unwrap();
        let script = fetch_pending(&mut conn, host.id, TransportKind::Pull, now).unwrap().remove(0);
        setup_experience::cancel_step(&mut conn, &QueuedTransport, host.id, &script.command_uuid, "alice", now).unwrap();

        handle_script_result(&mut conn, &host, &script.command_uuid, 0, Some("done"), now).unwrap();
        assert_eq!(audit_log::count_for_host(&mut conn, host.id, "ran_script").unwrap(), 0);
        let steps = setup_experience::list_steps(&mut conn, host.id).unwrap();
        assert_eq!(steps[0].status, "failure");
    }

    #[test]
    fn mdm_error_fails_the_pending_action() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let settings = ServerSettings::default();
        let host = test_support::insert_host(&mut conn, "IPH1", Platform::Ios, EnrollmentMethod::Automatic, None);

        device_actions::request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap();
        let cmd = fetch_pending(&mut conn, host.id, TransportKind::Push, now).unwrap().remove(0);
        let report = MdmReport {
            status: MdmStatus::Error,
            command_uuid: Some(cmd.command_uuid.clone()),
            error_detail: Some("not supervised".into()),
            installed_apps: None,
        };
        handle_mdm_report(&mut conn, &QueuedTransport, &settings, &host, &report, now).unwrap();

        let status = device_actions::get_status(&mut conn, host.id, now).unwrap();
        assert_eq!(status.device_status, DeviceStatus::Unlocked);
        assert_eq!(status.pending_action, None);
        assert_eq!(audit_log::count_for_host(&mut conn, host.id, "lock_host_failed").unwrap(), 1);
    }

    #[test]
    fn results_for_another_hosts_command_are_rejected() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let a = test_support::insert_host(&mut conn, "A", Platform::Linux, EnrollmentMethod::Manual, None);
        let b = test_support::insert_host(&mut conn, "B", Platform::Linux, EnrollmentMethod::Manual, None);

        device_actions::request_lock(&mut conn, &QueuedTransport, a.id, false, "alice", now).unwrap();
        let script = fetch_pending(&mut conn, a.id, TransportKind::Pull, now).unwrap().remove(0);

        let err = handle_script_result(&mut conn, &b, &script.command_uuid, 0, None, now).unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(device_actions::get_status(&mut conn, a.id, now).unwrap().pending_action.is_some());
    }

    #[test]
    fn idle_report_touches_checkin_and_downgrades_locked_mac() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let settings = ServerSettings::default();
        let host = test_support::insert_host(&mut conn, "MAC1", Platform::Macos, EnrollmentMethod::Automatic, None);

        device_actions::request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap();
        let cmd = fetch_pending(&mut conn, host.id, TransportKind::Push, now).unwrap().remove(0);
        handle_command_result(&mut conn, &QueuedTransport, &settings, &host, &cmd.command_uuid, true, None, None, now)
            .unwrap();
        assert_eq!(device_actions::get_status(&mut conn, host.id, now).unwrap().device_status, DeviceStatus::Locked);

        let later = now + chrono::Duration::hours(1);
        let idle = MdmReport { status: MdmStatus::Idle, command_uuid: None, error_detail: None, installed_apps: None };
        handle_mdm_report(&mut conn, &QueuedTransport, &settings, &host, &idle, later).unwrap();

        assert_eq!(device_actions::get_status(&mut conn, host.id, later).unwrap().device_status, DeviceStatus::Unlocked);
        assert_eq!(hosts::get(&mut conn, host.id).unwrap().last_checkin, Some(later));
    }
}
