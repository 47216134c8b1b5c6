//! Software install tracking and the verification poller.
//!
//! VPP installs are acknowledged by the device before the app is actually
//! present, so an acknowledged install moves to `verifying` and the server
//! asks for the installed application list until the app shows up or the
//! timeout (measured from the acknowledgment) runs out.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audit_log::{self, SYSTEM_ACTOR};
use crate::errors::{FleetError, FleetResult};
use crate::jobs::{self, JobHandler};
use crate::models::{
    CommandKind, InstallStatus, Job, NewSoftwareInstall, SetupItem, SoftwareInstall,
    SoftwareSource, StepStatus,
};
use crate::schema::host_software_installs;
use crate::settings::ServerSettings;
use crate::setup_experience;
use crate::transport::{self, new_command_uuid, CommandTransport};

pub const VERIFY_INSTALL_JOB: &str = "verify_install";

/// One entry of an installed application list reported by a device.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InstalledApp {
    pub bundle_identifier: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_installed")]
    pub installed: bool,
}

fn default_installed() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug)]
struct VerifyInstallArgs {
    install_uuid: String,
}

pub fn get_install(conn: &mut SqliteConnection, install_uuid: &str) -> FleetResult<Option<SoftwareInstall>> {
    let install = host_software_installs::table
        .filter(host_software_installs::install_uuid.eq(install_uuid))
        .select(SoftwareInstall::as_select())
        .first(conn)
        .optional()?;
    Ok(install)
}

/// Record an install for a host. `status` is `Failure` when the install
/// could not even be dispatched (no license left).
pub fn create_install(
    conn: &mut SqliteConnection,
    host_id: i32,
    install_uuid: &str,
    item: &SetupItem,
    status: InstallStatus,
    detail: Option<&str>,
    now: NaiveDateTime,
) -> FleetResult<SoftwareInstall> {
    diesel::insert_into(host_software_installs::table)
        .values(&NewSoftwareInstall {
            install_uuid,
            host_id,
            name: &item.name,
            source: item.source()?.as_str(),
            bundle_identifier: item.bundle_identifier.as_deref(),
            version: item.version.as_deref(),
            status: status.as_str(),
            detail,
            created_at: now,
            updated_at: now,
        })
        .execute(conn)?;

    get_install(conn, install_uuid)?
        .ok_or_else(|| FleetError::not_found(format!("install {}", install_uuid)))
}

/// Move an install to a terminal status exactly once, log the activity and
/// let the setup sequencer know. Returns false if it was already terminal.
fn finish(
    conn: &mut SqliteConnection,
    install: &SoftwareInstall,
    status: InstallStatus,
    detail: Option<&str>,
    now: NaiveDateTime,
) -> FleetResult<bool> {
    let n = diesel::update(
        host_software_installs::table
            .filter(host_software_installs::id.eq(install.id))
            .filter(host_software_installs::status.eq_any([
                InstallStatus::Pending.as_str(),
                InstallStatus::Verifying.as_str(),
            ])),
    )
    .set((
        host_software_installs::status.eq(status.as_str()),
        host_software_installs::detail.eq(detail),
        host_software_installs::updated_at.eq(now),
    ))
    .execute(conn)?;

    if n == 0 {
        return Ok(false);
    }

    let (activity, step_status) = match status {
        InstallStatus::Success => ("installed_software", StepStatus::Success),
        _ => ("install_software_failed", StepStatus::Failure),
    };
    audit_log::log_activity(
        conn,
        SYSTEM_ACTOR,
        activity,
        Some(install.host_id),
        Some(&install.install_uuid),
        Some(&serde_json::json!({
            "software": install.name,
            "source": install.source,
            "detail": detail,
        })),
        now,
    )?;
    log::info!(
        "Install {} ({}) on host {}: {}",
        install.install_uuid,
        install.name,
        install.host_id,
        status
    );

    setup_experience::on_step_result(conn, install.host_id, &install.install_uuid, step_status, now)?;
    Ok(true)
}

/// Terminal result for an install that reports its own outcome (agent
/// package installs, local cancellation).
pub fn complete_install(
    conn: &mut SqliteConnection,
    install_uuid: &str,
    success: bool,
    detail: Option<&str>,
    now: NaiveDateTime,
) -> FleetResult<bool> {
    let Some(install) = get_install(conn, install_uuid)? else {
        log::warn!("Result for unknown install {}", install_uuid);
        return Ok(false);
    };
    let status = if success { InstallStatus::Success } else { InstallStatus::Failure };
    finish(conn, &install, status, detail, now)
}

/// Device acknowledged (or rejected) the install command. An explicit error
/// fails the install right away without polling.
pub fn on_install_ack(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    install_uuid: &str,
    success: bool,
    detail: Option<&str>,
    now: NaiveDateTime,
) -> FleetResult<()> {
    let Some(install) = get_install(conn, install_uuid)? else {
        log::warn!("Acknowledgment for unknown install {}", install_uuid);
        return Ok(());
    };
    if install.status()? != InstallStatus::Pending {
        return Ok(());
    }

    if !success {
        finish(conn, &install, InstallStatus::Failure, detail.or(Some("install command failed")), now)?;
        return Ok(());
    }

    // package installs carry their own result, only VPP needs confirming
    if install.source.parse::<SoftwareSource>()? == SoftwareSource::Package {
        finish(conn, &install, InstallStatus::Success, detail, now)?;
        return Ok(());
    }

    diesel::update(
        host_software_installs::table
            .filter(host_software_installs::id.eq(install.id))
            .filter(host_software_installs::status.eq(InstallStatus::Pending.as_str())),
    )
    .set((
        host_software_installs::status.eq(InstallStatus::Verifying.as_str()),
        host_software_installs::acknowledged_at.eq(Some(now)),
        host_software_installs::updated_at.eq(now),
    ))
    .execute(conn)?;

    start_verification(conn, transport, install_uuid, now)?;
    Ok(())
}

/// Ask the device for its installed applications. Returns the verification
/// command uuid, or None if one is still in flight or the install is no
/// longer being verified.
pub fn start_verification(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    install_uuid: &str,
    now: NaiveDateTime,
) -> FleetResult<Option<String>> {
    conn.transaction(|conn| {
        let Some(install) = get_install(conn, install_uuid)? else {
            return Ok(None);
        };
        if install.status()? != InstallStatus::Verifying {
            return Ok(None);
        }
        if let Some(in_flight) = install.verification_command_uuid.as_deref() {
            if transport::is_outstanding(conn, in_flight)? {
                log::debug!("Verification {} still in flight for install {}", in_flight, install_uuid);
                return Ok(None);
            }
        }

        let command_uuid = new_command_uuid();
        let payload = serde_json::json!({
            "identifiers": install.bundle_identifier.as_ref().map(|b| vec![b.clone()]).unwrap_or_default(),
            "managed_apps_only": true,
        });
        transport.send_command(
            conn,
            install.host_id,
            &command_uuid,
            CommandKind::InstalledApplicationList,
            &payload,
            now,
        )?;

        diesel::update(host_software_installs::table.filter(host_software_installs::id.eq(install.id)))
            .set((
                host_software_installs::verification_command_uuid.eq(Some(command_uuid.as_str())),
                host_software_installs::updated_at.eq(now),
            ))
            .execute(conn)?;

        Ok(Some(command_uuid))
    })
}

fn is_present(install: &SoftwareInstall, apps: &[InstalledApp]) -> bool {
    let Some(bundle) = install.bundle_identifier.as_deref() else {
        return false;
    };
    apps.iter().any(|app| {
        app.installed
            && app.bundle_identifier == bundle
            && match install.version.as_deref() {
                Some(expected) => app.version.as_deref() == Some(expected),
                None => true,
            }
    })
}

fn timed_out(install: &SoftwareInstall, settings: &ServerSettings, now: NaiveDateTime) -> bool {
    match install.acknowledged_at {
        Some(acked) => now - acked >= settings.verification_timeout(),
        None => false,
    }
}

/// Installed application list came back for verification command `command_uuid`.
pub fn on_verification_result(
    conn: &mut SqliteConnection,
    command_uuid: &str,
    installed_apps: &[InstalledApp],
    settings: &ServerSettings,
    now: NaiveDateTime,
) -> FleetResult<Option<InstallStatus>> {
    let install = host_software_installs::table
        .filter(host_software_installs::verification_command_uuid.eq(command_uuid))
        .filter(host_software_installs::status.eq(InstallStatus::Verifying.as_str()))
        .select(SoftwareInstall::as_select())
        .first(conn)
        .optional()?;

    let Some(install) = install else {
        log::debug!("Verification {} matches no install awaiting confirmation", command_uuid);
        return Ok(None);
    };

    if is_present(&install, installed_apps) {
        finish(conn, &install, InstallStatus::Success, None, now)?;
        return Ok(Some(InstallStatus::Success));
    }

    if timed_out(&install, settings, now) {
        let reason = FleetError::Timeout(format!(
            "{} not reported installed within {}s",
            install.name, settings.verification_timeout_seconds
        ))
        .to_string();
        finish(conn, &install, InstallStatus::Failure, Some(&reason), now)?;
        return Ok(Some(InstallStatus::Failure));
    }

    jobs::enqueue(
        conn,
        VERIFY_INSTALL_JOB,
        &VerifyInstallArgs {
            install_uuid: install.install_uuid.clone(),
        },
        now + settings.verification_request_delay(),
        now,
    )?;
    Ok(Some(InstallStatus::Verifying))
}

/// Fail verifications whose acknowledgment is older than the timeout.
/// Limited to one host when `host_id` is given.
pub fn expire_stale(
    conn: &mut SqliteConnection,
    host_id: Option<i32>,
    settings: &ServerSettings,
    now: NaiveDateTime,
) -> FleetResult<usize> {
    let cutoff = now - settings.verification_timeout();
    let mut query = host_software_installs::table
        .filter(host_software_installs::status.eq(InstallStatus::Verifying.as_str()))
        .filter(host_software_installs::acknowledged_at.le(cutoff))
        .select(SoftwareInstall::as_select())
        .into_boxed();
    if let Some(id) = host_id {
        query = query.filter(host_software_installs::host_id.eq(id));
    }
    let stale: Vec<SoftwareInstall> = query.load(conn)?;

    let mut expired = 0;
    for install in stale {
        let reason = FleetError::Timeout(format!(
            "{} not reported installed within {}s",
            install.name, settings.verification_timeout_seconds
        ))
        .to_string();
        if finish(conn, &install, InstallStatus::Failure, Some(&reason), now)? {
            expired += 1;
        }
    }
    if expired > 0 {
        log::info!("Expired {} install verifications", expired);
    }
    Ok(expired)
}

/// Re-issues a verification poll once its delay has passed.
pub struct VerifyInstallHandler {
    pub transport: Arc<dyn CommandTransport>,
}

impl JobHandler for VerifyInstallHandler {
    fn name(&self) -> &'static str {
        VERIFY_INSTALL_JOB
    }

    fn run(&self, conn: &mut SqliteConnection, job: &Job, now: NaiveDateTime) -> FleetResult<()> {
        let args: VerifyInstallArgs = serde_json::from_str(&job.args)?;
        start_verification(conn, self.transport.as_ref(), &args.install_uuid, now)?;
        Ok(())
    }
}
