//! Lock / unlock / wipe intent tracking.
//!
//! One `host_device_actions` row per host holds the confirmed device status
//! and at most one pending action. Every write goes through [`swap_state`],
//! a conditional update against the state read at the start of the request,
//! so two concurrent requests cannot both install a pending action.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::SqliteConnection;
use rand::Rng;
use serde::{Serialize, Serializer};

use crate::audit_log::{self, SYSTEM_ACTOR};
use crate::errors::{FleetError, FleetResult, Unprocessable};
use crate::hosts;
use crate::models::{
    pending_action_to_text, CommandKind, DeviceAction, DeviceActionRow, DeviceStatus,
    EnrollmentMethod, Host, Platform,
};
use crate::schema::host_device_actions;
use crate::transport::{new_command_uuid, CommandTransport};

const LINUX_LOCK_SCRIPT: &str = r#"#!/bin/sh
for user in $(awk -F: '$3 >= 1000 && $1 != "nobody" {print $1}' /etc/passwd); do
    passwd -l "$user"
    loginctl terminate-user "$user" 2>/dev/null
done
"#;

const LINUX_UNLOCK_SCRIPT: &str = r#"#!/bin/sh
for user in $(awk -F: '$3 >= 1000 && $1 != "nobody" {print $1}' /etc/passwd); do
    passwd -u "$user"
done
"#;

const LINUX_WIPE_SCRIPT: &str = r#"#!/bin/sh
for disk in $(lsblk -dpno NAME,TYPE | awk '$2 == "disk" {print $1}'); do
    blkdiscard -f "$disk" 2>/dev/null || dd if=/dev/zero of="$disk" bs=1M count=64
done
reboot -f
"#;

const WINDOWS_LOCK_SCRIPT: &str = r#"Get-LocalUser | Where-Object { $_.Enabled -and $_.Name -ne 'Administrator' } | Disable-LocalUser
rundll32.exe user32.dll,LockWorkStation
"#;

const WINDOWS_UNLOCK_SCRIPT: &str = r#"Get-LocalUser | Where-Object { -not $_.Enabled -and $_.Name -ne 'Administrator' -and $_.Name -ne 'Guest' } | Enable-LocalUser
"#;

/// How an action reaches a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    /// Native MDM command over the push channel.
    Command(CommandKind),
    /// Script run by the agent over the pull channel.
    Script(&'static str),
    /// Completed by the user on the device (PIN entry), confirmed by its next Idle check-in.
    Manual,
}

struct PrimitiveEntry {
    platform: Platform,
    /// `None` matches any enrollment method.
    enrollment: Option<EnrollmentMethod>,
    action: DeviceAction,
    primitive: Primitive,
}

const fn entry(
    platform: Platform,
    enrollment: Option<EnrollmentMethod>,
    action: DeviceAction,
    primitive: Primitive,
) -> PrimitiveEntry {
    PrimitiveEntry {
        platform,
        enrollment,
        action,
        primitive,
    }
}

// Lost mode requires supervision, so manually enrolled iPhones/iPads have no lock primitive.
const PRIMITIVES: &[PrimitiveEntry] = &[
    entry(Platform::Macos, None, DeviceAction::Lock, Primitive::Command(CommandKind::DeviceLock)),
    entry(Platform::Macos, None, DeviceAction::Unlock, Primitive::Manual),
    entry(Platform::Macos, None, DeviceAction::Wipe, Primitive::Command(CommandKind::EraseDevice)),
    entry(Platform::Ios, Some(EnrollmentMethod::Automatic), DeviceAction::Lock, Primitive::Command(CommandKind::EnableLostMode)),
    entry(Platform::Ios, Some(EnrollmentMethod::Automatic), DeviceAction::Unlock, Primitive::Command(CommandKind::DisableLostMode)),
    entry(Platform::Ios, None, DeviceAction::Wipe, Primitive::Command(CommandKind::EraseDevice)),
    entry(Platform::Ipados, Some(EnrollmentMethod::Automatic), DeviceAction::Lock, Primitive::Command(CommandKind::EnableLostMode)),
    entry(Platform::Ipados, Some(EnrollmentMethod::Automatic), DeviceAction::Unlock, Primitive::Command(CommandKind::DisableLostMode)),
    entry(Platform::Ipados, None, DeviceAction::Wipe, Primitive::Command(CommandKind::EraseDevice)),
    entry(Platform::Windows, None, DeviceAction::Lock, Primitive::Script(WINDOWS_LOCK_SCRIPT)),
    entry(Platform::Windows, None, DeviceAction::Unlock, Primitive::Script(WINDOWS_UNLOCK_SCRIPT)),
    entry(Platform::Windows, None, DeviceAction::Wipe, Primitive::Command(CommandKind::RemoteWipe)),
    entry(Platform::Linux, None, DeviceAction::Lock, Primitive::Script(LINUX_LOCK_SCRIPT)),
    entry(Platform::Linux, None, DeviceAction::Unlock, Primitive::Script(LINUX_UNLOCK_SCRIPT)),
    entry(Platform::Linux, None, DeviceAction::Wipe, Primitive::Script(LINUX_WIPE_SCRIPT)),
];

pub fn primitive_for(
    platform: Platform,
    enrollment: EnrollmentMethod,
    action: DeviceAction,
) -> Option<Primitive> {
    PRIMITIVES
        .iter()
        .find(|e| {
            e.platform == platform
                && e.action == action
                && e.enrollment.is_none_or(|m| m == enrollment)
        })
        .map(|e| e.primitive)
}

/// Only macOS locks with a PIN, which the server generates and discloses up front.
pub fn uses_unlock_pin(platform: Platform) -> bool {
    platform == Platform::Macos
}

fn generate_pin() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

fn serialize_pending<S: Serializer>(pending: &Option<DeviceAction>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(pending_action_to_text(*pending))
}

/// Response body for lock/unlock/wipe and status queries.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeviceActionStatus {
    pub host_id: i32,
    #[serde(serialize_with = "serialize_pending")]
    pub pending_action: Option<DeviceAction>,
    pub device_status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock_pin: Option<String>,
}

impl DeviceActionStatus {
    fn from_row(row: &DeviceActionRow, unlock_pin: Option<String>) -> FleetResult<Self> {
        Ok(Self {
            host_id: row.host_id,
            pending_action: row.pending_action()?,
            device_status: row.device_status()?,
            unlock_pin,
        })
    }
}

/// Read the host's state row, creating the baseline on first use.
pub fn load_state(conn: &mut SqliteConnection, host_id: i32, now: NaiveDateTime) -> FleetResult<DeviceActionRow> {
    diesel::insert_or_ignore_into(host_device_actions::table)
        .values(&DeviceActionRow::baseline(host_id, now))
        .execute(conn)?;

    let row = host_device_actions::table
        .find(host_id)
        .select(DeviceActionRow::as_select())
        .first(conn)?;
    Ok(row)
}

/// Compare-and-swap: apply `next` only if the row still holds `prev`'s status and pending action.
fn swap_state(conn: &mut SqliteConnection, prev: &DeviceActionRow, next: &DeviceActionRow) -> FleetResult<()> {
    let n = diesel::update(
        host_device_actions::table
            .filter(host_device_actions::host_id.eq(prev.host_id))
            .filter(host_device_actions::device_status.eq(&prev.device_status))
            .filter(host_device_actions::pending_action.eq(&prev.pending_action)),
    )
    .set((
        host_device_actions::device_status.eq(&next.device_status),
        host_device_actions::pending_action.eq(&next.pending_action),
        host_device_actions::unlock_pin.eq(next.unlock_pin.as_deref()),
        host_device_actions::pending_ref.eq(next.pending_ref.as_deref()),
        host_device_actions::updated_at.eq(next.updated_at),
    ))
    .execute(conn)?;

    if n == 1 {
        Ok(())
    } else {
        log::warn!("Lost device action update race on host {}", prev.host_id);
        Err(Unprocessable::ConcurrentUpdate.into())
    }
}

fn with_pending(
    state: &DeviceActionRow,
    action: DeviceAction,
    reference: &str,
    unlock_pin: Option<String>,
    now: NaiveDateTime,
) -> DeviceActionRow {
    DeviceActionRow {
        pending_action: action.as_str().to_string(),
        pending_ref: Some(reference.to_string()),
        unlock_pin,
        updated_at: now,
        ..state.clone()
    }
}

fn enrolled_host(conn: &mut SqliteConnection, host_id: i32) -> FleetResult<(Host, Platform, EnrollmentMethod)> {
    let host = hosts::get(conn, host_id)?;
    if !host.mdm_enrolled {
        return Err(Unprocessable::NotEnrolled.into());
    }
    let platform = host.platform()?;
    let method = host.enrollment_method()?;
    Ok((host, platform, method))
}

fn resolve_primitive(platform: Platform, method: EnrollmentMethod, action: DeviceAction) -> FleetResult<Primitive> {
    primitive_for(platform, method, action).ok_or_else(|| {
        Unprocessable::UnsupportedPlatform {
            action,
            platform,
            enrollment_method: method,
        }
        .into()
    })
}

fn reference_for(primitive: Primitive, now: NaiveDateTime) -> String {
    match primitive {
        Primitive::Manual => format!("manual:{}", now.format("%Y-%m-%d %H:%M:%S")),
        _ => new_command_uuid(),
    }
}

fn dispatch(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    host: &Host,
    primitive: Primitive,
    reference: &str,
    pin: Option<&str>,
    now: NaiveDateTime,
) -> FleetResult<()> {
    match primitive {
        Primitive::Command(kind) => {
            let payload = match kind {
                CommandKind::DeviceLock => serde_json::json!({ "pin": pin }),
                CommandKind::EnableLostMode => serde_json::json!({
                    "message": "This device is locked. Contact your IT administrator."
                }),
                CommandKind::EraseDevice if host.platform == Platform::Macos.as_str() => {
                    serde_json::json!({ "pin": generate_pin() })
                }
                _ => serde_json::json!({}),
            };
            transport.send_command(conn, host.id, reference, kind, &payload, now)
        }
        Primitive::Script(body) => transport.send_script(conn, host.id, reference, body, now),
        Primitive::Manual => Ok(()),
    }
}

pub fn request_lock(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    host_id: i32,
    view_pin: bool,
    actor: &str,
    now: NaiveDateTime,
) -> FleetResult<DeviceActionStatus> {
    conn.transaction(|conn| {
        let (host, platform, method) = enrolled_host(conn, host_id)?;
        let state = load_state(conn, host.id, now)?;

        if state.device_status()? == DeviceStatus::Wiped {
            return Err(FleetError::invalid_state("host has been wiped"));
        }
        if let Some(pending) = state.pending_action()? {
            return Err(Unprocessable::ActionPending(pending).into());
        }
        if state.device_status()? == DeviceStatus::Locked {
            return Err(FleetError::Conflict("host is already locked".into()));
        }

        let primitive = resolve_primitive(platform, method, DeviceAction::Lock)?;
        let pin = uses_unlock_pin(platform).then(generate_pin);
        let reference = reference_for(primitive, now);

        let next = with_pending(&state, DeviceAction::Lock, &reference, pin.clone(), now);
        swap_state(conn, &state, &next)?;
        dispatch(conn, transport, &host, primitive, &reference, pin.as_deref(), now)?;

        audit_log::log_activity(
            conn,
            actor,
            "lock_host",
            Some(host.id),
            Some(&reference),
            Some(&serde_json::json!({ "platform": platform, "view_pin": view_pin })),
            now,
        )?;
        log::info!("Lock requested for host {} ({}) by {}", host.id, platform, actor);

        DeviceActionStatus::from_row(&next, if view_pin { pin } else { None })
    })
}

pub fn request_unlock(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    host_id: i32,
    actor: &str,
    now: NaiveDateTime,
) -> FleetResult<DeviceActionStatus> {
    conn.transaction(|conn| {
        let (host, platform, method) = enrolled_host(conn, host_id)?;
        let state = load_state(conn, host.id, now)?;

        if state.device_status()? == DeviceStatus::Wiped {
            return Err(FleetError::invalid_state("host has been wiped"));
        }
        match state.pending_action()? {
            Some(DeviceAction::Unlock) => {
                // viewing the PIN again is a fresh disclosure and gets its own activity
                audit_log::log_activity(
                    conn,
                    actor,
                    "unlock_host",
                    Some(host.id),
                    state.pending_ref.as_deref(),
                    Some(&serde_json::json!({ "platform": platform, "reissued": true })),
                    now,
                )?;
                return DeviceActionStatus::from_row(&state, state.unlock_pin.clone());
            }
            Some(pending) => return Err(Unprocessable::ActionPending(pending).into()),
            None => {}
        }
        if state.device_status()? == DeviceStatus::Unlocked {
            return Err(FleetError::Conflict("host is already unlocked".into()));
        }

        let primitive = resolve_primitive(platform, method, DeviceAction::Unlock)?;
        let reference = reference_for(primitive, now);

        let next = with_pending(&state, DeviceAction::Unlock, &reference, state.unlock_pin.clone(), now);
        swap_state(conn, &state, &next)?;
        dispatch(conn, transport, &host, primitive, &reference, None, now)?;

        audit_log::log_activity(
            conn,
            actor,
            "unlock_host",
            Some(host.id),
            Some(&reference),
            Some(&serde_json::json!({ "platform": platform, "reissued": false })),
            now,
        )?;
        log::info!("Unlock requested for host {} ({}) by {}", host.id, platform, actor);

        DeviceActionStatus::from_row(&next, next.unlock_pin.clone())
    })
}

pub fn request_wipe(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    host_id: i32,
    actor: &str,
    now: NaiveDateTime,
) -> FleetResult<DeviceActionStatus> {
    conn.transaction(|conn| {
        let (host, platform, method) = enrolled_host(conn, host_id)?;
        let state = load_state(conn, host.id, now)?;

        if state.device_status()? == DeviceStatus::Wiped {
            return Err(FleetError::Conflict("host is already wiped".into()));
        }
        if let Some(pending) = state.pending_action()? {
            return Err(Unprocessable::ActionPending(pending).into());
        }
        // a wipe on a locked device would strand the unlock PIN
        if state.device_status()? == DeviceStatus::Locked {
            return Err(FleetError::invalid_state("host is locked, unlock it before wiping"));
        }

        let primitive = resolve_primitive(platform, method, DeviceAction::Wipe)?;
        let reference = reference_for(primitive, now);

        let next = with_pending(&state, DeviceAction::Wipe, &reference, state.unlock_pin.clone(), now);
        swap_state(conn, &state, &next)?;
        dispatch(conn, transport, &host, primitive, &reference, None, now)?;

        audit_log::log_activity(
            conn,
            actor,
            "wipe_host",
            Some(host.id),
            Some(&reference),
            Some(&serde_json::json!({ "platform": platform })),
            now,
        )?;
        log::info!("Wipe requested for host {} ({}) by {}", host.id, platform, actor);

        DeviceActionStatus::from_row(&next, None)
    })
}

/// The pending action tracked by `reference`, if it is still awaited.
pub fn action_for_reference(
    conn: &mut SqliteConnection,
    host_id: i32,
    reference: &str,
) -> FleetResult<Option<DeviceAction>> {
    let row = host_device_actions::table
        .find(host_id)
        .select(DeviceActionRow::as_select())
        .first(conn)
        .optional()?;

    match row {
        Some(row) if row.pending_ref.as_deref() == Some(reference) => row.pending_action(),
        _ => Ok(None),
    }
}

/// Transition function for transport callbacks. Returns false when the
/// result does not match the awaited action (stale or duplicate report).
pub fn on_transport_result(
    conn: &mut SqliteConnection,
    host_id: i32,
    action: DeviceAction,
    reference: &str,
    success: bool,
    detail: Option<&str>,
    now: NaiveDateTime,
) -> FleetResult<bool> {
    conn.transaction(|conn| {
        let state = load_state(conn, host_id, now)?;
        if state.pending_action()? != Some(action) || state.pending_ref.as_deref() != Some(reference) {
            log::info!(
                "Ignoring {} result {} for host {}: not the awaited action",
                action,
                reference,
                host_id
            );
            return Ok(false);
        }

        let next = if success {
            DeviceActionRow {
                device_status: action.terminal_status().as_str().to_string(),
                pending_action: pending_action_to_text(None).to_string(),
                pending_ref: None,
                // the PIN stays around for the eventual unlock
                unlock_pin: match action {
                    DeviceAction::Lock => state.unlock_pin.clone(),
                    DeviceAction::Unlock | DeviceAction::Wipe => None,
                },
                updated_at: now,
                ..state.clone()
            }
        } else {
            DeviceActionRow {
                pending_action: pending_action_to_text(None).to_string(),
                pending_ref: None,
                unlock_pin: match action {
                    DeviceAction::Lock => None,
                    DeviceAction::Unlock | DeviceAction::Wipe => state.unlock_pin.clone(),
                },
                updated_at: now,
                ..state.clone()
            }
        };
        swap_state(conn, &state, &next)?;

        let activity = match (action, success) {
            (DeviceAction::Lock, true) => "host_locked",
            (DeviceAction::Unlock, true) => "host_unlocked",
            (DeviceAction::Wipe, true) => "host_wiped",
            (DeviceAction::Lock, false) => "lock_host_failed",
            (DeviceAction::Unlock, false) => "unlock_host_failed",
            (DeviceAction::Wipe, false) => "wipe_host_failed",
        };
        audit_log::log_activity(
            conn,
            SYSTEM_ACTOR,
            activity,
            Some(host_id),
            Some(reference),
            detail.map(|d| serde_json::json!({ "detail": d })).as_ref(),
            now,
        )?;
        log::info!("Host {} {} ({})", host_id, activity, reference);
        Ok(true)
    })
}

/// Idle check-in from the device. A Mac that is locked cannot reach the
/// MDM server until its PIN is entered, so an Idle exchange from a Mac
/// believed locked or wiped means it is usable again. This only ever moves
/// the status back to `unlocked`; other platforms keep checking in while
/// locked (lost mode) and are left alone.
pub fn on_idle_checkin(conn: &mut SqliteConnection, host_id: i32, now: NaiveDateTime) -> FleetResult<Option<DeviceStatus>> {
    let host = hosts::get(conn, host_id)?;
    if host.platform()? != Platform::Macos {
        return Ok(None);
    }

    conn.transaction(|conn| {
        let state = load_state(conn, host_id, now)?;
        let status = state.device_status()?;
        let pending = state.pending_action()?;

        let passive = match (status, pending) {
            (DeviceStatus::Locked, None) | (DeviceStatus::Wiped, None) => true,
            (DeviceStatus::Locked, Some(DeviceAction::Unlock)) => false,
            _ => return Ok(None),
        };

        let next = DeviceActionRow {
            device_status: DeviceStatus::Unlocked.as_str().to_string(),
            pending_action: pending_action_to_text(None).to_string(),
            pending_ref: None,
            unlock_pin: None,
            updated_at: now,
            ..state.clone()
        };
        swap_state(conn, &state, &next)?;

        audit_log::log_activity(
            conn,
            SYSTEM_ACTOR,
            "host_unlocked",
            Some(host_id),
            state.pending_ref.as_deref(),
            Some(&serde_json::json!({ "previous_status": status, "out_of_band": passive })),
            now,
        )?;
        log::info!("Host {} checked in while {}, now unlocked", host_id, status);
        Ok(Some(DeviceStatus::Unlocked))
    })
}

/// A (re-)enrolled device starts from the baseline, whatever came before.
/// A command still queued for the dropped pending action is withdrawn.
pub fn reset_on_enrollment(
    conn: &mut SqliteConnection,
    transport: &dyn CommandTransport,
    host_id: i32,
    now: NaiveDateTime,
) -> FleetResult<()> {
    let previous = host_device_actions::table
        .find(host_id)
        .select(host_device_actions::pending_ref)
        .first::<Option<String>>(conn)
        .optional()?
        .flatten();
    if let Some(reference) = previous {
        transport.cancel(conn, &reference, now)?;
    }

    diesel::replace_into(host_device_actions::table)
        .values(&DeviceActionRow::baseline(host_id, now))
        .execute(conn)?;
    Ok(())
}

pub fn get_status(conn: &mut SqliteConnection, host_id: i32, now: NaiveDateTime) -> FleetResult<DeviceActionStatus> {
    hosts::get(conn, host_id)?;
    let state = load_state(conn, host_id, now)?;
    DeviceActionStatus::from_row(&state, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransportKind;
    use crate::test_support;
    use crate::transport::{fetch_pending, QueuedTransport};

    fn kind_of(err: FleetError) -> &'static str {
        err.kind()
    }

    fn ack_pending(conn: &mut SqliteConnection, host_id: i32, now: NaiveDateTime) -> bool {
        let state = load_state(conn, host_id, now).unwrap();
        let action = state.pending_action().unwrap().unwrap();
        let reference = state.pending_ref.unwrap();
        on_transport_result(conn, host_id, action, &reference, true, None, now).unwrap()
    }

    #[test]
    fn macos_lock_discloses_pin_and_confirms_on_ack() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "MAC1", Platform::Macos, EnrollmentMethod::Automatic, None);

        let res = request_lock(&mut conn, &QueuedTransport, host.id, true, "alice", now).unwrap();
        let pin = res.unlock_pin.clone().unwrap();
        assert_eq!(pin.len(), 6);
        assert!(pin.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(res.pending_action, Some(DeviceAction::Lock));
        assert_eq!(res.device_status, DeviceStatus::Unlocked);

        let status = get_status(&mut conn, host.id, now).unwrap();
        assert_eq!(status.pending_action, Some(DeviceAction::Lock));
        assert_eq!(status.device_status, DeviceStatus::Unlocked);

        let cmds = fetch_pending(&mut conn, host.id, TransportKind::Push, now).unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].kind, "DeviceLock");
        assert!(cmds[0].payload.contains(&pin));

        assert!(ack_pending(&mut conn, host.id, now));
        let status = get_status(&mut conn, host.id, now).unwrap();
        assert_eq!(status.pending_action, None);
        assert_eq!(status.device_status, DeviceStatus::Locked);
    }

    #[test]
    fn lock_without_view_pin_hides_it() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "MAC1", Platform::Macos, EnrollmentMethod::Manual, None);

        let res = request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap();
        assert_eq!(res.unlock_pin, None);
        assert!(load_state(&mut conn, host.id, now).unwrap().unlock_pin.is_some());
    }

    #[test]
    fn manually_enrolled_ios_cannot_be_locked() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "IPH1", Platform::Ios, EnrollmentMethod::Manual, None);

        let err = request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap_err();
        assert_eq!(kind_of(err), "unsupported_platform");
        let state = load_state(&mut conn, host.id, now).unwrap();
        assert_eq!(state.pending_action, "none");
    }

    #[test]
    fn ios_lock_uses_lost_mode_without_pin() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "IPAD1", Platform::Ipados, EnrollmentMethod::Automatic, None);

        let res = request_lock(&mut conn, &QueuedTransport, host.id, true, "alice", now).unwrap();
        assert_eq!(res.unlock_pin, None);
        let cmds = fetch_pending(&mut conn, host.id, TransportKind::Push, now).unwrap();
        assert_eq!(cmds[0].kind, "EnableLostMode");

        ack_pending(&mut conn, host.id, now);
        request_unlock(&mut conn, &QueuedTransport, host.id, "alice", now).unwrap();
        let cmds = fetch_pending(&mut conn, host.id, TransportKind::Push, now).unwrap();
        assert_eq!(cmds[0].kind, "DisableLostMode");
    }

    #[test]
    fn second_action_while_pending_is_rejected() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "LNX1", Platform::Linux, EnrollmentMethod::Manual, None);

        request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap();
        let err = request_wipe(&mut conn, &QueuedTransport, host.id, "alice", now).unwrap_err();
        assert!(matches!(
            err,
            FleetError::UnprocessableState(Unprocessable::ActionPending(DeviceAction::Lock))
        ));
        let err = request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap_err();
        assert_eq!(kind_of(err), "action_pending");

        let pulls = fetch_pending(&mut conn, host.id, TransportKind::Pull, now).unwrap();
        assert_eq!(pulls.len(), 1, "only the first request dispatched work");
        assert_eq!(pulls[0].kind, "RunScript");
    }

    #[test]
    fn locking_a_locked_host_is_a_conflict() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "WIN1", Platform::Windows, EnrollmentMethod::Manual, None);

        request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap();
        ack_pending(&mut conn, host.id, now);

        let err = request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap_err();
        assert_eq!(kind_of(err), "conflict");
        let other = test_support::insert_host(&mut conn, "WIN2", Platform::Windows, EnrollmentMethod::Manual, None);
        let err = request_unlock(&mut conn, &QueuedTransport, other.id, "alice", now).unwrap_err();
        assert_eq!(kind_of(err), "conflict");
    }

    #[test]
    fn repeated_unlock_reissues_pin_and_audits_each_time() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "MAC1", Platform::Macos, EnrollmentMethod::Automatic, None);

        let locked = request_lock(&mut conn, &QueuedTransport, host.id, true, "alice", now).unwrap();
        ack_pending(&mut conn, host.id, now);

        let first = request_unlock(&mut conn, &QueuedTransport, host.id, "alice", now).unwrap();
        let second = request_unlock(&mut conn, &QueuedTransport, host.id, "bob", now).unwrap();
        assert_eq!(first.unlock_pin, locked.unlock_pin);
        assert_eq!(first.unlock_pin, second.unlock_pin);
        assert_eq!(second.pending_action, Some(DeviceAction::Unlock));
        assert_eq!(audit_log::count_for_host(&mut conn, host.id, "unlock_host").unwrap(), 2);

        // macOS unlock is manual: nothing was queued for the device
        let cmds = fetch_pending(&mut conn, host.id, TransportKind::Push, now).unwrap();
        assert!(cmds.iter().all(|c| c.kind == "DeviceLock"));
    }

    #[test]
    fn idle_checkin_completes_manual_macos_unlock() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "MAC1", Platform::Macos, EnrollmentMethod::Automatic, None);

        request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap();
        // idle before the lock is acknowledged never upgrades or clears anything
        assert_eq!(on_idle_checkin(&mut conn, host.id, now).unwrap(), None);
        ack_pending(&mut conn, host.id, now);
        request_unlock(&mut conn, &QueuedTransport, host.id, "alice", now).unwrap();

        assert_eq!(on_idle_checkin(&mut conn, host.id, now).unwrap(), Some(DeviceStatus::Unlocked));
        let status = get_status(&mut conn, host.id, now).unwrap();
        assert_eq!(status.device_status, DeviceStatus::Unlocked);
        assert_eq!(status.pending_action, None);
    }

    #[test]
    fn idle_checkin_from_a_wiped_mac_downgrades_it() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "MAC2", Platform::Macos, EnrollmentMethod::Automatic, None);

        request_wipe(&mut conn, &QueuedTransport, host.id, "alice", now).unwrap();
        // still pending: an Idle exchange proves nothing yet
        assert_eq!(on_idle_checkin(&mut conn, host.id, now).unwrap(), None);
        ack_pending(&mut conn, host.id, now);
        assert_eq!(get_status(&mut conn, host.id, now).unwrap().device_status, DeviceStatus::Wiped);

        assert_eq!(on_idle_checkin(&mut conn, host.id, now).unwrap(), Some(DeviceStatus::Unlocked));
        let status = get_status(&mut conn, host.id, now).unwrap();
        assert_eq!(status.device_status, DeviceStatus::Unlocked);
        assert_eq!(status.pending_action, None);
        assert_eq!(audit_log::count_for_host(&mut conn, host.id, "host_unlocked").unwrap(), 1);
        assert!(request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).is_ok());
    }

    #[test]
    fn idle_checkin_does_not_downgrade_ios_lost_mode() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "IPH1", Platform::Ios, EnrollmentMethod::Automatic, None);

        request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap();
        ack_pending(&mut conn, host.id, now);
        assert_eq!(on_idle_checkin(&mut conn, host.id, now).unwrap(), None);
        assert_eq!(get_status(&mut conn, host.id, now).unwrap().device_status, DeviceStatus::Locked);
    }

    #[test]
    fn wiped_host_rejects_everything_until_reenrolled() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "WIN1", Platform::Windows, EnrollmentMethod::Automatic, None);

        request_wipe(&mut conn, &QueuedTransport, host.id, "alice", now).unwrap();
        let cmds = fetch_pending(&mut conn, host.id, TransportKind::Push, now).unwrap();
        assert_eq!(cmds[0].kind, "RemoteWipe");
        ack_pending(&mut conn, host.id, now);

        let err = request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap_err();
        assert_eq!(kind_of(err), "invalid_state");
        let err = request_unlock(&mut conn, &QueuedTransport, host.id, "alice", now).unwrap_err();
        assert_eq!(kind_of(err), "invalid_state");
        let err = request_wipe(&mut conn, &QueuedTransport, host.id, "alice", now).unwrap_err();
        assert_eq!(kind_of(err), "conflict");

        reset_on_enrollment(&mut conn, &QueuedTransport, host.id, now).unwrap();
        let status = get_status(&mut conn, host.id, now).unwrap();
        assert_eq!(status.device_status, DeviceStatus::Unlocked);
        assert_eq!(status.pending_action, None);
    }

    #[test]
    fn wiping_a_locked_host_requires_unlock_first() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "LNX1", Platform::Linux, EnrollmentMethod::Manual, None);

        request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap();
        ack_pending(&mut conn, host.id, now);
        let err = request_wipe(&mut conn, &QueuedTransport, host.id, "alice", now).unwrap_err();
        assert_eq!(kind_of(err), "invalid_state");
    }

    #[test]
    fn failed_action_leaves_previous_status() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "LNX1", Platform::Linux, EnrollmentMethod::Manual, None);

        request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap();
        let state = load_state(&mut conn, host.id, now).unwrap();
        let reference = state.pending_ref.unwrap();

        assert!(on_transport_result(&mut conn, host.id, DeviceAction::Lock, &reference, false, Some("exit 1"), now).unwrap());
        let status = get_status(&mut conn, host.id, now).unwrap();
        assert_eq!(status.device_status, DeviceStatus::Unlocked);
        assert_eq!(status.pending_action, None);
        assert_eq!(audit_log::count_for_host(&mut conn, host.id, "lock_host_failed").unwrap(), 1);

        // a late duplicate of the same report is ignored
        assert!(!on_transport_result(&mut conn, host.id, DeviceAction::Lock, &reference, true, None, now).unwrap());
        assert_eq!(get_status(&mut conn, host.id, now).unwrap().device_status, DeviceStatus::Unlocked);
    }

    #[test]
    fn stale_snapshot_loses_the_swap() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "LNX1", Platform::Linux, EnrollmentMethod::Manual, None);

        let snapshot = load_state(&mut conn, host.id, now).unwrap();
        request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap();

        let competing = with_pending(&snapshot, DeviceAction::Wipe, "other", None, now);
        let err = swap_state(&mut conn, &snapshot, &competing).unwrap_err();
        assert_eq!(kind_of(err), "concurrent_update");
    }

    #[test]
    fn unenrolled_hosts_are_rejected() {
        let mut conn = test_support::conn();
        let now = test_support::now();
        let host = test_support::insert_host(&mut conn, "MAC1", Platform::Macos, EnrollmentMethod::Manual, None);
        diesel::update(crate::schema::hosts::table.find(host.id))
            .set(crate::schema::hosts::mdm_enrolled.eq(false))
            .execute(&mut conn)
            .unwrap();

        let err = request_lock(&mut conn, &QueuedTransport, host.id, false, "alice", now).unwrap_err();
        assert_eq!(kind_of(err), "not_enrolled");
        let err = request_lock(&mut conn, &QueuedTransport, 999, false, "alice", now).unwrap_err();
        assert_eq!(kind_of(err), "not_found");
    }

    #[test]
    fn every_platform_has_a_wipe_primitive() {
        for platform in [Platform::Macos, Platform::Ios, Platform::Ipados, Platform::Windows, Platform::Linux] {
            for method in [EnrollmentMethod::Manual, EnrollmentMethod::Automatic] {
                assert!(primitive_for(platform, method, DeviceAction::Wipe).is_some());
            }
        }
        assert_eq!(primitive_for(Platform::Macos, EnrollmentMethod::Manual, DeviceAction::Unlock), Some(Primitive::Manual));
    }
}
