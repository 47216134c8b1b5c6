use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::SqliteConnection;

use crate::errors::FleetResult;
use crate::models::{CommandKind, CommandStatus, HostCommand, NewHostCommand, TransportKind};
use crate::schema::host_commands;

pub fn new_command_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Delivers operations to devices. Callers pick the command uuid so the
/// id can be persisted alongside the intent in the same transaction.
pub trait CommandTransport: Send + Sync {
    fn send_command(
        &self,
        conn: &mut SqliteConnection,
        host_id: i32,
        command_uuid: &str,
        kind: CommandKind,
        payload: &serde_json::Value,
        now: NaiveDateTime,
    ) -> FleetResult<()>;

    fn send_script(
        &self,
        conn: &mut SqliteConnection,
        host_id: i32,
        execution_id: &str,
        script_body: &str,
        now: NaiveDateTime,
    ) -> FleetResult<()> {
        self.send_command(
            conn,
            host_id,
            execution_id,
            CommandKind::RunScript,
            &serde_json::json!({ "script": script_body }),
            now,
        )
    }

    /// Withdraw a command the device has not fetched yet. Returns false once
    /// it has been delivered: a delivered command cannot be taken back.
    fn cancel(&self, conn: &mut SqliteConnection, command_uuid: &str, now: NaiveDateTime) -> FleetResult<bool>;
}

/// Persists commands in `host_commands`; devices pull them on check-in.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueuedTransport;

impl CommandTransport for QueuedTransport {
    fn send_command(
        &self,
        conn: &mut SqliteConnection,
        host_id: i32,
        command_uuid: &str,
        kind: CommandKind,
        payload: &serde_json::Value,
        now: NaiveDateTime,
    ) -> FleetResult<()> {
        let payload = payload.to_string();
        diesel::insert_into(host_commands::table)
            .values(&NewHostCommand {
                command_uuid,
                host_id,
                transport: kind.transport().as_str(),
                kind: kind.as_str(),
                payload: &payload,
                status: CommandStatus::Pending.as_str(),
                created_at: now,
                updated_at: now,
            })
            .execute(conn)?;

        log::info!(
            "Queued {} command {} ({}) for host {}",
            kind.transport(),
            command_uuid,
            kind,
            host_id
        );
        Ok(())
    }

    fn cancel(&self, conn: &mut SqliteConnection, command_uuid: &str, now: NaiveDateTime) -> FleetResult<bool> {
        let n = diesel::update(
            host_commands::table
                .filter(host_commands::command_uuid.eq(command_uuid))
                .filter(host_commands::status.eq(CommandStatus::Pending.as_str())),
        )
        .set((
            host_commands::status.eq(CommandStatus::Canceled.as_str()),
            host_commands::updated_at.eq(now),
        ))
        .execute(conn)?;

        if n == 1 {
            log::info!("Canceled undelivered command {}", command_uuid);
        }
        Ok(n == 1)
    }
}

/// Outcome of recording a device's report about a command.
#[derive(Debug, Clone)]
pub struct RecordedResult {
    pub command: HostCommand,
    /// False when the command already had a terminal report (duplicate
    /// delivery) or was canceled; such reports must not drive transitions.
    pub first_report: bool,
}

pub fn get_command(conn: &mut SqliteConnection, command_uuid: &str) -> FleetResult<Option<HostCommand>> {
    let cmd = host_commands::table
        .filter(host_commands::command_uuid.eq(command_uuid))
        .select(HostCommand::as_select())
        .first(conn)
        .optional()?;
    Ok(cmd)
}

/// True while the command is queued or delivered but not yet answered.
pub fn is_outstanding(conn: &mut SqliteConnection, command_uuid: &str) -> FleetResult<bool> {
    Ok(match get_command(conn, command_uuid)? {
        Some(cmd) => matches!(cmd.status()?, CommandStatus::Pending | CommandStatus::Delivered),
        None => false,
    })
}

/// Hand a device its pending commands for one transport and mark them delivered.
pub fn fetch_pending(
    conn: &mut SqliteConnection,
    host_id: i32,
    transport: TransportKind,
    now: NaiveDateTime,
) -> FleetResult<Vec<HostCommand>> {
    conn.transaction(|conn| {
        let pending: Vec<HostCommand> = host_commands::table
            .filter(host_commands::host_id.eq(host_id))
            .filter(host_commands::transport.eq(transport.as_str()))
            .filter(host_commands::status.eq(CommandStatus::Pending.as_str()))
            .order(host_commands::id.asc())
            .select(HostCommand::as_select())
            .load(conn)?;

        let ids: Vec<i32> = pending.iter().map(|c| c.id).collect();
        if !ids.is_empty() {
            diesel::update(host_commands::table.filter(host_commands::id.eq_any(&ids)))
                .set((
                    host_commands::status.eq(CommandStatus::Delivered.as_str()),
                    host_commands::updated_at.eq(now),
                ))
                .execute(conn)?;
        }
        Ok(pending)
    })
}

/// Store the device's answer to a command.
pub fn record_result(
    conn: &mut SqliteConnection,
    command_uuid: &str,
    status: CommandStatus,
    result: Option<&str>,
    exit_code: Option<i32>,
    now: NaiveDateTime,
) -> FleetResult<Option<RecordedResult>> {
    let n = diesel::update(
        host_commands::table
            .filter(host_commands::command_uuid.eq(command_uuid))
            .filter(host_commands::status.eq_any([
                CommandStatus::Pending.as_str(),
                CommandStatus::Delivered.as_str(),
            ])),
    )
    .set((
        host_commands::status.eq(status.as_str()),
        host_commands::result.eq(result),
        host_commands::exit_code.eq(exit_code),
        host_commands::updated_at.eq(now),
    ))
    .execute(conn)?;

    let Some(command) = get_command(conn, command_uuid)? else {
        log::warn!("Result for unknown command {}", command_uuid);
        return Ok(None);
    };

    if n == 0 {
        log::info!(
            "Ignoring repeated result for command {} (status {})",
            command_uuid,
            command.status
        );
    }
    Ok(Some(RecordedResult {
        command,
        first_report: n == 1,
    }))
}
