use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{FleetError, FleetResult};
use crate::schema::{
    host_commands, host_dep_assignments, host_device_actions, host_software_installs, hosts,
    jobs, setup_experience_results, team_setup_items, teams,
};

/// Declares a closed set of values persisted as lowercase text columns.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = FleetError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(FleetError::Internal(format!(
                        "unknown {} value {:?}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum!(Platform {
    Macos => "macos",
    Ios => "ios",
    Ipados => "ipados",
    Windows => "windows",
    Linux => "linux",
});

impl Platform {
    pub fn is_apple(&self) -> bool {
        matches!(self, Platform::Macos | Platform::Ios | Platform::Ipados)
    }
}

text_enum!(EnrollmentMethod {
    Manual => "manual",
    Automatic => "automatic",
});

text_enum!(DeviceStatus {
    Unlocked => "unlocked",
    Locked => "locked",
    Wiped => "wiped",
});

text_enum!(DeviceAction {
    Lock => "lock",
    Unlock => "unlock",
    Wipe => "wipe",
});

impl DeviceAction {
    /// Status a host reaches once this action is confirmed.
    pub fn terminal_status(&self) -> DeviceStatus {
        match self {
            DeviceAction::Lock => DeviceStatus::Locked,
            DeviceAction::Unlock => DeviceStatus::Unlocked,
            DeviceAction::Wipe => DeviceStatus::Wiped,
        }
    }
}

pub const NO_PENDING_ACTION: &str = "none";

pub fn pending_action_to_text(action: Option<DeviceAction>) -> &'static str {
    action.map(|a| a.as_str()).unwrap_or(NO_PENDING_ACTION)
}

pub fn pending_action_from_text(text: &str) -> FleetResult<Option<DeviceAction>> {
    if text == NO_PENDING_ACTION {
        Ok(None)
    } else {
        text.parse().map(Some)
    }
}

text_enum!(TransportKind {
    Push => "push",
    Pull => "pull",
});

text_enum!(CommandStatus {
    Pending => "pending",
    Delivered => "delivered",
    Acknowledged => "acknowledged",
    Error => "error",
    Canceled => "canceled",
});

text_enum!(CommandKind {
    DeviceLock => "DeviceLock",
    EnableLostMode => "EnableLostMode",
    DisableLostMode => "DisableLostMode",
    EraseDevice => "EraseDevice",
    RemoteWipe => "RemoteWipe",
    InstallProfile => "InstallProfile",
    AccountConfiguration => "AccountConfiguration",
    InstallEnterpriseApplication => "InstallEnterpriseApplication",
    InstallApplication => "InstallApplication",
    InstalledApplicationList => "InstalledApplicationList",
    DeviceConfigured => "DeviceConfigured",
    SoftwareInstall => "SoftwareInstall",
    RunScript => "RunScript",
});

impl CommandKind {
    /// Agent-executed work is pulled; everything else rides the MDM push channel.
    pub fn transport(&self) -> TransportKind {
        match self {
            CommandKind::SoftwareInstall | CommandKind::RunScript => TransportKind::Pull,
            _ => TransportKind::Push,
        }
    }
}

text_enum!(SetupStep {
    Profile => "profile",
    AccountConfiguration => "account_configuration",
    BootstrapPackage => "bootstrap_package",
    Software => "software",
    Script => "script",
});

text_enum!(StepStatus {
    Pending => "pending",
    Running => "running",
    Success => "success",
    Failure => "failure",
});

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Failure)
    }
}

text_enum!(InstallStatus {
    Pending => "pending",
    Verifying => "verifying",
    Success => "success",
    Failure => "failure",
});

text_enum!(SoftwareSource {
    Vpp => "vpp",
    Package => "package",
});

text_enum!(AssignProfileResponse {
    Success => "success",
    Failed => "failed",
    NotAccessible => "not_accessible",
});

text_enum!(JobState {
    Queued => "queued",
    Running => "running",
    Failure => "failure",
});

#[derive(Queryable, Selectable, Identifiable, Serialize, Deserialize, Debug, Clone)]
#[diesel(table_name = teams)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Team {
    pub id: i32,
    pub name: String,
    pub dep_profile_uuid: Option<String>,
}

#[derive(Insertable, Deserialize, Debug)]
#[diesel(table_name = teams)]
pub struct NewTeam {
    pub name: String,
    pub dep_profile_uuid: Option<String>,
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Deserialize, Debug, Clone)]
#[diesel(table_name = team_setup_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SetupItem {
    pub id: i32,
    pub team_id: i32,
    pub kind: String,
    pub name: String,
    pub payload: Option<String>,
    pub source: Option<String>,
    pub bundle_identifier: Option<String>,
    pub version: Option<String>,
    pub licenses_available: Option<i32>,
}

impl SetupItem {
    pub fn kind(&self) -> FleetResult<SetupStep> {
        self.kind.parse()
    }

    pub fn source(&self) -> FleetResult<SoftwareSource> {
        self.source.as_deref().unwrap_or("package").parse()
    }
}

#[derive(Insertable, Deserialize, Debug, Clone)]
#[diesel(table_name = team_setup_items)]
pub struct NewSetupItem {
    #[serde(default)]
    pub team_id: i32,
    pub kind: String,
    pub name: String,
    pub payload: Option<String>,
    pub source: Option<String>,
    pub bundle_identifier: Option<String>,
    pub version: Option<String>,
    pub licenses_available: Option<i32>,
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Deserialize, Debug, Clone)]
#[diesel(table_name = hosts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Host {
    pub id: i32,
    pub uuid: String,
    pub serial_number: String,
    pub hostname: String,
    pub platform: String,
    pub enrollment_method: String,
    pub team_id: Option<i32>,
    pub mdm_enrolled: bool,
    pub last_checkin: Option<NaiveDateTime>,
    pub setup_released_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl Host {
    pub fn platform(&self) -> FleetResult<Platform> {
        self.platform.parse()
    }

    pub fn enrollment_method(&self) -> FleetResult<EnrollmentMethod> {
        self.enrollment_method.parse()
    }

    /// Key into `team_setup_items`, where 0 stands for "no team".
    pub fn team_key(&self) -> i32 {
        self.team_id.unwrap_or(0)
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = hosts)]
pub struct NewHost<'a> {
    pub uuid: &'a str,
    pub serial_number: &'a str,
    pub hostname: &'a str,
    pub platform: &'a str,
    pub enrollment_method: &'a str,
    pub team_id: Option<i32>,
    pub mdm_enrolled: bool,
    pub last_checkin: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Queryable, Selectable, Insertable, Serialize, Debug, Clone)]
#[diesel(table_name = host_device_actions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DeviceActionRow {
    pub host_id: i32,
    pub device_status: String,
    pub pending_action: String,
    pub unlock_pin: Option<String>,
    pub pending_ref: Option<String>,
    pub updated_at: NaiveDateTime,
}

impl DeviceActionRow {
    pub fn baseline(host_id: i32, now: NaiveDateTime) -> Self {
        Self {
            host_id,
            device_status: DeviceStatus::Unlocked.as_str().to_string(),
            pending_action: NO_PENDING_ACTION.to_string(),
            unlock_pin: None,
            pending_ref: None,
            updated_at: now,
        }
    }

    pub fn device_status(&self) -> FleetResult<DeviceStatus> {
        self.device_status.parse()
    }

    pub fn pending_action(&self) -> FleetResult<Option<DeviceAction>> {
        pending_action_from_text(&self.pending_action)
    }
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone)]
#[diesel(table_name = host_commands)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct HostCommand {
    pub id: i32,
    pub command_uuid: String,
    pub host_id: i32,
    pub transport: String,
    pub kind: String,
    pub payload: String,
    pub status: String,
    pub result: Option<String>,
    pub exit_code: Option<i32>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl HostCommand {
    pub fn status(&self) -> FleetResult<CommandStatus> {
        self.status.parse()
    }

    pub fn kind(&self) -> FleetResult<CommandKind> {
        self.kind.parse()
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = host_commands)]
pub struct NewHostCommand<'a> {
    pub command_uuid: &'a str,
    pub host_id: i32,
    pub transport: &'a str,
    pub kind: &'a str,
    pub payload: &'a str,
    pub status: &'a str,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone)]
#[diesel(table_name = host_software_installs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SoftwareInstall {
    pub id: i32,
    pub install_uuid: String,
    pub host_id: i32,
    pub name: String,
    pub source: String,
    pub bundle_identifier: Option<String>,
    pub version: Option<String>,
    pub status: String,
    pub acknowledged_at: Option<NaiveDateTime>,
    pub verification_command_uuid: Option<String>,
    pub detail: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl SoftwareInstall {
    pub fn status(&self) -> FleetResult<InstallStatus> {
        self.status.parse()
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = host_software_installs)]
pub struct NewSoftwareInstall<'a> {
    pub install_uuid: &'a str,
    pub host_id: i32,
    pub name: &'a str,
    pub source: &'a str,
    pub bundle_identifier: Option<&'a str>,
    pub version: Option<&'a str>,
    pub status: &'a str,
    pub detail: Option<&'a str>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone)]
#[diesel(table_name = setup_experience_results)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SetupResult {
    pub id: i32,
    pub host_id: i32,
    pub step: String,
    pub name: String,
    pub status: String,
    pub execution_id: String,
    pub setup_item_id: Option<i32>,
    pub updated_at: NaiveDateTime,
}

impl SetupResult {
    pub fn step(&self) -> FleetResult<SetupStep> {
        self.step.parse()
    }

    pub fn status(&self) -> FleetResult<StepStatus> {
        self.status.parse()
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = setup_experience_results)]
pub struct NewSetupResult<'a> {
    pub host_id: i32,
    pub step: &'a str,
    pub name: &'a str,
    pub status: &'a str,
    pub execution_id: &'a str,
    pub setup_item_id: Option<i32>,
    pub updated_at: NaiveDateTime,
}

#[derive(Queryable, Selectable, Insertable, Serialize, Debug, Clone)]
#[diesel(table_name = host_dep_assignments)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DepAssignment {
    pub host_id: i32,
    pub profile_uuid: Option<String>,
    pub assign_profile_response: Option<String>,
    pub response_updated_at: Option<NaiveDateTime>,
    pub retry_job_id: Option<i32>,
    pub added_at: NaiveDateTime,
}

impl DepAssignment {
    pub fn response(&self) -> FleetResult<Option<AssignProfileResponse>> {
        self.assign_profile_response
            .as_deref()
            .map(str::parse)
            .transpose()
    }
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone)]
#[diesel(table_name = jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Job {
    pub id: i32,
    pub name: String,
    pub args: String,
    pub state: String,
    pub retries: i32,
    pub error: Option<String>,
    pub not_before: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = jobs)]
pub struct NewJob<'a> {
    pub name: &'a str,
    pub args: &'a str,
    pub state: &'a str,
    pub retries: i32,
    pub not_before: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_action_text_uses_none_sentinel() {
        assert_eq!(pending_action_to_text(None), "none");
        assert_eq!(pending_action_to_text(Some(DeviceAction::Wipe)), "wipe");
        assert_eq!(pending_action_from_text("none").unwrap(), None);
        assert_eq!(
            pending_action_from_text("unlock").unwrap(),
            Some(DeviceAction::Unlock)
        );
        assert!(pending_action_from_text("reboot").is_err());
    }

    #[test]
    fn platforms_parse_from_lowercase_text() {
        assert_eq!("ipados".parse::<Platform>().unwrap(), Platform::Ipados);
        assert!(Platform::Ios.is_apple());
        assert!(!Platform::Linux.is_apple());
        assert!("darwin".parse::<Platform>().is_err());
    }

    #[test]
    fn only_success_and_failure_are_terminal() {
        assert!(StepStatus::Success.is_terminal());
        assert!(StepStatus::Failure.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
    }
}
