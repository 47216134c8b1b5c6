use chrono::Duration;
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};

use crate::errors::FleetResult;
use crate::schema::server_settings;

/// Runtime tunables persisted in the single `server_settings` row.
#[derive(Queryable, Selectable, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[diesel(table_name = server_settings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ServerSettings {
    pub dep_cooldown_seconds: i64,
    pub verification_timeout_seconds: i64,
    pub verification_request_delay_seconds: i64,
    pub schedule_interval_seconds: i64,
    pub worker_interval_seconds: i64,
    pub job_max_retries: i32,
    pub stale_job_seconds: i64,
    pub default_dep_profile_uuid: Option<String>,
}

/// Partial update accepted by `POST /api/settings`.
#[derive(Deserialize, Debug, Default)]
pub struct SettingsUpdate {
    pub dep_cooldown_seconds: Option<i64>,
    pub verification_timeout_seconds: Option<i64>,
    pub verification_request_delay_seconds: Option<i64>,
    pub schedule_interval_seconds: Option<i64>,
    pub worker_interval_seconds: Option<i64>,
    pub job_max_retries: Option<i32>,
    pub stale_job_seconds: Option<i64>,
    pub default_dep_profile_uuid: Option<String>,
}

impl ServerSettings {
    /// Load settings from DB, fallback to default
    pub fn load(conn: &mut SqliteConnection) -> Self {
        match Self::try_load(conn) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Failed to load server settings, using defaults: {}", e);
                Self::default()
            }
        }
    }

    pub fn try_load(conn: &mut SqliteConnection) -> FleetResult<Self> {
        let row = server_settings::table
            .select(ServerSettings::as_select())
            .first::<ServerSettings>(conn)
            .optional()?;
        Ok(row.unwrap_or_default())
    }

    /// Insert or update the single settings row
    pub fn save(&self, conn: &mut SqliteConnection) -> FleetResult<()> {
        let existing: Option<i32> = server_settings::table
            .select(server_settings::id)
            .first(conn)
            .optional()?;

        let values = (
            server_settings::dep_cooldown_seconds.eq(self.dep_cooldown_seconds),
            server_settings::verification_timeout_seconds.eq(self.verification_timeout_seconds),
            server_settings::verification_request_delay_seconds
                .eq(self.verification_request_delay_seconds),
            server_settings::schedule_interval_seconds.eq(self.schedule_interval_seconds),
            server_settings::worker_interval_seconds.eq(self.worker_interval_seconds),
            server_settings::job_max_retries.eq(self.job_max_retries),
            server_settings::stale_job_seconds.eq(self.stale_job_seconds),
            server_settings::default_dep_profile_uuid.eq(self.default_dep_profile_uuid.as_deref()),
        );

        match existing {
            Some(row_id) => {
                diesel::update(server_settings::table.filter(server_settings::id.eq(row_id)))
                    .set(values)
                    .execute(conn)?;
            }
            None => {
                diesel::insert_into(server_settings::table)
                    .values(values)
                    .execute(conn)?;
            }
        }
        Ok(())
    }

    pub fn apply(&mut self, update: SettingsUpdate) {
        if let Some(v) = update.dep_cooldown_seconds {
            self.dep_cooldown_seconds = v.max(0);
        }
        if let Some(v) = update.verification_timeout_seconds {
            self.verification_timeout_seconds = v.max(0);
        }
        if let Some(v) = update.verification_request_delay_seconds {
            self.verification_request_delay_seconds = v.max(0);
        }
        if let Some(v) = update.schedule_interval_seconds {
            self.schedule_interval_seconds = v.max(1);
        }
        if let Some(v) = update.worker_interval_seconds {
            self.worker_interval_seconds = v.max(1);
        }
        if let Some(v) = update.job_max_retries {
            self.job_max_retries = v.max(0);
        }
        if let Some(v) = update.stale_job_seconds {
            self.stale_job_seconds = v.max(1);
        }
        if let Some(v) = update.default_dep_profile_uuid {
            self.default_dep_profile_uuid = if v.is_empty() { None } else { Some(v) };
        }
    }

    pub fn dep_cooldown(&self) -> Duration {
        Duration::seconds(self.dep_cooldown_seconds)
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::seconds(self.verification_timeout_seconds)
    }

    pub fn verification_request_delay(&self) -> Duration {
        Duration::seconds(self.verification_request_delay_seconds)
    }

    pub fn stale_job_after(&self) -> Duration {
        Duration::seconds(self.stale_job_seconds)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            dep_cooldown_seconds: 3600,
            verification_timeout_seconds: 600,
            verification_request_delay_seconds: 5,
            schedule_interval_seconds: 300,
            worker_interval_seconds: 10,
            job_max_retries: 5,
            stale_job_seconds: 900,
            default_dep_profile_uuid: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn missing_row_falls_back_to_defaults() {
        let mut conn = test_support::conn();
        assert_eq!(ServerSettings::load(&mut conn), ServerSettings::default());
    }

    #[test]
    fn save_then_load_keeps_single_row() {
        let mut conn = test_support::conn();
        let mut settings = ServerSettings::default();
        settings.apply(SettingsUpdate {
            dep_cooldown_seconds: Some(120),
            default_dep_profile_uuid: Some("profile-a".into()),
            ..Default::default()
        });
        settings.save(&mut conn).unwrap();

        settings.apply(SettingsUpdate {
            job_max_retries: Some(2),
            ..Default::default()
        });
        settings.save(&mut conn).unwrap();

        let rows: i64 = server_settings::table.count().get_result(&mut conn).unwrap();
        assert_eq!(rows, 1);

        let loaded = ServerSettings::load(&mut conn);
        assert_eq!(loaded.dep_cooldown_seconds, 120);
        assert_eq!(loaded.job_max_retries, 2);
        assert_eq!(loaded.default_dep_profile_uuid.as_deref(), Some("profile-a"));
    }

    #[test]
    fn empty_default_profile_clears_it() {
        let mut settings = ServerSettings {
            default_dep_profile_uuid: Some("profile-a".into()),
            ..Default::default()
        };
        settings.apply(SettingsUpdate {
            default_dep_profile_uuid: Some(String::new()),
            ..Default::default()
        });
        assert_eq!(settings.default_dep_profile_uuid, None);
    }
}
