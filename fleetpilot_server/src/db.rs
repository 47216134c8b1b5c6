use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::errors::{FleetError, FleetResult};

pub mod logger;
pub mod pool;

pub use pool::DbPool;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Apply any pending embedded migrations
pub fn run_migrations(conn: &mut SqliteConnection) -> anyhow::Result<()> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("failed to run migrations: {}", e))?;
    for version in applied {
        log::info!("Applied migration {}", version);
    }
    Ok(())
}

/// Run blocking diesel work off the async reactor with a pooled connection.
pub async fn run_blocking<T, F>(pool: &DbPool, f: F) -> FleetResult<T>
where
    F: FnOnce(&mut SqliteConnection) -> FleetResult<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    rocket::tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut *conn)
    })
    .await
    .map_err(|e| FleetError::Internal(format!("blocking task failed: {}", e)))?
}
