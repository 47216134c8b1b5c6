pub mod schedule;
pub mod worker;

pub use schedule::ScheduleFairing;
pub use worker::WorkerFairing;

use std::time::Duration;

use crate::state::AppState;

/// Sleep between two ticks, re-read each time so settings edits apply live.
fn interval(state: &AppState, pick: fn(&crate::settings::ServerSettings) -> i64, fallback: i64) -> Duration {
    let seconds = state.settings.read().map(|s| pick(&s)).unwrap_or(fallback);
    Duration::from_secs(seconds.max(1) as u64)
}
