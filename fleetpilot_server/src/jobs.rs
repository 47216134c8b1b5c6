use chrono::{Duration, NaiveDateTime};
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{FleetError, FleetResult};
use crate::models::{Job, JobState, NewJob};
use crate::schema::jobs;

/// Upper bound on the delay between two attempts of the same job.
pub const MAX_BACKOFF_SECONDS: i64 = 300;

diesel::define_sql_function! {
    fn last_insert_rowid() -> diesel::sql_types::Integer;
}

/// Exponential backoff: 2^retries seconds, capped at five minutes.
pub fn backoff(retries: i32) -> Duration {
    let exp = retries.clamp(0, 8) as u32;
    Duration::seconds(2_i64.pow(exp).min(MAX_BACKOFF_SECONDS))
}

pub fn enqueue<A: Serialize>(
    conn: &mut SqliteConnection,
    name: &str,
    args: &A,
    not_before: NaiveDateTime,
    now: NaiveDateTime,
) -> FleetResult<Job> {
    let args = serde_json::to_string(args)?;

    let id = conn.transaction::<_, FleetError, _>(|conn| {
        diesel::insert_into(jobs::table)
            .values(&NewJob {
                name,
                args: &args,
                state: JobState::Queued.as_str(),
                retries: 0,
                not_before,
                created_at: now,
                updated_at: now,
            })
            .execute(conn)?;
        Ok(diesel::select(last_insert_rowid()).get_result::<i32>(conn)?)
    })?;

    log::info!("Queued job {} ({}) not before {}", id, name, not_before);
    get(conn, id)?.ok_or_else(|| FleetError::not_found(format!("job {}", id)))
}

pub fn get(conn: &mut SqliteConnection, job_id: i32) -> FleetResult<Option<Job>> {
    let job = jobs::table
        .find(job_id)
        .select(Job::as_select())
        .first(conn)
        .optional()?;
    Ok(job)
}

/// Atomically move due jobs from `queued` to `running`.
pub fn claim_due(conn: &mut SqliteConnection, now: NaiveDateTime, limit: i64) -> FleetResult<Vec<Job>> {
    let candidates: Vec<Job> = jobs::table
        .filter(jobs::state.eq(JobState::Queued.as_str()))
        .filter(jobs::not_before.le(now))
        .order((jobs::not_before.asc(), jobs::id.asc()))
        .limit(limit)
        .select(Job::as_select())
        .load(conn)?;

    let mut claimed = Vec::with_capacity(candidates.len());
    for mut job in candidates {
        let n = diesel::update(
            jobs::table
                .filter(jobs::id.eq(job.id))
                .filter(jobs::state.eq(JobState::Queued.as_str())),
        )
        .set((
            jobs::state.eq(JobState::Running.as_str()),
            jobs::updated_at.eq(now),
        ))
        .execute(conn)?;

        // another worker got there first
        if n == 1 {
            job.state = JobState::Running.as_str().to_string();
            job.updated_at = now;
            claimed.push(job);
        }
    }
    Ok(claimed)
}

/// Successful jobs are removed from the queue.
pub fn complete(conn: &mut SqliteConnection, job_id: i32) -> FleetResult<()> {
    diesel::delete(jobs::table.filter(jobs::id.eq(job_id))).execute(conn)?;
    Ok(())
}

/// Record a failed attempt; re-queue with backoff or park the job as terminal.
pub fn fail(
    conn: &mut SqliteConnection,
    job: &Job,
    error: &str,
    now: NaiveDateTime,
    max_retries: i32,
) -> FleetResult<JobState> {
    let retries = job.retries + 1;
    let state = if retries > max_retries {
        JobState::Failure
    } else {
        JobState::Queued
    };
    let not_before = now + backoff(retries);

    diesel::update(jobs::table.filter(jobs::id.eq(job.id)))
        .set((
            jobs::state.eq(state.as_str()),
            jobs::retries.eq(retries),
            jobs::error.eq(error),
            jobs::not_before.eq(not_before),
            jobs::updated_at.eq(now),
        ))
        .execute(conn)?;

    match state {
        JobState::Failure => log::error!(
            "Job {} ({}) failed permanently after {} attempts: {}",
            job.id,
            job.name,
            retries,
            error
        ),
        _ => log::warn!(
            "Job {} ({}) failed (attempt {}), retrying at {}: {}",
            job.id,
            job.name,
            retries,
            not_before,
            error
        ),
    }
    Ok(state)
}

fn fail_terminal(conn: &mut SqliteConnection, job: &Job, error: &str, now: NaiveDateTime) -> FleetResult<()> {
    diesel::update(jobs::table.filter(jobs::id.eq(job.id)))
        .set((
            jobs::state.eq(JobState::Failure.as_str()),
            jobs::error.eq(error),
            jobs::updated_at.eq(now),
        ))
        .execute(conn)?;
    log::error!("Job {} ({}) parked: {}", job.id, job.name, error);
    Ok(())
}

/// Put jobs whose worker vanished mid-run back in the queue.
pub fn requeue_stale(
    conn: &mut SqliteConnection,
    now: NaiveDateTime,
    stale_after: Duration,
) -> FleetResult<usize> {
    let n = diesel::update(
        jobs::table
            .filter(jobs::state.eq(JobState::Running.as_str()))
            .filter(jobs::updated_at.lt(now - stale_after)),
    )
    .set((
        jobs::state.eq(JobState::Queued.as_str()),
        jobs::not_before.eq(now),
        jobs::updated_at.eq(now),
    ))
    .execute(conn)?;

    if n > 0 {
        log::warn!("Re-queued {} stale running jobs", n);
    }
    Ok(n)
}

/// A job body. Jobs may run more than once, so `run` must be idempotent.
pub trait JobHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, conn: &mut SqliteConnection, job: &Job, now: NaiveDateTime) -> FleetResult<()>;
}

#[derive(Default, Clone)]
pub struct JobRegistry {
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.name(), handler);
        self
    }

    /// Claim and execute every due job once. Returns how many ran successfully.
    pub fn process_due(
        &self,
        conn: &mut SqliteConnection,
        now: NaiveDateTime,
        max_retries: i32,
        limit: i64,
    ) -> FleetResult<usize> {
        let mut succeeded = 0;

        for job in claim_due(conn, now, limit)? {
            let Some(handler) = self.handlers.get(job.name.as_str()) else {
                fail_terminal(conn, &job, &format!("no handler registered for {}", job.name), now)?;
                continue;
            };

            log::debug!("Running job {} ({}), attempt {}", job.id, job.name, job.retries + 1);
            match handler.run(conn, &job, now) {
                Ok(()) => {
                    complete(conn, job.id)?;
                    succeeded += 1;
                }
                Err(e) => {
                    fail(conn, &job, &e.to_string(), now, max_retries)?;
                }
            }
        }
        Ok(succeeded)
    }
}
